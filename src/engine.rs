use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::backend::HttpBackend;
use crate::billing::BillingReturnHandler;
use crate::clock::{Clock, SystemClock};
use crate::config::EffectiveConfig;
use crate::coordinator::{CoordinatorOptions, Services, SessionCoordinator};
use crate::core::{
    EntitlementSnapshot, RecoveryToken, RenderPayload, ReportIdentity, ScanRequest, SessionError,
    SessionOutcome,
};
use crate::entitlement::EntitlementCache;
use crate::exit;
use crate::identity;
use crate::logs::{self, SessionRecord};
use crate::page::{PARAM_BILLING_SUCCESS, PageAttributes, PageSessionState};
use crate::pending::PendingRenderQueue;
use crate::recovery::{FileStore, RecoveryTokenStore};
use crate::signal::{PageEvents, ReconcileSummary};
use crate::store::FileSnapshotStore;

pub const DEFAULT_TAB: &str = "default";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound for one whole session, on top of per-request timeouts.
    pub timeout: Option<Duration>,
    pub show_progress: bool,
    pub write_logs: bool,
}

pub struct Engine {
    cfg: EffectiveConfig,
    opts: EngineOptions,
    home_dir: PathBuf,
    state_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub analyzer: String,
    pub page_url: String,
    pub tab: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render: Option<RenderPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unlock_events: Vec<ReportIdentity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

enum Action {
    PageLoad,
    Scan(String),
}

impl Engine {
    pub fn new(cfg: EffectiveConfig, opts: EngineOptions) -> Result<Self> {
        let home_dir = effective_home_dir()?;
        let state_dir = cfg.state_dir(&home_dir);
        Ok(Self {
            cfg,
            opts,
            home_dir,
            state_dir,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn config(&self) -> &EffectiveConfig {
        &self.cfg
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn snapshot_store(&self) -> FileSnapshotStore {
        FileSnapshotStore::new(
            self.state_dir.join("snapshots"),
            self.cfg.snapshot_ttl(),
            self.clock.clone(),
        )
    }

    pub fn token_store(&self, tab: &str) -> Result<RecoveryTokenStore> {
        let storage = FileStore::for_tab(&self.state_dir, tab).map_err(exit::invalid_args_err)?;
        Ok(RecoveryTokenStore::new(Arc::new(storage)))
    }

    pub fn compute_report_id(
        &self,
        analyzer: &str,
        raw_input: &str,
        at: Option<OffsetDateTime>,
    ) -> Result<ReportIdentity> {
        let input = identity::normalize_input(raw_input).map_err(session_error)?;
        let at = at.unwrap_or_else(|| self.clock.now());
        Ok(identity::compute_report_id(
            analyzer,
            &input,
            at,
            self.cfg.identity_window(),
        ))
    }

    /// Saves the recovery token and returns the URL checkout should send the
    /// user back to.
    pub fn checkout(
        &self,
        tab: &str,
        page_url: &str,
        report_id: &str,
        input: Option<&str>,
    ) -> Result<String> {
        let id = ReportIdentity::parse(report_id)
            .ok_or_else(|| exit::invalid_args(format!("レポートIDが不正です: {report_id}")))?;
        let page = PageSessionState::parse(page_url).map_err(exit::invalid_args_err)?;
        let input = input.map(str::trim).filter(|s| !s.is_empty()).unwrap_or("");
        self.token_store(tab)?
            .save(&RecoveryToken::new(id.as_str(), input))
            .map_err(exit::backend_failed_err)?;

        let mut url = page.canonical_url(None);
        url.query_pairs_mut().append_pair(PARAM_BILLING_SUCCESS, "true");
        Ok(url.to_string())
    }

    pub fn fetch_entitlements(&self) -> Result<EntitlementSnapshot> {
        let backend = Arc::new(self.http_backend()?);
        let cache = EntitlementCache::new(
            backend,
            self.clock.clone(),
            self.cfg.entitlement_max_age(),
        );
        self.block_on("課金ステータスを取得中...", cache.refresh(true))?
            .map_err(exit::backend_failed_err)
    }

    pub fn run_session(&self, req: &SessionRequest) -> Result<SessionReport> {
        self.drive(req, Action::PageLoad, "session")
    }

    pub fn run_scan(&self, req: &SessionRequest, raw_input: &str) -> Result<SessionReport> {
        self.drive(req, Action::Scan(raw_input.to_string()), "scan")
    }

    fn drive(&self, req: &SessionRequest, action: Action, command: &str) -> Result<SessionReport> {
        let started_at = OffsetDateTime::now_utc();
        let page = PageSessionState::parse(&req.page_url).map_err(exit::invalid_args_err)?;
        let services = self.services(&req.tab)?;
        let mut options = CoordinatorOptions::new(req.analyzer.clone());
        options.billing_timeout = self.cfg.billing_timeout();
        options.identity_window = self.cfg.identity_window();

        let query = page.query().clone();
        let coordinator = SessionCoordinator::new(options, services.clone(), page);
        let handler = BillingReturnHandler::new(services.clone());
        let mut unlocks = services.events.subscribe_unlocks();

        let result = match &action {
            // The coordinator polls first so it reads the token before the
            // handler clears it.
            Action::PageLoad => self.block_on("レポートを準備中...", async {
                tokio::join!(coordinator.run(), handler.reconcile(&query))
            }),
            Action::Scan(raw) => {
                let request = ScanRequest::new(req.analyzer.clone(), raw.clone(), self.clock.now());
                self.block_on("スキャン中...", async {
                    (coordinator.start_scan(request).await, None)
                })
            }
        };

        let mut unlock_events = Vec::new();
        while let Ok(id) = unlocks.try_recv() {
            unlock_events.push(id);
        }

        let rendered: Arc<Mutex<Option<RenderPayload>>> = Arc::new(Mutex::new(None));
        let sink = rendered.clone();
        coordinator.on_ready(Box::new(move |payload| {
            *sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(payload);
        }));
        let render = rendered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let (outcome, reconcile) = match result {
            Ok((Ok(outcome), reconcile)) => (Ok(outcome), reconcile),
            Ok((Err(err), reconcile)) => (Err(session_error(err)), reconcile),
            Err(err) => (Err(err), None),
        };

        let log_path = if self.opts.write_logs {
            let record = SessionRecord {
                command,
                analyzer: &req.analyzer,
                page_url: &req.page_url,
                started_at,
                finished_at: OffsetDateTime::now_utc(),
                outcome: outcome.as_ref().ok(),
                unlock_events: &unlock_events,
                error: outcome.as_ref().err().map(|e| format!("{e:#}")),
            };
            match logs::write_session_log(&self.state_dir, &self.home_dir, &record) {
                Ok(path) => Some(path.display().to_string()),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to write session log");
                    None
                }
            }
        } else {
            None
        };

        Ok(SessionReport {
            outcome: outcome?,
            render,
            reconcile,
            unlock_events,
            log_path,
        })
    }

    fn services(&self, tab: &str) -> Result<Services> {
        let backend = Arc::new(self.http_backend()?);
        let entitlements = Arc::new(EntitlementCache::new(
            backend.clone(),
            self.clock.clone(),
            self.cfg.entitlement_max_age(),
        ));
        debug!(state_dir = %self.state_dir.display(), tab, "wiring session services");
        Ok(Services {
            entitlements,
            tokens: Arc::new(self.token_store(tab)?),
            snapshots: Arc::new(self.snapshot_store()),
            scanner: backend,
            events: Arc::new(PageEvents::new()),
            renders: Arc::new(PendingRenderQueue::new()),
            attributes: Arc::new(PageAttributes::new()),
            clock: self.clock.clone(),
        })
    }

    fn http_backend(&self) -> Result<HttpBackend> {
        HttpBackend::new(&self.cfg.backend.base_url, self.cfg.request_timeout())
            .map_err(exit::invalid_args_err)
    }

    /// Runs `fut` on a fresh current-thread runtime, with a spinner on a TTY
    /// and the optional overall budget.
    fn block_on<F>(&self, message: &'static str, fut: F) -> Result<F::Output>
    where
        F: std::future::Future,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("非同期ランタイムの初期化に失敗しました")?;

        use std::io::IsTerminal;
        let progress_enabled = self.opts.show_progress && std::io::stderr().is_terminal();
        let pb = if progress_enabled {
            let pb = indicatif::ProgressBar::new_spinner();
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            pb.set_message(message);
            pb.enable_steady_tick(Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };

        let budget = self.opts.timeout;
        let out = runtime.block_on(async move {
            match budget {
                Some(budget) => tokio::time::timeout(budget, fut).await.ok(),
                None => Some(fut.await),
            }
        });

        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        out.ok_or_else(|| {
            exit::backend_failed(format!(
                "タイムアウトしました（{}秒）",
                budget.map_or(0, |b| b.as_secs())
            ))
        })
    }
}

fn session_error(err: SessionError) -> anyhow::Error {
    match err {
        SessionError::InvalidInput { .. } => exit::invalid_args_err(err.into()),
        SessionError::ScanFailed { .. } => exit::scan_failed_err(err.into()),
    }
}

pub fn effective_home_dir() -> Result<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("環境変数 HOME が設定されていません"))
}

//! Session Coordinator.
//!
//! One instance per page load. It decides which report to show, whether its
//! paywalled sections are unlocked, and how to recover after a checkout
//! redirect. The state machine runs on the page's single-threaded runtime;
//! its only suspension points are the entitlement fetch, the stored-report
//! load, the scan call and the bounded billing-reconciliation wait.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{ScanBackend, ScanCall};
use crate::clock::Clock;
use crate::core::{
    CoordinatorPhase, NormalizedInput, RecoveryToken, RenderPayload, RenderSource,
    ReportIdentity, ScanRequest, SessionError, SessionOutcome,
};
use crate::entitlement::EntitlementCache;
use crate::identity;
use crate::page::{PageAttributes, PageQuery, PageSessionState};
use crate::pending::{PendingRenderQueue, Renderer};
use crate::recovery::RecoveryTokenStore;
use crate::signal::{PageEvents, RaceOutcome, race};
use crate::store::{SnapshotMeta, SnapshotStore};

pub const DEFAULT_BILLING_TIMEOUT: Duration = Duration::from_millis(4000);

#[derive(Clone)]
pub struct Services {
    pub entitlements: Arc<EntitlementCache>,
    pub tokens: Arc<RecoveryTokenStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub scanner: Arc<dyn ScanBackend>,
    pub events: Arc<PageEvents>,
    pub renders: Arc<PendingRenderQueue<RenderPayload>>,
    pub attributes: Arc<PageAttributes>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub analyzer_key: String,
    pub billing_timeout: Duration,
    pub identity_window: Duration,
}

impl CoordinatorOptions {
    pub fn new(analyzer_key: impl Into<String>) -> Self {
        Self {
            analyzer_key: analyzer_key.into(),
            billing_timeout: DEFAULT_BILLING_TIMEOUT,
            identity_window: identity::DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug)]
struct Progress {
    phase: CoordinatorPhase,
    trace: Vec<CoordinatorPhase>,
    scan_calls: u32,
    rendered: bool,
    unlocked: bool,
}

pub struct SessionCoordinator {
    options: CoordinatorOptions,
    services: Services,
    page: PageSessionState,
    progress: Mutex<Progress>,
    in_flight: Mutex<HashSet<ReportIdentity>>,
    last_input: Mutex<Option<NormalizedInput>>,
}

struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<ReportIdentity>>,
    id: ReportIdentity,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionCoordinator {
    pub fn new(options: CoordinatorOptions, services: Services, page: PageSessionState) -> Self {
        Self {
            options,
            services,
            page,
            progress: Mutex::new(Progress {
                phase: CoordinatorPhase::Init,
                trace: vec![CoordinatorPhase::Init],
                scan_calls: 0,
                rendered: false,
                unlocked: false,
            }),
            in_flight: Mutex::new(HashSet::new()),
            last_input: Mutex::new(None),
        }
    }

    pub fn analyzer_key(&self) -> &str {
        &self.options.analyzer_key
    }

    pub fn phase(&self) -> CoordinatorPhase {
        lock(&self.progress).phase
    }

    pub fn trace(&self) -> Vec<CoordinatorPhase> {
        lock(&self.progress).trace.clone()
    }

    pub fn active_report_identity(&self) -> Option<ReportIdentity> {
        self.services.attributes.active_report()
    }

    pub fn has_access(&self, id: &ReportIdentity) -> bool {
        self.services.entitlements.has_access(id)
    }

    pub fn on_ready(&self, renderer: Renderer<RenderPayload>) {
        self.services.renders.register_renderer(renderer);
    }

    pub async fn run(&self) -> Result<SessionOutcome, SessionError> {
        self.restart();
        let query = self.page.query().clone();
        if let Some(id) = &query.report_id {
            self.tag(id);
        }
        let token = self.services.tokens.read();

        if query.billing_success {
            return Ok(self.reconcile_billing_return(&query, token).await);
        }

        if let Some(id) = query.report_id.clone() {
            if let Some(token) = token {
                if token.report_identity_hint != id.as_str() {
                    info!(
                        report_id = %id,
                        hint = %token.report_identity_hint,
                        "url report_id outranks recovery token"
                    );
                }
                self.clear_token();
            }
            return self.try_stored(id, query.url.clone(), true).await;
        }

        if let Some(token) = token {
            return self.recover_from_token(token, query.url.clone()).await;
        }

        self.fresh_or_idle(query.url.clone()).await
    }

    /// Manual scan. A second call for an identity that is still being
    /// scanned returns without calling the backend.
    pub async fn start_scan(&self, request: ScanRequest) -> Result<SessionOutcome, SessionError> {
        let input = match identity::normalize_input(&request.raw_input) {
            Ok(input) => input,
            Err(err) => {
                self.restart();
                self.enter(CoordinatorPhase::Idle);
                return Err(err);
            }
        };
        let id = identity::compute_report_id(
            &self.options.analyzer_key,
            &input,
            request.requested_at,
            self.options.identity_window,
        );
        let Some(guard) = self.begin_flight(&id) else {
            debug!(report_id = %id, "scan already in flight");
            return Ok(self.in_flight_outcome(id));
        };

        self.restart();
        self.enter(CoordinatorPhase::FreshOrIdle);
        self.tag(&id);
        self.scan_under(guard, id, Some(input)).await
    }

    pub async fn retry_scan(&self) -> Result<SessionOutcome, SessionError> {
        let Some(id) = self.active_report_identity() else {
            return Err(SessionError::invalid_input(
                "",
                "再試行できるレポートがありません",
            ));
        };
        let Some(guard) = self.begin_flight(&id) else {
            return Ok(self.in_flight_outcome(id));
        };
        let input = lock(&self.last_input).clone();
        self.enter(CoordinatorPhase::AutoRescan);
        self.scan_under(guard, id, input).await
    }

    async fn reconcile_billing_return(
        &self,
        query: &PageQuery,
        token: Option<RecoveryToken>,
    ) -> SessionOutcome {
        let signal = self.services.events.billing_reconciled();

        // A fired signal means the handler's forced refresh already landed.
        let waited = match signal.value() {
            Some(summary) => RaceOutcome::Signalled(summary),
            None => {
                self.services.entitlements.mark_stale();
                self.enter(CoordinatorPhase::AwaitBillingReconcile);
                race(signal.wait(), self.options.billing_timeout).await
            }
        };

        // One reconciliation attempt per token, whatever its result.
        self.clear_token();

        match waited {
            RaceOutcome::Signalled(summary) => {
                if let Some(id) = &summary.report_id {
                    self.tag(id);
                }
                {
                    let mut progress = lock(&self.progress);
                    progress.rendered |= summary.restored;
                    progress.unlocked |= summary.confirmed;
                }
                self.enter(CoordinatorPhase::ResultsRestored);
                self.outcome()
            }
            RaceOutcome::TimedOut => {
                warn!(
                    timeout_ms = self.options.billing_timeout.as_millis() as u64,
                    "billing reconciliation timed out; degrading"
                );
                self.enter(CoordinatorPhase::Degraded);
                let identity = query.report_id.clone().or_else(|| {
                    token
                        .as_ref()
                        .and_then(|t| ReportIdentity::parse(&t.report_identity_hint))
                });
                if let Some(id) = identity {
                    self.tag(&id);
                    match self.services.snapshots.load(&id).await {
                        Ok(Some(report)) => {
                            let unlocked = self.has_access(&id);
                            self.render(RenderPayload {
                                report_id: id,
                                source: RenderSource::Degraded,
                                unlocked,
                                input_hint: report.input.map(|i| i.as_str().to_string()),
                                payload: report.payload,
                            });
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(error = %format!("{err:#}"), "degraded: stored snapshot unreadable")
                        }
                    }
                }
                self.outcome()
            }
        }
    }

    async fn recover_from_token(
        &self,
        token: RecoveryToken,
        url_hint: Option<String>,
    ) -> Result<SessionOutcome, SessionError> {
        self.enter(CoordinatorPhase::RecoverFromToken);

        let Some(id) = ReportIdentity::parse(&token.report_identity_hint) else {
            warn!(hint = %token.report_identity_hint, "recovery token names a malformed identity");
            self.clear_token();
            return self.fresh_or_idle(url_hint).await;
        };

        self.refresh_forced(Some(&id)).await;
        self.clear_token();

        if self.has_access(&id) {
            self.tag(&id);
            let input = url_hint.or_else(|| token.input().map(str::to_string));
            return self.try_stored(id, input, false).await;
        }
        debug!(report_id = %id, "recovery token not confirmed by entitlement");
        self.fresh_or_idle(url_hint).await
    }

    async fn try_stored(
        &self,
        id: ReportIdentity,
        raw_input: Option<String>,
        refresh: bool,
    ) -> Result<SessionOutcome, SessionError> {
        self.enter(CoordinatorPhase::TryStored);
        if refresh {
            self.refresh_forced(Some(&id)).await;
        }
        let access = self.has_access(&id);

        match self.services.snapshots.load(&id).await {
            Ok(Some(report)) => {
                self.enter(CoordinatorPhase::DisplayStored);
                self.render(RenderPayload {
                    report_id: id,
                    source: RenderSource::Stored,
                    unlocked: access,
                    input_hint: report
                        .input
                        .map(|i| i.as_str().to_string())
                        .or(raw_input),
                    payload: report.payload,
                });
                return Ok(self.outcome());
            }
            Ok(None) => debug!(report_id = %id, "no stored snapshot"),
            Err(err) => {
                warn!(report_id = %id, error = %format!("{err:#}"), "stored snapshot unreadable")
            }
        }

        if !access {
            return self.fresh_or_idle(raw_input).await;
        }

        let input = raw_input.as_deref().and_then(|raw| match identity::normalize_input(raw) {
            Ok(input) => Some(input),
            Err(err) => {
                warn!(error = %err, "ignoring unscannable input hint for rescan");
                None
            }
        });
        let Some(guard) = self.begin_flight(&id) else {
            return Ok(self.in_flight_outcome(id));
        };
        self.enter(CoordinatorPhase::AutoRescan);
        self.scan_under(guard, id, input).await
    }

    async fn fresh_or_idle(
        &self,
        url_hint: Option<String>,
    ) -> Result<SessionOutcome, SessionError> {
        self.enter(CoordinatorPhase::FreshOrIdle);
        let Some(raw) = url_hint else {
            self.enter(CoordinatorPhase::Idle);
            return Ok(self.outcome());
        };

        let request = ScanRequest::new(
            self.options.analyzer_key.clone(),
            raw,
            self.services.clock.now(),
        );
        let input = match identity::normalize_input(&request.raw_input) {
            Ok(input) => input,
            Err(err) => {
                self.enter(CoordinatorPhase::Idle);
                return Err(err);
            }
        };
        let id = identity::compute_report_id(
            &self.options.analyzer_key,
            &input,
            request.requested_at,
            self.options.identity_window,
        );
        let Some(guard) = self.begin_flight(&id) else {
            return Ok(self.in_flight_outcome(id));
        };
        self.tag(&id);
        self.scan_under(guard, id, Some(input)).await
    }

    // Holds the flight guard until the snapshot is saved and rendered.
    async fn scan_under(
        &self,
        _guard: FlightGuard<'_>,
        id: ReportIdentity,
        input: Option<NormalizedInput>,
    ) -> Result<SessionOutcome, SessionError> {
        *lock(&self.last_input) = input.clone();
        lock(&self.progress).scan_calls += 1;

        let call = ScanCall {
            report_id: id.clone(),
            input,
        };
        let result = self
            .services
            .scanner
            .scan(&self.options.analyzer_key, &call)
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.enter(CoordinatorPhase::Idle);
                return Err(SessionError::ScanFailed {
                    report_id: id,
                    message: format!("{err:#}"),
                });
            }
        };
        if let Some(message) = response.failure() {
            self.enter(CoordinatorPhase::Idle);
            return Err(SessionError::ScanFailed {
                report_id: id,
                message,
            });
        }
        if let Some(returned) = response.report_id.as_deref() {
            if returned != id.as_str() {
                warn!(report_id = %id, returned, "backend returned a different report id; keeping ours");
            }
        }

        let payload = response.into_payload();
        let meta = SnapshotMeta {
            analyzer_key: self.options.analyzer_key.clone(),
            input: call.input.clone(),
            saved_at: self.services.clock.now(),
        };
        if let Err(err) = self.services.snapshots.save(&id, &payload, &meta).await {
            warn!(report_id = %id, error = %format!("{err:#}"), "failed to persist report snapshot");
        }

        let unlocked = self.has_access(&id);
        self.enter(CoordinatorPhase::DisplayFresh);
        self.render(RenderPayload {
            report_id: id,
            source: RenderSource::Fresh,
            unlocked,
            input_hint: call.input.map(|i| i.as_str().to_string()),
            payload,
        });
        Ok(self.outcome())
    }

    async fn refresh_forced(&self, watch: Option<&ReportIdentity>) {
        let before = watch.map(|id| self.has_access(id));
        if let Err(err) = self.services.entitlements.refresh(true).await {
            warn!(error = %format!("{err:#}"), "entitlement refresh failed; unconfirmed reports stay locked");
        }
        if let (Some(id), Some(false)) = (watch, before) {
            if self.has_access(id) {
                self.services.events.emit_unlocked(id.clone());
            }
        }
    }

    fn begin_flight(&self, id: &ReportIdentity) -> Option<FlightGuard<'_>> {
        if !lock(&self.in_flight).insert(id.clone()) {
            return None;
        }
        Some(FlightGuard {
            in_flight: &self.in_flight,
            id: id.clone(),
        })
    }

    fn restart(&self) {
        let mut progress = lock(&self.progress);
        progress.phase = CoordinatorPhase::Init;
        progress.trace = vec![CoordinatorPhase::Init];
        progress.rendered = false;
        progress.unlocked = false;
    }

    fn enter(&self, phase: CoordinatorPhase) {
        let mut progress = lock(&self.progress);
        debug!(
            analyzer = %self.options.analyzer_key,
            from = %progress.phase,
            to = %phase,
            "coordinator phase"
        );
        progress.phase = phase;
        progress.trace.push(phase);
    }

    fn tag(&self, id: &ReportIdentity) {
        self.services.attributes.tag(id);
    }

    fn clear_token(&self) {
        if let Err(err) = self.services.tokens.clear() {
            warn!(error = %format!("{err:#}"), "failed to clear recovery token");
        }
    }

    fn render(&self, payload: RenderPayload) {
        {
            let mut progress = lock(&self.progress);
            progress.rendered = true;
            progress.unlocked = payload.unlocked;
        }
        self.services.renders.offer(payload);
    }

    fn outcome(&self) -> SessionOutcome {
        let active = self.active_report_identity();
        let progress = lock(&self.progress);
        SessionOutcome {
            phase: progress.phase,
            trace: progress.trace.clone(),
            report_id: active.clone(),
            unlocked: progress.unlocked,
            rendered: progress.rendered,
            scan_calls: progress.scan_calls,
            in_flight: false,
            canonical_url: Some(self.page.canonical_url(active.as_ref()).to_string()),
        }
    }

    fn in_flight_outcome(&self, id: ReportIdentity) -> SessionOutcome {
        let mut outcome = self.outcome();
        outcome.report_id = Some(id);
        outcome.in_flight = true;
        outcome
    }
}

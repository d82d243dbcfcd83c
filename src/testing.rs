use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use time::OffsetDateTime;
use time::macros::datetime;

use crate::backend::{ScanBackend, ScanCall, ScanResponse};
use crate::billing::BillingReturnHandler;
use crate::clock::ManualClock;
use crate::coordinator::{CoordinatorOptions, Services, SessionCoordinator};
use crate::core::{RecoveryToken, RenderPayload, ReportIdentity, StoredReport};
use crate::entitlement::{BillingBackend, BillingStatus, EntitlementCache};
use crate::identity;
use crate::page::{PageAttributes, PageSessionState};
use crate::pending::PendingRenderQueue;
use crate::recovery::{MemoryStore, RecoveryTokenStore};
use crate::signal::PageEvents;
use crate::store::{MemorySnapshotStore, SnapshotMeta, SnapshotStore};

pub const PAGE: &str = "https://app.example/analyzers/seo";
pub const START: OffsetDateTime = datetime!(2026-03-01 12:00:10 UTC);

pub struct FakeBilling {
    status: Mutex<Option<BillingStatus>>,
    script: Mutex<VecDeque<(Duration, Option<BillingStatus>)>>,
    calls: AtomicU32,
}

impl FakeBilling {
    pub fn status(ids: &[&str]) -> BillingStatus {
        BillingStatus {
            is_pro: false,
            purchased_report_ids: ids.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    pub fn purchased(ids: &[&str]) -> Self {
        Self {
            status: Mutex::new(Some(Self::status(ids))),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing() -> Self {
        let fake = Self::purchased(&[]);
        fake.set_status(None);
        fake
    }

    pub fn set_status(&self, status: Option<BillingStatus>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn push_scripted(&self, delay: Duration, status: Option<BillingStatus>) {
        self.script.lock().unwrap().push_back((delay, status));
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingBackend for FakeBilling {
    async fn fetch_status(&self) -> Result<BillingStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        let (delay, status) =
            scripted.unwrap_or_else(|| (Duration::ZERO, self.status.lock().unwrap().clone()));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        status.ok_or_else(|| anyhow!("billing-status unavailable"))
    }
}

pub struct FakeScanner {
    calls: Mutex<Vec<(String, ScanCall)>>,
    failure: Mutex<Option<String>>,
    delay: Duration,
}

impl FakeScanner {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            delay,
        }
    }

    pub fn fail_with(&self, message: Option<&str>) {
        *self.failure.lock().unwrap() = message.map(|s| s.to_string());
    }

    pub fn calls(&self) -> Vec<(String, ScanCall)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScanBackend for FakeScanner {
    async fn scan(&self, analyzer_key: &str, call: &ScanCall) -> Result<ScanResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((analyzer_key.to_string(), call.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(anyhow!(message));
        }
        let mut payload = serde_json::Map::new();
        payload.insert(
            "target".to_string(),
            serde_json::Value::String(
                call.input
                    .as_ref()
                    .map(|i| i.as_str().to_string())
                    .unwrap_or_default(),
            ),
        );
        Ok(ScanResponse {
            report_id: Some(call.report_id.to_string()),
            screenshot_url: None,
            success: Some(true),
            error: None,
            payload,
        })
    }
}

pub struct BrokenSnapshotStore;

#[async_trait]
impl SnapshotStore for BrokenSnapshotStore {
    async fn load(&self, _id: &ReportIdentity) -> Result<Option<StoredReport>> {
        Err(anyhow!("snapshot store unreadable"))
    }

    async fn save(
        &self,
        _id: &ReportIdentity,
        _payload: &serde_json::Value,
        _meta: &SnapshotMeta,
    ) -> Result<()> {
        Err(anyhow!("snapshot store unwritable"))
    }
}

pub struct SlowSaveStore {
    pub inner: Arc<MemorySnapshotStore>,
    pub delay: Duration,
}

#[async_trait]
impl SnapshotStore for SlowSaveStore {
    async fn load(&self, id: &ReportIdentity) -> Result<Option<StoredReport>> {
        self.inner.load(id).await
    }

    async fn save(
        &self,
        id: &ReportIdentity,
        payload: &serde_json::Value,
        meta: &SnapshotMeta,
    ) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.save(id, payload, meta).await
    }
}

pub struct Harness {
    pub billing: Arc<FakeBilling>,
    pub scanner: Arc<FakeScanner>,
    pub snapshots: Arc<MemorySnapshotStore>,
    pub clock: Arc<ManualClock>,
    pub services: Services,
}

impl Harness {
    pub fn new(billing: FakeBilling) -> Self {
        Self::with_scanner(billing, FakeScanner::new())
    }

    pub fn with_scanner(billing: FakeBilling, scanner: FakeScanner) -> Self {
        let billing = Arc::new(billing);
        let scanner = Arc::new(scanner);
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let services = Services {
            entitlements: Arc::new(EntitlementCache::new(
                billing.clone(),
                clock.clone(),
                std::time::Duration::from_secs(300),
            )),
            tokens: Arc::new(RecoveryTokenStore::new(Arc::new(MemoryStore::new()))),
            snapshots: snapshots.clone(),
            scanner: scanner.clone(),
            events: Arc::new(PageEvents::new()),
            renders: Arc::new(PendingRenderQueue::new()),
            attributes: Arc::new(PageAttributes::new()),
            clock: clock.clone(),
        };
        Self {
            billing,
            scanner,
            snapshots,
            clock,
            services,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.services.snapshots = store;
        self
    }

    pub fn store_report(&self, id: &str, input: &str) {
        self.snapshots.insert(StoredReport {
            report_id: id.parse().unwrap(),
            analyzer_key: "seo".to_string(),
            input: Some(identity::normalize_input(input).unwrap()),
            saved_at: START,
            payload: serde_json::json!({ "score": 87 }),
        });
    }

    pub fn save_token(&self, hint: &str, input: &str) {
        self.services
            .tokens
            .save(&RecoveryToken::new(hint, input))
            .unwrap();
    }

    pub fn token(&self) -> Option<RecoveryToken> {
        self.services.tokens.read()
    }

    pub fn coordinator(&self, query: &str) -> SessionCoordinator {
        let page = PageSessionState::parse(&format!("{PAGE}{query}")).unwrap();
        SessionCoordinator::new(CoordinatorOptions::new("seo"), self.services.clone(), page)
    }

    pub fn handler(&self) -> BillingReturnHandler {
        BillingReturnHandler::new(self.services.clone())
    }

    pub fn collect_renders(&self) -> Arc<Mutex<Vec<RenderPayload>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        self.services
            .renders
            .register_renderer(Box::new(move |payload| sink.lock().unwrap().push(payload)));
        seen
    }
}

pub fn rid(s: &str) -> ReportIdentity {
    s.parse().unwrap()
}

//! Entitlement Cache.
//!
//! Wraps `GET billing-status`. A failed fetch keeps the last good snapshot,
//! so identities it does not already grant stay locked.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::core::{EntitlementSnapshot, ReportIdentity};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingStatus {
    #[serde(default)]
    pub is_pro: bool,
    #[serde(default)]
    pub purchased_report_ids: Vec<String>,
}

#[async_trait]
pub trait BillingBackend: Send + Sync {
    async fn fetch_status(&self) -> Result<BillingStatus>;
}

#[derive(Debug)]
struct CacheState {
    snapshot: EntitlementSnapshot,
    stale: bool,
}

pub struct EntitlementCache {
    backend: Arc<dyn BillingBackend>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
    state: Mutex<CacheState>,
}

impl EntitlementCache {
    pub fn new(backend: Arc<dyn BillingBackend>, clock: Arc<dyn Clock>, max_age: Duration) -> Self {
        Self {
            backend,
            clock,
            max_age,
            state: Mutex::new(CacheState {
                snapshot: EntitlementSnapshot::empty(),
                stale: false,
            }),
        }
    }

    pub fn snapshot(&self) -> EntitlementSnapshot {
        self.lock().snapshot.clone()
    }

    pub fn has_access(&self, id: &ReportIdentity) -> bool {
        self.lock().snapshot.grants(id)
    }

    /// Called on a billing return: the cached snapshot may predate the purchase.
    pub fn mark_stale(&self) {
        self.lock().stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.lock().stale
    }

    pub async fn refresh(&self, force: bool) -> Result<EntitlementSnapshot> {
        if !force {
            if let Some(cached) = self.cached_if_fresh() {
                return Ok(cached);
            }
        }

        let issued_at = self.clock.now();
        let status = self
            .backend
            .fetch_status()
            .await
            .context("課金ステータスの取得に失敗しました")?;

        let mut purchased_ids = std::collections::BTreeSet::new();
        for raw in &status.purchased_report_ids {
            match ReportIdentity::parse(raw) {
                Some(id) => {
                    purchased_ids.insert(id);
                }
                None => warn!(report_id = %raw, "ignoring malformed purchased report id"),
            }
        }
        let fetched = EntitlementSnapshot {
            is_pro: status.is_pro,
            purchased_ids,
            fetched_at: issued_at,
        };

        let mut state = self.lock();
        if fetched.fetched_at < state.snapshot.fetched_at {
            debug!(
                issued_at = %fetched.fetched_at,
                cached_at = %state.snapshot.fetched_at,
                "discarding entitlement result older than cached snapshot"
            );
            return Ok(state.snapshot.clone());
        }
        state.snapshot = fetched;
        if force {
            state.stale = false;
        }
        debug!(
            is_pro = state.snapshot.is_pro,
            purchased = state.snapshot.purchased_ids.len(),
            force,
            "entitlement snapshot refreshed"
        );
        Ok(state.snapshot.clone())
    }

    fn cached_if_fresh(&self) -> Option<EntitlementSnapshot> {
        let state = self.lock();
        if state.stale || state.snapshot.fetched_at == time::OffsetDateTime::UNIX_EPOCH {
            return None;
        }
        let age = self.clock.now() - state.snapshot.fetched_at;
        if age < time::Duration::ZERO || age.unsigned_abs() >= self.max_age {
            return None;
        }
        Some(state.snapshot.clone())
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

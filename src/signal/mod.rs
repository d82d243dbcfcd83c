use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::core::ReportIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutcome<T> {
    Signalled(T),
    TimedOut,
}

/// Waits for `signal` for at most `timeout`. The signal future is dropped on expiry.
pub async fn race<F>(signal: F, timeout: Duration) -> RaceOutcome<F::Output>
where
    F: Future,
{
    match tokio::time::timeout(timeout, signal).await {
        Ok(value) => RaceOutcome::Signalled(value),
        Err(_) => RaceOutcome::TimedOut,
    }
}

/// One-shot signal: fires at most once, late waiters see the fired value.
pub struct PageSignal<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for PageSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PageSignal<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Returns false if the signal had already fired; the first value wins.
    pub fn fire(&self, value: T) -> bool {
        let mut fired = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            fired = true;
            true
        });
        fired
    }

    pub fn has_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn value(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<ReportIdentity>,
    pub confirmed: bool,
    pub restored: bool,
}

pub struct PageEvents {
    billing_reconciled: PageSignal<ReconcileSummary>,
    unlocked: broadcast::Sender<ReportIdentity>,
}

impl Default for PageEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl PageEvents {
    pub fn new() -> Self {
        let (unlocked, _rx) = broadcast::channel(16);
        Self {
            billing_reconciled: PageSignal::new(),
            unlocked,
        }
    }

    pub fn billing_reconciled(&self) -> &PageSignal<ReconcileSummary> {
        &self.billing_reconciled
    }

    pub fn emit_unlocked(&self, id: ReportIdentity) {
        // No listener is not an error: the page may not show a locked section.
        let _ = self.unlocked.send(id);
    }

    pub fn subscribe_unlocks(&self) -> broadcast::Receiver<ReportIdentity> {
        self.unlocked.subscribe()
    }
}

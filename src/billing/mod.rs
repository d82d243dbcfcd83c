//! Billing return handler.
//!
//! Runs alongside the coordinator on the page that follows a checkout
//! redirect. It confirms the purchase, restores the report through the
//! pending-render queue and then fires the reconciliation signal the
//! coordinator is waiting on.

use tracing::{debug, warn};

use crate::coordinator::Services;
use crate::core::{RenderPayload, RenderSource, ReportIdentity};
use crate::page::PageQuery;
use crate::signal::ReconcileSummary;

pub struct BillingReturnHandler {
    services: Services,
}

impl BillingReturnHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Returns `None` when there is nothing to reconcile or entitlement could
    /// not be confirmed; the signal stays unfired in both cases.
    pub async fn reconcile(&self, query: &PageQuery) -> Option<ReconcileSummary> {
        if !query.billing_success {
            return None;
        }
        let services = &self.services;
        services.entitlements.mark_stale();

        let token = services.tokens.read();
        let identity = query.report_id.clone().or_else(|| {
            token
                .as_ref()
                .and_then(|t| ReportIdentity::parse(&t.report_identity_hint))
        });
        let input_hint = query
            .url
            .clone()
            .or_else(|| token.as_ref().and_then(|t| t.input().map(str::to_string)));

        if let Err(err) = services.entitlements.refresh(true).await {
            warn!(error = %format!("{err:#}"), "billing return: entitlement refresh failed");
            return None;
        }

        let confirmed = identity
            .as_ref()
            .is_some_and(|id| services.entitlements.has_access(id));
        let mut restored = false;
        if let (Some(id), true) = (identity.as_ref(), confirmed) {
            services.attributes.tag(id);
            services.events.emit_unlocked(id.clone());
            match services.snapshots.load(id).await {
                Ok(Some(report)) => {
                    services.renders.offer(RenderPayload {
                        report_id: id.clone(),
                        source: RenderSource::Restored,
                        unlocked: true,
                        input_hint: report
                            .input
                            .as_ref()
                            .map(|i| i.as_str().to_string())
                            .or(input_hint),
                        payload: report.payload,
                    });
                    restored = true;
                }
                Ok(None) => debug!(report_id = %id, "billing return: no stored snapshot to restore"),
                Err(err) => {
                    warn!(report_id = %id, error = %format!("{err:#}"), "billing return: stored snapshot unreadable")
                }
            }
        }

        if let Err(err) = services.tokens.clear() {
            warn!(error = %format!("{err:#}"), "billing return: failed to clear recovery token");
        }

        let summary = ReconcileSummary {
            report_id: identity,
            confirmed,
            restored,
        };
        services.events.billing_reconciled().fire(summary.clone());
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RecoveryToken;
    use crate::page::PageSessionState;
    use crate::testing::{FakeBilling, Harness, PAGE, rid};

    fn query(q: &str) -> PageQuery {
        PageSessionState::parse(&format!("{PAGE}{q}"))
            .unwrap()
            .query()
            .clone()
    }

    #[tokio::test]
    async fn ignores_pages_without_the_billing_flag() {
        let h = Harness::new(FakeBilling::purchased(&["abc123"]));
        h.save_token("abc123", "example.com");

        assert!(h.handler().reconcile(&query("?report_id=abc123")).await.is_none());
        assert_eq!(h.billing.calls(), 0);
        assert!(h.token().is_some());
        assert!(!h.services.entitlements.is_stale());
    }

    #[tokio::test]
    async fn confirmed_purchase_restores_and_unlocks() {
        let h = Harness::new(FakeBilling::purchased(&["abc123"]));
        h.store_report("abc123", "example.com");
        h.save_token("abc123", "example.com");
        let mut unlocks = h.services.events.subscribe_unlocks();

        let summary = h
            .handler()
            .reconcile(&query("?billing_success=true"))
            .await
            .unwrap();

        assert_eq!(summary.report_id, Some(rid("abc123")));
        assert!(summary.confirmed && summary.restored);
        assert!(h.services.renders.has_buffered());
        assert_eq!(h.services.attributes.active_report(), Some(rid("abc123")));
        assert_eq!(unlocks.try_recv().ok(), Some(rid("abc123")));
        assert!(!h.services.entitlements.is_stale());
        assert!(h.token().is_none());
        assert_eq!(h.services.events.billing_reconciled().value(), Some(summary));
    }

    #[tokio::test]
    async fn unconfirmed_purchase_still_fires_without_restoring() {
        let h = Harness::new(FakeBilling::purchased(&[]));
        h.store_report("abc123", "example.com");

        let summary = h
            .handler()
            .reconcile(&query("?billing_success=1&report_id=abc123"))
            .await
            .unwrap();

        assert!(!summary.confirmed);
        assert!(!summary.restored);
        assert!(!h.services.renders.has_buffered());
        assert!(h.services.events.billing_reconciled().has_fired());
    }

    #[tokio::test]
    async fn refresh_failure_leaves_the_signal_unfired() {
        let h = Harness::new(FakeBilling::failing());
        h.services
            .tokens
            .save(&RecoveryToken::new("abc123", "example.com"))
            .unwrap();

        assert!(h.handler().reconcile(&query("?billing_success=true")).await.is_none());
        assert!(!h.services.events.billing_reconciled().has_fired());
        assert!(h.services.entitlements.is_stale());
        assert!(h.token().is_some());
    }
}

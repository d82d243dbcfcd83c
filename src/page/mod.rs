use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use tracing::warn;
use url::Url;

use crate::core::ReportIdentity;

pub const PARAM_REPORT_ID: &str = "report_id";
pub const PARAM_URL: &str = "url";
pub const PARAM_BILLING_SUCCESS: &str = "billing_success";
pub const ACTIVE_REPORT_ATTRIBUTE: &str = "data-report-id";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageQuery {
    pub report_id: Option<ReportIdentity>,
    pub url: Option<String>,
    pub billing_success: bool,
}

impl PageQuery {
    pub fn from_url(url: &Url) -> Self {
        let mut query = PageQuery::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                PARAM_REPORT_ID => {
                    let value = value.trim();
                    if value.is_empty() {
                        continue;
                    }
                    match ReportIdentity::parse(value) {
                        Some(id) => query.report_id = Some(id),
                        None => warn!(report_id = %value, "ignoring malformed report_id parameter"),
                    }
                }
                PARAM_URL => {
                    let value = value.trim();
                    if !value.is_empty() {
                        query.url = Some(value.to_string());
                    }
                }
                PARAM_BILLING_SUCCESS => {
                    query.billing_success = matches!(
                        value.trim().to_ascii_lowercase().as_str(),
                        "true" | "1" | "yes"
                    );
                }
                _ => {}
            }
        }
        query
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSessionState {
    page_url: Url,
    query: PageQuery,
}

impl PageSessionState {
    pub fn parse(page_url: &str) -> Result<Self> {
        let url = Url::parse(page_url.trim())
            .with_context(|| format!("ページURLを解析できません: {page_url}"))?;
        Ok(Self::from_url(url))
    }

    pub fn from_url(page_url: Url) -> Self {
        let query = PageQuery::from_url(&page_url);
        Self { page_url, query }
    }

    pub fn query(&self) -> &PageQuery {
        &self.query
    }

    pub fn page_url(&self) -> &Url {
        &self.page_url
    }

    /// The URL to show after the session settles: `report_id` carries the
    /// active identity across reloads and the one-shot billing flag is dropped.
    pub fn canonical_url(&self, active: Option<&ReportIdentity>) -> Url {
        let kept: Vec<(String, String)> = self
            .page_url
            .query_pairs()
            .filter(|(k, _)| k != PARAM_REPORT_ID && k != PARAM_BILLING_SUCCESS)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut url = self.page_url.clone();
        url.set_query(None);
        if kept.is_empty() && active.is_none() {
            return url;
        }
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(id) = active {
                pairs.append_pair(PARAM_REPORT_ID, id.as_str());
            }
            for (k, v) in &kept {
                pairs.append_pair(k, v);
            }
        }
        url
    }
}

/// Page attribute shared by independently loaded scripts on one page.
#[derive(Debug, Default)]
pub struct PageAttributes {
    active_report: Mutex<Option<ReportIdentity>>,
}

impl PageAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&self, id: &ReportIdentity) {
        *self.lock() = Some(id.clone());
    }

    pub fn active_report(&self) -> Option<ReportIdentity> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ReportIdentity>> {
        self.active_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_parameters() {
        let state = PageSessionState::parse(
            "https://diag.example/ip-reputation?report_id=abc123&url=example.com&billing_success=true&lang=ja",
        )
        .expect("parse");
        let q = state.query();
        assert_eq!(q.report_id.as_ref().map(|id| id.as_str()), Some("abc123"));
        assert_eq!(q.url.as_deref(), Some("example.com"));
        assert!(q.billing_success);
    }

    #[test]
    fn missing_or_malformed_parameters_read_as_absent() {
        let state = PageSessionState::parse(
            "https://diag.example/ip-reputation?report_id=a%20b&url=&billing_success=nope",
        )
        .expect("parse");
        assert_eq!(state.query(), &PageQuery::default());
    }

    #[test]
    fn canonical_url_sets_identity_and_drops_billing_flag() {
        let state = PageSessionState::parse(
            "https://diag.example/ip-reputation?billing_success=true&lang=ja&report_id=old",
        )
        .expect("parse");
        let id = ReportIdentity::parse("abc123").unwrap();
        assert_eq!(
            state.canonical_url(Some(&id)).as_str(),
            "https://diag.example/ip-reputation?report_id=abc123&lang=ja"
        );
        let bare = PageSessionState::parse("https://diag.example/x?billing_success=1").unwrap();
        assert_eq!(bare.canonical_url(None).as_str(), "https://diag.example/x");
    }

    #[test]
    fn attributes_track_latest_tag() {
        let attrs = PageAttributes::new();
        assert!(attrs.active_report().is_none());
        attrs.tag(&ReportIdentity::parse("one").unwrap());
        attrs.tag(&ReportIdentity::parse("two").unwrap());
        assert_eq!(attrs.active_report().map(|id| id.to_string()), Some("two".into()));
    }
}

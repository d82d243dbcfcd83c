use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::ReportIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub is_pro: bool,
    pub purchased_ids: BTreeSet<ReportIdentity>,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
}

impl EntitlementSnapshot {
    /// Snapshot before anything was fetched: grants nothing.
    pub fn empty() -> Self {
        Self {
            is_pro: false,
            purchased_ids: BTreeSet::new(),
            fetched_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    pub fn grants(&self, id: &ReportIdentity) -> bool {
        self.is_pro || self.purchased_ids.contains(id)
    }
}

impl Default for EntitlementSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

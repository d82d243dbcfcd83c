use serde::Serialize;

use crate::core::{CoordinatorPhase, ReportIdentity};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub phase: CoordinatorPhase,
    pub trace: Vec<CoordinatorPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<ReportIdentity>,
    pub unlocked: bool,
    pub rendered: bool,
    pub scan_calls: u32,
    /// The identity was already being scanned; no new backend call was made.
    pub in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
}

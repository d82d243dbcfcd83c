use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::{NormalizedInput, ReportIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderSource {
    Stored,
    Fresh,
    Restored,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPayload {
    pub report_id: ReportIdentity,
    pub source: RenderSource,
    pub unlocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_hint: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub report_id: ReportIdentity,
    pub analyzer_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<NormalizedInput>,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
    pub payload: serde_json::Value,
}

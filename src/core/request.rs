use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub analyzer_key: String,
    pub raw_input: String,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

impl ScanRequest {
    pub fn new(
        analyzer_key: impl Into<String>,
        raw_input: impl Into<String>,
        requested_at: OffsetDateTime,
    ) -> Self {
        Self {
            analyzer_key: analyzer_key.into(),
            raw_input: raw_input.into(),
            requested_at,
        }
    }
}

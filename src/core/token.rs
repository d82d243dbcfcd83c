use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryToken {
    pub report_identity_hint: String,
    #[serde(default)]
    pub input_hint: String,
}

impl RecoveryToken {
    pub fn new(report_identity_hint: impl Into<String>, input_hint: impl Into<String>) -> Self {
        Self {
            report_identity_hint: report_identity_hint.into(),
            input_hint: input_hint.into(),
        }
    }

    pub fn input(&self) -> Option<&str> {
        let s = self.input_hint.trim();
        (!s.is_empty()).then_some(s)
    }
}

use thiserror::Error;

use crate::core::ReportIdentity;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("スキャン対象が不正です: {input}（{reason}）")]
    InvalidInput { input: String, reason: String },

    #[error("スキャンに失敗しました（report_id={report_id}）: {message}")]
    ScanFailed {
        report_id: ReportIdentity,
        message: String,
    },
}

impl SessionError {
    pub fn invalid_input(input: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::InvalidInput {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn report_id(&self) -> Option<&ReportIdentity> {
        match self {
            SessionError::InvalidInput { .. } => None,
            SessionError::ScanFailed { report_id, .. } => Some(report_id),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorPhase {
    Init,
    AwaitBillingReconcile,
    ResultsRestored,
    RecoverFromToken,
    TryStored,
    AutoRescan,
    FreshOrIdle,
    DisplayStored,
    DisplayFresh,
    Idle,
    Degraded,
}

impl CoordinatorPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            CoordinatorPhase::Init => "INIT",
            CoordinatorPhase::AwaitBillingReconcile => "AWAIT_BILLING_RECONCILE",
            CoordinatorPhase::ResultsRestored => "RESULTS_RESTORED",
            CoordinatorPhase::RecoverFromToken => "RECOVER_FROM_TOKEN",
            CoordinatorPhase::TryStored => "TRY_STORED",
            CoordinatorPhase::AutoRescan => "AUTO_RESCAN",
            CoordinatorPhase::FreshOrIdle => "FRESH_OR_IDLE",
            CoordinatorPhase::DisplayStored => "DISPLAY_STORED",
            CoordinatorPhase::DisplayFresh => "DISPLAY_FRESH",
            CoordinatorPhase::Idle => "IDLE",
            CoordinatorPhase::Degraded => "DEGRADED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            CoordinatorPhase::ResultsRestored
                | CoordinatorPhase::DisplayStored
                | CoordinatorPhase::DisplayFresh
                | CoordinatorPhase::Idle
                | CoordinatorPhase::Degraded
        )
    }
}

impl fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

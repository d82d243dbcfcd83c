mod error;
mod identity;
mod outcome;
mod phase;
mod render;
mod request;
mod snapshot;
mod token;

pub use error::SessionError;
pub use identity::{NormalizedInput, ReportIdentity};
pub use outcome::SessionOutcome;
pub use phase::CoordinatorPhase;
pub use render::{RenderPayload, RenderSource, StoredReport};
pub use request::ScanRequest;
pub use snapshot::EntitlementSnapshot;
pub use token::RecoveryToken;

pub mod conservation;
pub mod protocol;
pub mod readiness;

pub use conservation::ConservationCheck;
pub use protocol::{CoordinationDriver, OperationReport, SiteRole, StartRequest};
pub use readiness::{MarkerVerdict, ReadinessPoll};

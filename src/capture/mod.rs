//! Dual-write change capture from the legacy relation into its replacement.
//!
//! A site only forwards changes that originated on itself; rows arriving via
//! replication carry a foreign origin and are left alone, so the two sites
//! never bounce a change between them.

pub mod deferred;
pub mod errors;
pub mod rule;

pub use deferred::{DeferredCaptureWorker, DrainReport};
pub use errors::{CaptureError, CaptureErrorChannel};
pub use rule::{CaptureMode, CaptureStats, ChangeCapture, ForwardingRule, RegisteredCapture};

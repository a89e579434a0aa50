pub mod records;
pub mod store;

pub use records::{
    AuditEntry, BatchExecutionRecord, BatchOutcome, CoordinationOperation, JobStatus,
    MigrationJob, OperationStatus, ReplicationControlEntry,
};
pub use store::{ControlStore, InMemoryStateStore, StateStore};

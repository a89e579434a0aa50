// ============================================================================
// live-migrate Library
// ============================================================================

pub mod batch;
pub mod capture;
pub mod config;
pub mod coordination;
pub mod core;
pub mod cutover;
pub mod facade;
pub mod state;
pub mod storage;
pub mod transport;
pub mod verify;

// Re-export main types for convenience
pub use batch::{BatchEngine, BatchRunSummary, CutoffSelection, SchemaMapping};
pub use capture::{CaptureMode, ChangeCapture, ForwardingRule};
pub use config::{MigrationPlan, MigratorConfig};
pub use coordination::{CoordinationDriver, OperationReport, SiteRole, StartRequest};
pub use core::{MigrateError, Result, Value, DataType, Column, TableSchema, RowPredicate};
pub use cutover::{CutoverEngine, SwitchReport, SwitchStatus};
pub use facade::{MigrationRequest, Migrator};
pub use state::{InMemoryStateStore, OperationStatus};
pub use storage::{InMemoryStorage, StorageEngine};
pub use transport::{InMemoryReplicationHub, ReplicationTransport};
pub use verify::{ConsistencyCheck, ConsistencyReport};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MigrateError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found in table '{1}'")]
    ColumnNotFound(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Replication transport error: {0}")]
    Transport(String),

    #[error("Migration job '{0}' not found")]
    JobNotFound(String),

    #[error("Coordination operation '{0}' not found")]
    OperationNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Coordination timeout: {0}")]
    CoordinationTimeout(String),

    #[error("Cutover failed: {0}")]
    Cutover(String),

    #[error("Consistency check failed: {0}")]
    Consistency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, MigrateError>;

impl MigrateError {
    /// Validation failures are raised before anything is mutated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::TableNotFound(_)
                | Self::TableExists(_)
                | Self::ColumnNotFound(_, _)
                | Self::Config(_)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for MigrateError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

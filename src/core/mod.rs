pub mod error;
pub mod types;
pub mod value;

pub use error::{MigrateError, Result};
pub use types::{
    ChangeKind, Column, ConflictPolicy, ForeignKey, Row, RowChange, RowPredicate, TableSchema,
};
pub use value::{DataType, Value};

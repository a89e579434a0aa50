pub mod cutoff;
pub mod engine;
pub mod mapping;

pub use cutoff::{
    CutoffSelection, CutoffStrategy, ExactCutoff, SampledCutoff, require_ordering_values,
};
pub use engine::{BatchEngine, BatchRunSummary, RemainingEstimate};
pub use mapping::{ColumnMapping, ConstantColumn, RowMapper, SchemaMapping};

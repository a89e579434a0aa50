pub mod catalog;
pub mod engine;
pub mod memory;
pub mod pattern;
pub mod persistence;
pub mod table;

pub use catalog::Catalog;
pub use engine::{ChangeObserver, StorageEngine};
pub use memory::{FaultPoint, InMemoryStorage};
pub use persistence::Journal;
pub use table::Table;

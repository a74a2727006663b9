//! In-memory dataset stores for exercising the table executor without a
//! database. Enabled by the `testing` feature.

mod memory_store;

pub use memory_store::{InMemoryDatasetConnector, InMemoryDatasetStore, StoredRow};

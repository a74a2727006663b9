//! Test doubles for the catalog.
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```

mod memory_catalog;

pub use memory_catalog::{InMemoryCatalog, InMemoryCatalogConnector, RecordedLog};

pub mod catalog;
pub mod cli;
pub mod config;
pub mod model;
pub mod sql;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::{Catalog, CatalogConnector, CatalogError, CatalogHandle};

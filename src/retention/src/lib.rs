//! Retention executors for geospatial data series.
//!
//! A run resolves the semantic family of a storage's data series and then
//! prunes either dated raster files ([`raster`]) or rows of PostGIS tables
//! ([`table`]), optionally backing up what it removes. [`RetentionRunner`]
//! wraps a run with cutoff computation, historics archival and the
//! operational log.

pub mod cutoff;
pub mod dataset;
pub mod error;
pub mod mask;
pub mod postgres;
pub mod raster;
pub mod runner;
pub mod table;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cutoff::{KeepUnit, RetentionCutoff, compute_cutoff};
pub use dataset::{DatasetConnector, DatasetStore};
pub use error::{RetentionError, Result};
pub use mask::MaskPattern;
pub use postgres::PgDatasetConnector;
pub use runner::{NO_DATA, RetentionRunner, RunOutcome, RunReport};

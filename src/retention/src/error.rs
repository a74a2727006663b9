use std::path::PathBuf;

use common::CatalogError;
use thiserror::Error;

/// Failures of a single retention run. They end up in the operational log
/// and in the PROCESS_FINISHED envelope, never beyond.
#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("Invalid data series type: {0}")]
    UnknownSeriesType(String),

    #[error("Invalid keep data unit '{0}'")]
    InvalidKeepUnit(String),

    #[error("Cutoff underflow subtracting {amount} {unit}")]
    CutoffUnderflow { amount: i64, unit: String },

    #[error("Invalid mask '{mask}': {message}")]
    InvalidMask { mask: String, message: String },

    #[error("Missing catalog metadata: {0}")]
    MissingMetadata(String),

    #[error("Table {0} has no columns")]
    EmptyTable(String),

    #[error("Invalid dataset uri '{uri}': {message}")]
    InvalidUri { uri: String, message: String },

    #[error("Filesystem error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Dataset database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RetentionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RetentionError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RetentionError>;

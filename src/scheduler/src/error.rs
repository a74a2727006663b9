use common::CatalogError;
use thiserror::Error;

/// Reasons a storage ends up without a timer.
#[derive(Error, Debug)]
pub enum SchedulingError {
    #[error("Schedule {0} not found")]
    MissingSchedule(i32),

    #[error("Storage {0} is inactive")]
    InactiveStorage(i32),

    #[error("Project {0} is inactive or unknown")]
    InactiveProject(i32),

    #[error("Unknown frequency unit '{0}'")]
    UnknownUnit(String),

    #[error("Schedule {0} has no positive frequency")]
    ZeroFrequency(i32),

    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },

    #[error("Registration of storage {0} was superseded by a newer one")]
    Superseded(i32),

    #[error("Storage {0} is not registered")]
    UnknownStorage(i32),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type Result<T> = std::result::Result<T, SchedulingError>;

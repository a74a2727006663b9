//! Cron timers and per-storage job queues.
//!
//! [`ScheduleRegistry`] turns storage definitions into cron timers; each
//! tick hands a job built by a [`JobLauncher`] to the [`JobQueue`], which
//! runs jobs of the same storage one after another.

pub mod error;
pub mod queue;
pub mod registry;
pub mod rule;

pub use error::{Result, SchedulingError};
pub use queue::{Job, JobOutcome, JobQueue};
pub use registry::{JobLauncher, Registration, ScheduleRegistry};

//! TCP service that takes storage definitions from the controller,
//! schedules them and reports every retention run back.

pub mod connection;
pub mod controller;
pub mod jobs;
pub mod router;
pub mod server;

pub use controller::ControllerLink;
pub use router::{Action, Router, ServiceState};
pub use server::StoragerAgent;

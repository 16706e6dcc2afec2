//! Execution coordinator
//!
//! Claims commands from the store, submits them to the connector pool under
//! a bounded in-flight budget and records the outcomes.

mod collector;
pub mod config;
pub mod coordinator;
pub mod inflight;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use inflight::InFlight;

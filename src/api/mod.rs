//! Submission API: accepts commands over HTTP and exposes their state

pub mod handlers;
pub mod routes;
pub mod state;
pub mod submission;
pub mod types;

pub use routes::{create_router, serve};
pub use state::AppState;
pub use submission::SubmissionRequest;

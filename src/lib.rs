pub mod api;
pub mod cli;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod services;
pub mod store;

pub use config::AppConfig;
pub use connector::{ConnectorPool, ExchangeHandler};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{RelayError, Result};
pub use store::CommandStore;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Dictionaries, StatusIds};
use crate::error::Result;
use crate::store::CommandStore;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    /// Command store backing submissions and lookups
    pub store: Arc<dyn CommandStore>,

    /// Enumerated reference data loaded at startup
    pub dictionaries: Arc<Dictionaries>,

    pub statuses: StatusIds,

    /// Deadline granted to each accepted command
    pub time_for_execution: Duration,

    /// Application start time
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CommandStore>,
        dictionaries: Arc<Dictionaries>,
        time_for_execution: Duration,
    ) -> Result<Self> {
        let statuses = StatusIds::resolve(&dictionaries)?;
        Ok(Self {
            store,
            dictionaries,
            statuses,
            time_for_execution,
            start_time: Utc::now(),
        })
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}

//! Command store contract
//!
//! All state transitions of a command go through this trait. Claims must be
//! exclusive across processes; every status change writes a history row in
//! the same transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Command, NewCommand};
use crate::error::Result;
use crate::protocol::OrderDetails;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Selection and transition of one claimable command
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    pub exchange_id: i16,
    pub connector_id: i16,
    pub status_from: i16,
    pub status_to: i16,
    /// Only commands whose deadline is strictly later are eligible; `None`
    /// claims regardless of deadline
    pub deadline_after: Option<DateTime<Utc>>,
    /// Only commands last updated at or before this instant are eligible
    pub updated_before: Option<DateTime<Utc>>,
}

/// Terminal (or retryable Error) result of an execution attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub command_id: i64,
    pub status_from: i16,
    pub status_to: i16,
    pub order: Option<OrderDetails>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpireRequest {
    pub status_from: Vec<i16>,
    pub status_to: i16,
    pub now: DateTime<Utc>,
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub command_id: i64,
    pub status_from: i16,
    pub status_to: i16,
    pub timestamp: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Atomically move one eligible command from `status_from` to
    /// `status_to` and assign it to the connector. `None` when nothing is
    /// eligible.
    async fn claim_for_execution(&self, request: &ClaimRequest) -> Result<Option<Command>>;

    /// Up to `limit` commands already owned by the connector in
    /// `status_executing`, last touched at or before `as_of`. Read only.
    async fn claim_batch_for_recovery(
        &self,
        exchange_id: i16,
        connector_id: i16,
        status_executing: i16,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>>;

    async fn load_by_id(&self, id: i64) -> Result<Option<Command>>;

    /// Insert a validated command in `status_created`. A reused fingerprint
    /// is a validation error.
    async fn insert(&self, command: &NewCommand, status_created: i16) -> Result<i64>;

    /// Persist an outcome. Returns `false` when the command was no longer in
    /// `status_from`, in which case nothing is written.
    async fn record_outcome(&self, outcome: &Outcome) -> Result<bool>;

    /// Move unclaimed overdue commands to `status_to`; returns their ids.
    async fn expire_overdue(&self, request: &ExpireRequest) -> Result<Vec<i64>>;

    async fn history(&self, id: i64) -> Result<Vec<HistoryEntry>>;

    /// Readiness probe
    async fn ping(&self) -> Result<()>;
}

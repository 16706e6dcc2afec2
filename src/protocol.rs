//! Messages exchanged between the coordinator and the connector pool
//!
//! Every request carries a sequence id that is unique per coordinator; the
//! pool answers each request with exactly one response carrying the same id.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Command, RawCommand, StatusIds};
use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecKind {
    CheckConnectivity,
    Execute,
    Verify,
    Info,
}

impl ExecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecKind::CheckConnectivity => "check_connectivity",
            ExecKind::Execute => "execute",
            ExecKind::Verify => "verify",
            ExecKind::Info => "info",
        }
    }
}

impl std::fmt::Display for ExecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome vocabulary. Anything outside it fails to deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Ok,
    Error,
    Rejected,
    TimedOut,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Ok => "ok",
            ExecStatus::Error => "error",
            ExecStatus::Rejected => "rejected",
            ExecStatus::TimedOut => "timed_out",
        }
    }

    /// Persisted status a response moves its command to
    pub fn target_status(&self, ids: &StatusIds) -> i16 {
        match self {
            ExecStatus::Ok => ids.filled,
            ExecStatus::Rejected => ids.rejected,
            ExecStatus::TimedOut => ids.timed_out,
            ExecStatus::Error => ids.error,
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub id: u64,
    pub kind: ExecKind,
    pub raw: Option<RawCommand>,
    pub command: Option<Command>,
}

impl ExecRequest {
    pub fn check_connectivity(id: u64) -> Self {
        Self {
            id,
            kind: ExecKind::CheckConnectivity,
            raw: None,
            command: None,
        }
    }

    pub fn for_command(id: u64, kind: ExecKind, raw: RawCommand, command: Command) -> Self {
        Self {
            id,
            kind,
            raw: Some(raw),
            command: Some(command),
        }
    }

    /// The exchange-facing payload. Only connectivity checks may omit it.
    pub fn raw(&self) -> Result<&RawCommand> {
        self.raw.as_ref().ok_or_else(|| {
            RelayError::protocol(format!(
                "{} request {} carries no command payload",
                self.kind, self.id
            ))
        })
    }

    pub fn command_id(&self) -> Option<i64> {
        self.command.as_ref().map(|c| c.id)
    }
}

/// Details of an exchange order, as reported by the connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub external_order_id: String,
    /// Client order id, equal to the command fingerprint
    pub execution_id: String,
    pub price: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn is_empty(&self) -> bool {
        self.free.is_zero() && self.locked.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub id: u64,
    pub status: ExecStatus,
    pub description: String,
    pub order: Option<OrderDetails>,
    pub balances: Vec<Balance>,
    pub elapsed: Duration,
}

impl ExecResponse {
    /// An Error response for the request; callers overwrite what they know.
    pub fn new(request: &ExecRequest) -> Self {
        Self {
            id: request.id,
            status: ExecStatus::Error,
            description: String::new(),
            order: None,
            balances: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_status(mut self, status: ExecStatus, description: impl Into<String>) -> Self {
        self.status = status;
        self.description = description.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExecStatus::Ok
    }

    /// Text persisted as the command description. Info snapshots store the
    /// balances as JSON.
    pub fn persisted_description(&self) -> Result<String> {
        if self.balances.is_empty() {
            return Ok(self.description.clone());
        }
        Ok(serde_json::to_string(&self.balances)?)
    }
}

/// Fails when a response does not answer the request it was matched to.
pub fn ensure_correlated(request: &ExecRequest, response: &ExecResponse) -> Result<()> {
    if request.id != response.id {
        return Err(RelayError::protocol(format!(
            "response id {} does not match request id {}",
            response.id, request.id
        )));
    }
    Ok(())
}

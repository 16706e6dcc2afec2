//! Exchange connectors
//!
//! An [`ExchangeHandler`] knows how to talk to one venue. The
//! [`ConnectorPool`] runs a bounded set of workers that feed protocol
//! requests into a handler and post the responses back.

pub mod binance;
pub mod pool;
pub mod simulated;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::RawCommand;
use crate::error::{RelayError, Result};
use crate::protocol::{Balance, ExecStatus, OrderDetails};

pub use binance::BinanceHandler;
pub use pool::ConnectorPool;
pub use simulated::{Behavior, SimulatedExchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Binance,
    Simulated,
}

impl Default for ConnectorKind {
    fn default() -> Self {
        Self::Binance
    }
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Simulated => "simulated",
        }
    }
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "simulated" | "sim" | "dry_run" => Ok(Self::Simulated),
            _ => Err("invalid connector kind; expected binance|simulated"),
        }
    }
}

/// Result of an execute or verify call against the venue
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub status: ExecStatus,
    pub description: String,
    pub order: Option<OrderDetails>,
}

impl Execution {
    pub fn timed_out(description: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::TimedOut,
            description: description.into(),
            order: None,
        }
    }

    /// Map the venue's view of an order onto the outcome vocabulary.
    /// `not_filled` describes orders that are neither filled nor final.
    pub fn from_order(order: &ExchangeOrder, not_filled: &str) -> Self {
        match order.state {
            OrderState::Filled => Self {
                status: ExecStatus::Ok,
                description: format!("order {} filled", order.external_order_id),
                order: Some(OrderDetails {
                    external_order_id: order.external_order_id.clone(),
                    execution_id: order.client_order_id.clone(),
                    price: order.price,
                    commission: order.commission,
                    commission_asset: order.commission_asset.clone(),
                }),
            },
            OrderState::Expired | OrderState::Rejected | OrderState::Canceled => Self {
                status: ExecStatus::Rejected,
                description: format!(
                    "order {} {}",
                    order.external_order_id,
                    order.state.as_str().to_ascii_lowercase()
                ),
                order: None,
            },
            OrderState::Open => Self {
                status: ExecStatus::Error,
                description: not_filled.to_string(),
                order: None,
            },
        }
    }
}

/// Venue order status, collapsed to what the relay distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Filled,
    Expired,
    Rejected,
    Canceled,
    /// New, partially filled, pending cancel and any other live state
    Open,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Filled => "FILLED",
            OrderState::Expired => "EXPIRED",
            OrderState::Rejected => "REJECTED",
            OrderState::Canceled => "CANCELED",
            OrderState::Open => "OPEN",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FILLED" => OrderState::Filled,
            "EXPIRED" | "EXPIRED_IN_MATCH" => OrderState::Expired,
            "REJECTED" => OrderState::Rejected,
            "CANCELED" | "CANCELLED" => OrderState::Canceled,
            _ => OrderState::Open,
        }
    }
}

/// Venue-side order snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeOrder {
    pub external_order_id: String,
    pub client_order_id: String,
    pub state: OrderState,
    pub price: Decimal,
    pub commission: Decimal,
    pub commission_asset: Option<String>,
}

/// What to do when verify finds no order under the client order id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownOrder {
    /// Never submitted and still within its deadline
    Execute,
    TimedOut,
}

impl UnknownOrder {
    pub fn decide(raw: &RawCommand, now: DateTime<Utc>) -> Self {
        if raw.deadline_passed(now) {
            UnknownOrder::TimedOut
        } else {
            UnknownOrder::Execute
        }
    }
}

pub(crate) const NOT_FILLED: &str = "order was not filled";
pub(crate) const STILL_PENDING: &str = "order still pending";
pub(crate) const UNKNOWN_PAST_DEADLINE: &str = "order unknown to exchange and deadline passed";

/// Exchange-specific operations. Credentials travel with every request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Submit the order under its fingerprint as client order id. A
    /// resubmission must resolve to the existing order.
    async fn execute(&self, raw: &RawCommand) -> Result<Execution>;

    /// Look the order up by client order id; unknown orders fall through to
    /// execute while the deadline holds and time out afterwards.
    async fn verify(&self, raw: &RawCommand) -> Result<Execution>;

    /// Account balances with non-zero free or locked amounts
    async fn info(&self, raw: &RawCommand) -> Result<Vec<Balance>>;

    /// Lightweight connectivity probe
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn non_empty_balances(balances: Vec<Balance>) -> Vec<Balance> {
    balances.into_iter().filter(|b| !b.is_empty()).collect()
}

pub(crate) fn require_trade(raw: &RawCommand) -> Result<()> {
    if raw.order_type == crate::domain::OrderType::Info {
        return Err(RelayError::protocol(format!(
            "command {} is an INFO request and cannot be traded",
            raw.command_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(state: OrderState) -> ExchangeOrder {
        ExchangeOrder {
            external_order_id: "981".into(),
            client_order_id: "fp-1".into(),
            state,
            price: dec!(101.5),
            commission: dec!(0.01),
            commission_asset: Some("BNB".into()),
        }
    }

    #[test]
    fn filled_order_maps_to_ok_with_details() {
        let execution = Execution::from_order(&order(OrderState::Filled), NOT_FILLED);
        assert_eq!(execution.status, ExecStatus::Ok);
        let details = execution.order.expect("filled order carries details");
        assert_eq!(details.execution_id, "fp-1");
        assert_eq!(details.price, dec!(101.5));
    }

    #[test]
    fn final_unfilled_states_are_rejections() {
        for state in [OrderState::Expired, OrderState::Rejected, OrderState::Canceled] {
            let execution = Execution::from_order(&order(state), NOT_FILLED);
            assert_eq!(execution.status, ExecStatus::Rejected, "{:?}", state);
            assert!(execution.order.is_none());
        }
    }

    #[test]
    fn live_order_is_an_error() {
        let execution = Execution::from_order(&order(OrderState::Open), STILL_PENDING);
        assert_eq!(execution.status, ExecStatus::Error);
        assert_eq!(execution.description, STILL_PENDING);
    }

    #[test]
    fn venue_states_parse() {
        assert_eq!(OrderState::parse("FILLED"), OrderState::Filled);
        assert_eq!(OrderState::parse("expired"), OrderState::Expired);
        assert_eq!(OrderState::parse("PARTIALLY_FILLED"), OrderState::Open);
        assert_eq!(OrderState::parse("NEW"), OrderState::Open);
    }

    #[test]
    fn connector_kind_parses_aliases() {
        assert_eq!(
            "sim".parse::<ConnectorKind>().expect("alias parses"),
            ConnectorKind::Simulated
        );
        assert!("kraken".parse::<ConnectorKind>().is_err());
    }
}

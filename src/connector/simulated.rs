//! In-process exchange for dry runs and tests.
//!
//! Orders are keyed by client order id, so a resubmitted command resolves to
//! the order it already produced. Behaviour can be scripted per instrument.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    require_trade, ExchangeHandler, ExchangeOrder, Execution, OrderState, UnknownOrder, NOT_FILLED,
    STILL_PENDING, UNKNOWN_PAST_DEADLINE,
};
use crate::domain::{OrderType, RawCommand};
use crate::error::{RelayError, Result};
use crate::protocol::Balance;

/// Scripted reaction of the simulated venue for one instrument
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Fill market orders at the given price, limit orders at their limit
    Fill(Decimal),
    /// Expire limit orders, fill market orders at the default price
    ExpireLimit,
    /// Accept the order but leave it open
    Rest,
    /// Reject the submission with an API error
    Fail(String),
    /// Every call fails at the transport level
    Unreachable,
}

#[derive(Debug, Default)]
struct Book {
    orders: HashMap<String, ExchangeOrder>,
    behaviors: HashMap<String, Behavior>,
    balances: Vec<Balance>,
}

#[derive(Debug)]
pub struct SimulatedExchange {
    book: Mutex<Book>,
    default_price: Decimal,
    commission_rate: Decimal,
    latency: Duration,
    next_order_id: AtomicU64,
    submissions: AtomicUsize,
    pings: AtomicUsize,
    failing_pings: AtomicUsize,
}

impl SimulatedExchange {
    pub fn new(default_price: Decimal) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            default_price,
            commission_rate: Decimal::new(1, 3),
            latency: Duration::ZERO,
            next_order_id: AtomicU64::new(1),
            submissions: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            failing_pings: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn script(&self, instrument: &str, behavior: Behavior) {
        self.book
            .lock()
            .await
            .behaviors
            .insert(instrument.to_ascii_uppercase(), behavior);
    }

    pub async fn set_balances(&self, balances: Vec<Balance>) {
        self.book.lock().await.balances = balances;
    }

    /// Register an order as if it had been submitted before a restart.
    pub async fn seed_order(&self, client_order_id: &str, state: OrderState, price: Decimal) {
        let order = ExchangeOrder {
            external_order_id: self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string(),
            client_order_id: client_order_id.to_string(),
            state,
            price,
            commission: Decimal::ZERO,
            commission_asset: None,
        };
        self.book
            .lock()
            .await
            .orders
            .insert(client_order_id.to_string(), order);
    }

    pub async fn order(&self, client_order_id: &str) -> Option<ExchangeOrder> {
        self.book.lock().await.orders.get(client_order_id).cloned()
    }

    /// Orders accepted by the venue (resubmissions excluded)
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Make the next `count` pings fail.
    pub fn fail_pings(&self, count: usize) {
        self.failing_pings.store(count, Ordering::SeqCst);
    }

    async fn behavior(&self, raw: &RawCommand) -> Behavior {
        self.book
            .lock()
            .await
            .behaviors
            .get(&raw.instrument.to_ascii_uppercase())
            .cloned()
            .unwrap_or(Behavior::Fill(self.default_price))
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn unreachable() -> RelayError {
        RelayError::Exchange("simulated exchange unreachable".into())
    }
}

#[async_trait]
impl ExchangeHandler for SimulatedExchange {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn execute(&self, raw: &RawCommand) -> Result<Execution> {
        require_trade(raw)?;
        self.pause().await;

        let behavior = self.behavior(raw).await;
        if behavior == Behavior::Unreachable {
            return Err(Self::unreachable());
        }

        let mut book = self.book.lock().await;
        if let Some(existing) = book.orders.get(&raw.fingerprint) {
            debug!(client_order_id = %raw.fingerprint, "duplicate client order id");
            return Ok(Execution::from_order(existing, NOT_FILLED));
        }

        let state = match (&behavior, raw.order_type) {
            (Behavior::Fail(msg), _) => return Err(RelayError::Exchange(msg.clone())),
            (Behavior::ExpireLimit, OrderType::Limit) => OrderState::Expired,
            (Behavior::Rest, _) => OrderState::Open,
            _ => OrderState::Filled,
        };
        let price = match (&behavior, raw.limit_price) {
            (_, Some(limit)) => limit,
            (Behavior::Fill(price), None) => *price,
            _ => self.default_price,
        };
        let commission = if state == OrderState::Filled {
            (price * raw.amount * self.commission_rate).normalize()
        } else {
            Decimal::ZERO
        };

        let order = ExchangeOrder {
            external_order_id: self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string(),
            client_order_id: raw.fingerprint.clone(),
            state,
            price,
            commission,
            commission_asset: (state == OrderState::Filled).then(|| "USDT".to_string()),
        };
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let execution = Execution::from_order(&order, NOT_FILLED);
        book.orders.insert(raw.fingerprint.clone(), order);

        Ok(execution)
    }

    async fn verify(&self, raw: &RawCommand) -> Result<Execution> {
        require_trade(raw)?;
        self.pause().await;

        if self.behavior(raw).await == Behavior::Unreachable {
            return Err(Self::unreachable());
        }

        let existing = self.book.lock().await.orders.get(&raw.fingerprint).cloned();
        match existing {
            Some(order) => Ok(Execution::from_order(&order, STILL_PENDING)),
            None => match UnknownOrder::decide(raw, Utc::now()) {
                UnknownOrder::Execute => self.execute(raw).await,
                UnknownOrder::TimedOut => Ok(Execution::timed_out(UNKNOWN_PAST_DEADLINE)),
            },
        }
    }

    async fn info(&self, raw: &RawCommand) -> Result<Vec<Balance>> {
        self.pause().await;
        if self.behavior(raw).await == Behavior::Unreachable {
            return Err(Self::unreachable());
        }
        Ok(self.book.lock().await.balances.clone())
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Self::unreachable());
        }
        Ok(())
    }
}

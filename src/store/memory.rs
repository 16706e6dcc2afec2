//! In-memory command store for tests and dry runs.
//!
//! A single mutex serialises every operation, which gives the same claim
//! exclusivity the Postgres store gets from row locks.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ClaimRequest, CommandStore, ExpireRequest, HistoryEntry, Outcome};
use crate::domain::{Command, NewCommand};
use crate::error::{RelayError, Result};

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    commands: BTreeMap<i64, Command>,
    fingerprints: HashSet<String>,
    history: Vec<HistoryEntry>,
}

impl State {
    fn push_history(&mut self, command_id: i64, from: i16, to: i16, timestamp: DateTime<Utc>) {
        self.history.push(HistoryEntry {
            command_id,
            status_from: from,
            status_to: to,
            timestamp,
        });
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    failing_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` store calls fail with a transient database error.
    pub fn fail_next(&self, count: usize) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    /// Place a command in an arbitrary state (test setup).
    pub async fn put(&self, command: Command) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(command.id);
        state.fingerprints.insert(command.fingerprint.clone());
        state.commands.insert(command.id, command);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.commands.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RelayError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandStore for InMemoryStore {
    async fn claim_for_execution(&self, request: &ClaimRequest) -> Result<Option<Command>> {
        self.check_failure()?;
        let mut state = self.state.lock().await;

        let candidate = state
            .commands
            .values()
            .find(|c| {
                c.exchange_id == request.exchange_id
                    && c.status_id == request.status_from
                    && c.connector_id.is_none()
                    && request
                        .deadline_after
                        .map_or(true, |after| c.execute_till > after)
                    && request
                        .updated_before
                        .map_or(true, |before| c.updated_at <= before)
            })
            .map(|c| c.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let now = Utc::now();
        let claimed = match state.commands.get_mut(&id) {
            Some(command) => {
                command.status_id = request.status_to;
                command.connector_id = Some(request.connector_id);
                command.updated_at = now;
                command.clone()
            }
            None => return Ok(None),
        };
        state.push_history(id, request.status_from, request.status_to, now);

        debug!(command_id = id, "claimed command");
        Ok(Some(claimed))
    }

    async fn claim_batch_for_recovery(
        &self,
        exchange_id: i16,
        connector_id: i16,
        status_executing: i16,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Command>> {
        self.check_failure()?;
        let state = self.state.lock().await;

        Ok(state
            .commands
            .values()
            .filter(|c| {
                c.exchange_id == exchange_id
                    && c.connector_id == Some(connector_id)
                    && c.status_id == status_executing
                    && c.updated_at <= as_of
            })
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn load_by_id(&self, id: i64) -> Result<Option<Command>> {
        self.check_failure()?;
        Ok(self.state.lock().await.commands.get(&id).cloned())
    }

    async fn insert(&self, command: &NewCommand, status_created: i16) -> Result<i64> {
        self.check_failure()?;
        let mut state = self.state.lock().await;

        if !state.fingerprints.insert(command.fingerprint.clone()) {
            return Err(RelayError::Validation(format!(
                "fingerprint '{}' already used",
                command.fingerprint
            )));
        }

        state.next_id += 1;
        let id = state.next_id;
        let now = Utc::now();
        state
            .commands
            .insert(id, Command::from_new(id, command.clone(), status_created, now));
        state.push_history(id, status_created, status_created, now);

        Ok(id)
    }

    async fn record_outcome(&self, outcome: &Outcome) -> Result<bool> {
        self.check_failure()?;
        let mut state = self.state.lock().await;

        match state.commands.get_mut(&outcome.command_id) {
            Some(command) if command.status_id == outcome.status_from => {
                command.status_id = outcome.status_to;
                command.connector_id = None;
                command.updated_at = outcome.timestamp;
                command.description = Some(outcome.description.clone());
                if let Some(order) = &outcome.order {
                    command.result_order_id = Some(order.external_order_id.clone());
                    command.fill_price = Some(order.price);
                    command.commission = Some(order.commission);
                    command.commission_asset = order.commission_asset.clone();
                }
            }
            _ => return Ok(false),
        }

        state.push_history(
            outcome.command_id,
            outcome.status_from,
            outcome.status_to,
            outcome.timestamp,
        );
        Ok(true)
    }

    async fn expire_overdue(&self, request: &ExpireRequest) -> Result<Vec<i64>> {
        self.check_failure()?;
        let mut state = self.state.lock().await;

        let overdue: Vec<(i64, i16)> = state
            .commands
            .values()
            .filter(|c| {
                request.status_from.contains(&c.status_id)
                    && c.connector_id.is_none()
                    && c.is_overdue(request.now)
            })
            .take(usize::try_from(request.limit).unwrap_or(0))
            .map(|c| (c.id, c.status_id))
            .collect();

        for (id, from) in &overdue {
            if let Some(command) = state.commands.get_mut(id) {
                command.status_id = request.status_to;
                command.updated_at = request.now;
                command.description = Some("deadline passed before execution".into());
            }
            state.push_history(*id, *from, request.status_to, request.now);
        }

        Ok(overdue.into_iter().map(|(id, _)| id).collect())
    }

    async fn history(&self, id: i64) -> Result<Vec<HistoryEntry>> {
        self.check_failure()?;
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.command_id == id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.check_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::fixtures::market_buy;
    use chrono::Duration;
    use std::sync::Arc;

    const CREATED: i16 = 1;
    const EXECUTING: i16 = 2;
    const FILLED: i16 = 3;
    const TIMED_OUT: i16 = 5;
    const ERROR: i16 = 6;

    fn claim(connector_id: i16) -> ClaimRequest {
        ClaimRequest {
            exchange_id: 1,
            connector_id,
            status_from: CREATED,
            status_to: EXECUTING,
            deadline_after: Some(Utc::now()),
            updated_before: None,
        }
    }

    #[tokio::test]
    async fn concurrent_claims_are_exclusive() {
        let store = Arc::new(InMemoryStore::new());
        for id in 1..=20 {
            store
                .put(market_buy(id, Utc::now() + Duration::minutes(1)))
                .await;
        }

        let mut handles = Vec::new();
        for connector in 1..=4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut won = Vec::new();
                while let Some(command) = store.claim_for_execution(&claim(connector)).await.unwrap()
                {
                    won.push(command.id);
                }
                won
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn claim_skips_overdue_and_recently_updated() {
        let store = InMemoryStore::new();
        store.put(market_buy(1, Utc::now() - Duration::seconds(1))).await;
        assert!(store.claim_for_execution(&claim(1)).await.unwrap().is_none());

        let mut failed = market_buy(2, Utc::now() + Duration::minutes(1));
        failed.status_id = ERROR;
        store.put(failed).await;

        let mut retry = claim(1);
        retry.status_from = ERROR;
        retry.updated_before = Some(Utc::now() - Duration::seconds(10));
        assert!(store.claim_for_execution(&retry).await.unwrap().is_none());

        retry.updated_before = Some(Utc::now());
        let claimed = store.claim_for_execution(&retry).await.unwrap().unwrap();
        assert_eq!(claimed.id, 2);
        assert_eq!(claimed.status_id, EXECUTING);
        assert_eq!(claimed.connector_id, Some(1));
    }

    #[tokio::test]
    async fn claim_without_deadline_takes_overdue_commands() {
        let store = InMemoryStore::new();
        let mut failed = market_buy(4, Utc::now() - Duration::seconds(30));
        failed.status_id = ERROR;
        failed.updated_at = Utc::now() - Duration::seconds(20);
        store.put(failed).await;

        let mut retry = claim(1);
        retry.status_from = ERROR;
        retry.updated_before = Some(Utc::now());
        assert!(store.claim_for_execution(&retry).await.unwrap().is_none());

        retry.deadline_after = None;
        let claimed = store.claim_for_execution(&retry).await.unwrap().unwrap();
        assert_eq!(claimed.id, 4);
        assert_eq!(claimed.status_id, EXECUTING);
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_validation_error() {
        let store = InMemoryStore::new();
        let command = market_buy(0, Utc::now() + Duration::minutes(1));
        let new = NewCommand {
            exchange_id: command.exchange_id,
            instrument: command.instrument.clone(),
            direction_id: command.direction_id,
            order_type_id: command.order_type_id,
            limit_price: None,
            amount: command.amount,
            execution_type_id: command.execution_type_id,
            execute_till: command.execute_till,
            ref_position_id: None,
            time_in_force_id: None,
            account_id: command.account_id,
            api_key: "k".into(),
            secret_key: "s".into(),
            fingerprint: "same".into(),
        };

        let id = store.insert(&new, CREATED).await.unwrap();
        assert_eq!(id, 1);
        let err = store.insert(&new, CREATED).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));

        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].status_from, history[0].status_to), (CREATED, CREATED));
    }

    #[tokio::test]
    async fn outcome_is_applied_once() {
        let store = InMemoryStore::new();
        let mut command = market_buy(3, Utc::now() + Duration::minutes(1));
        command.status_id = EXECUTING;
        command.connector_id = Some(1);
        store.put(command).await;

        let outcome = Outcome {
            command_id: 3,
            status_from: EXECUTING,
            status_to: FILLED,
            order: None,
            description: "filled".into(),
            timestamp: Utc::now(),
        };

        assert!(store.record_outcome(&outcome).await.unwrap());
        assert!(!store.record_outcome(&outcome).await.unwrap());

        let stored = store.load_by_id(3).await.unwrap().unwrap();
        assert_eq!(stored.status_id, FILLED);
        assert_eq!(stored.connector_id, None);
        assert_eq!(store.history(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expire_leaves_claimed_commands_alone() {
        let store = InMemoryStore::new();
        store.put(market_buy(1, Utc::now() - Duration::seconds(5))).await;
        let mut executing = market_buy(2, Utc::now() - Duration::seconds(5));
        executing.status_id = EXECUTING;
        executing.connector_id = Some(1);
        store.put(executing).await;

        let expired = store
            .expire_overdue(&ExpireRequest {
                status_from: vec![CREATED],
                status_to: TIMED_OUT,
                now: Utc::now(),
                limit: 10,
            })
            .await
            .unwrap();

        assert_eq!(expired, vec![1]);
        assert_eq!(store.load_by_id(2).await.unwrap().unwrap().status_id, EXECUTING);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = InMemoryStore::new();
        store.fail_next(2);
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_err());
        assert!(store.ping().await.is_ok());
    }
}

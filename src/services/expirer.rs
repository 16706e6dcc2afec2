//! Times out Created commands whose deadline passed before any connector
//! claimed them. Error commands are left to the dispatcher, which verifies
//! them against the exchange.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ExpirerConfig;
use crate::domain::StatusIds;
use crate::error::Result;
use crate::store::{CommandStore, ExpireRequest};

pub struct Expirer {
    store: Arc<dyn CommandStore>,
    statuses: StatusIds,
    config: ExpirerConfig,
}

impl Expirer {
    pub fn new(store: Arc<dyn CommandStore>, statuses: StatusIds, config: ExpirerConfig) -> Self {
        Self {
            store,
            statuses,
            config,
        }
    }

    /// Sweep at the configured interval until the task is dropped.
    pub async fn run(self) {
        info!(
            interval_ms = self.config.interval_ms,
            batch_limit = self.config.batch_limit,
            "expirer started"
        );
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.sweep().await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "overdue commands timed out"),
                Err(e) => warn!(error = %e, "expiry sweep failed"),
            }
        }
    }

    /// Expire overdue commands in batches until a short batch comes back.
    pub async fn sweep(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let request = ExpireRequest {
                status_from: vec![self.statuses.created],
                status_to: self.statuses.timed_out,
                now: Utc::now(),
                limit: self.config.batch_limit,
            };
            let expired = self.store.expire_overdue(&request).await?;
            if !expired.is_empty() {
                debug!(ids = ?expired, "expired batch");
            }
            total += expired.len();
            if (expired.len() as i64) < self.config.batch_limit {
                return Ok(total);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::fixtures::market_buy;
    use crate::domain::Dictionaries;
    use crate::store::{InMemoryStore, MockCommandStore};
    use chrono::Duration;

    fn statuses() -> StatusIds {
        StatusIds::resolve(&Dictionaries::standard()).unwrap()
    }

    fn config(batch_limit: i64) -> ExpirerConfig {
        ExpirerConfig {
            enabled: true,
            interval_ms: 10,
            batch_limit,
        }
    }

    #[tokio::test]
    async fn sweep_drains_in_batches() {
        let store = Arc::new(InMemoryStore::new());
        let past = Utc::now() - Duration::seconds(5);
        for id in 1..=5 {
            store.put(market_buy(id, past)).await;
        }
        store.put(market_buy(6, Utc::now() + Duration::hours(1))).await;

        let expirer = Expirer::new(store.clone(), statuses(), config(2));
        assert_eq!(expirer.sweep().await.unwrap(), 5);

        for id in 1..=5 {
            let command = store.load_by_id(id).await.unwrap().unwrap();
            assert_eq!(command.status_id, statuses().timed_out);
        }
        let pending = store.load_by_id(6).await.unwrap().unwrap();
        assert_eq!(pending.status_id, statuses().created);
    }

    #[tokio::test]
    async fn sweep_requests_created_only() {
        let mut store = MockCommandStore::new();
        store
            .expect_expire_overdue()
            .withf(|r: &ExpireRequest| r.status_from == vec![1] && r.status_to == 5)
            .times(1)
            .returning(|_| Ok(vec![3]));

        let expirer = Expirer::new(Arc::new(store), statuses(), config(10));
        assert_eq!(expirer.sweep().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn overdue_error_commands_are_left_for_verification() {
        let store = Arc::new(InMemoryStore::new());
        let mut failed = market_buy(1, Utc::now() - Duration::seconds(5));
        failed.status_id = statuses().error;
        store.put(failed).await;

        let expirer = Expirer::new(store.clone(), statuses(), config(10));
        assert_eq!(expirer.sweep().await.unwrap(), 0);

        let command = store.load_by_id(1).await.unwrap().unwrap();
        assert_eq!(command.status_id, statuses().error);
        assert!(store.history(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_error_is_reported() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next(1);
        let expirer = Expirer::new(store, statuses(), config(10));
        assert!(expirer.sweep().await.is_err());
    }
}

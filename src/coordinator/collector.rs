use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::inflight::InFlight;
use crate::domain::{Command, StatusIds};
use crate::error::{RelayError, Result};
use crate::protocol::{ExecKind, ExecResponse, ExecStatus};
use crate::store::{CommandStore, Outcome};

/// Announces a request to the collector before it reaches the pool.
pub(crate) struct Registration {
    pub id: u64,
    pub kind: ExecKind,
    pub command: Option<Command>,
    pub waiter: Option<oneshot::Sender<ExecResponse>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    ok: u64,
    error: u64,
    rejected: u64,
    timed_out: u64,
    connectivity: u64,
    duplicates: u64,
}

impl Stats {
    fn record(&mut self, kind: ExecKind, status: ExecStatus) {
        if kind == ExecKind::CheckConnectivity {
            self.connectivity += 1;
            return;
        }
        match status {
            ExecStatus::Ok => self.ok += 1,
            ExecStatus::Error => self.error += 1,
            ExecStatus::Rejected => self.rejected += 1,
            ExecStatus::TimedOut => self.timed_out += 1,
        }
    }
}

/// Consumes pool responses: correlates, persists, releases in-flight
/// slots and refreshes the connectivity watermark.
pub(crate) struct Collector {
    store: Arc<dyn CommandStore>,
    statuses: StatusIds,
    in_flight: Arc<InFlight>,
    watermark: watch::Sender<Instant>,
    store_backoff: Duration,
    stats_interval: Duration,
    stats: Stats,
}

impl Collector {
    pub fn new(
        store: Arc<dyn CommandStore>,
        statuses: StatusIds,
        in_flight: Arc<InFlight>,
        watermark: watch::Sender<Instant>,
        store_backoff: Duration,
        stats_interval: Duration,
    ) -> Self {
        Self {
            store,
            statuses,
            in_flight,
            watermark,
            store_backoff,
            stats_interval,
            stats: Stats::default(),
        }
    }

    pub async fn run(
        mut self,
        mut registrations: mpsc::Receiver<Registration>,
        mut responses: mpsc::Receiver<ExecResponse>,
    ) -> Result<()> {
        let mut pending: HashMap<u64, Registration> = HashMap::new();
        let mut registrations_open = true;

        let mut stats_tick =
            tokio::time::interval_at(Instant::now() + self.stats_interval, self.stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                registration = registrations.recv(), if registrations_open => {
                    match registration {
                        Some(registration) => {
                            let id = registration.id;
                            if pending.insert(id, registration).is_some() {
                                return Err(RelayError::protocol(format!(
                                    "request id {} registered twice",
                                    id
                                )));
                            }
                        }
                        None => {
                            registrations_open = false;
                            if pending.is_empty() {
                                return Ok(());
                            }
                        }
                    }
                }
                response = responses.recv() => {
                    match response {
                        Some(response) => {
                            self.collect(&mut pending, response).await?;
                            if !registrations_open && pending.is_empty() {
                                return Ok(());
                            }
                        }
                        None if pending.is_empty() => return Ok(()),
                        None => {
                            return Err(RelayError::protocol(format!(
                                "response channel closed with {} requests in flight",
                                pending.len()
                            )));
                        }
                    }
                }
                _ = stats_tick.tick() => self.log_stats(),
            }
        }
    }

    async fn collect(
        &mut self,
        pending: &mut HashMap<u64, Registration>,
        response: ExecResponse,
    ) -> Result<()> {
        let registration = pending.remove(&response.id).ok_or_else(|| {
            RelayError::protocol(format!("response id {} is unknown", response.id))
        })?;
        self.stats.record(registration.kind, response.status);

        if let Some(command) = &registration.command {
            let outcome = Outcome {
                command_id: command.id,
                status_from: self.statuses.executing,
                status_to: response.status.target_status(&self.statuses),
                order: response.order.clone(),
                description: response
                    .persisted_description()
                    .unwrap_or_else(|_| response.description.clone()),
                timestamp: Utc::now(),
            };
            self.persist(&outcome).await?;

            debug!(
                request_id = response.id,
                command_id = command.id,
                kind = %registration.kind,
                status = %response.status,
                elapsed_ms = response.elapsed.as_millis() as u64,
                "response collected"
            );
        }

        self.in_flight.release()?;

        if response.is_ok() {
            self.watermark.send_replace(Instant::now());
        }

        if let Some(waiter) = registration.waiter {
            if waiter.send(response).is_err() {
                warn!(request_id = registration.id, "response waiter went away");
            }
        }

        Ok(())
    }

    /// Terminal outcomes are never dropped: store failures are retried
    /// until the write lands.
    async fn persist(&mut self, outcome: &Outcome) -> Result<()> {
        loop {
            match self.store.record_outcome(outcome).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    self.stats.duplicates += 1;
                    debug!(command_id = outcome.command_id, "outcome already recorded");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        command_id = outcome.command_id,
                        error = %e,
                        backoff_ms = self.store_backoff.as_millis() as u64,
                        "failed to record outcome, retrying"
                    );
                    tokio::time::sleep(self.store_backoff).await;
                }
            }
        }
    }

    fn log_stats(&self) {
        info!(
            ok = self.stats.ok,
            error = self.stats.error,
            rejected = self.stats.rejected,
            timed_out = self.stats.timed_out,
            connectivity_checks = self.stats.connectivity,
            duplicate_outcomes = self.stats.duplicates,
            in_flight = self.in_flight.current(),
            peak_in_flight = self.in_flight.peak(),
            "execution stats"
        );
    }
}

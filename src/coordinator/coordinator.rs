//! Execution Coordinator
//!
//! Two activities share an [`InFlight`] counter:
//!
//! - the dispatcher recovers commands left Executing by a previous run, then
//!   claims new (and retryable Error) commands and submits them to the
//!   connector pool, pinging the exchange when it has been quiet;
//! - the collector consumes pool responses, persists outcomes and frees
//!   in-flight slots.
//!
//! Registrations travel to the collector before the matching request reaches
//! the pool, so every response finds its registration.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::collector::{Collector, Registration};
use super::config::CoordinatorConfig;
use super::inflight::InFlight;
use crate::domain::{Command, Dictionaries, OrderType, RawCommand, StatusIds};
use crate::error::{RelayError, Result};
use crate::protocol::{ExecKind, ExecRequest, ExecResponse, ExecStatus};
use crate::store::{ClaimRequest, CommandStore};

/// Where a command came from when it was picked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Created,
    Retry,
    Recovery,
}

impl Origin {
    fn kind_for(self, raw: &RawCommand) -> ExecKind {
        if raw.order_type == OrderType::Info {
            return ExecKind::Info;
        }
        match self {
            Origin::Created => ExecKind::Execute,
            Origin::Retry | Origin::Recovery => ExecKind::Verify,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    Dispatched(usize),
    Idle,
    Saturated,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    dictionaries: Arc<Dictionaries>,
    statuses: StatusIds,
    exchange_id: i16,
    connector_id: i16,
    in_flight: Arc<InFlight>,
    dispatch_store: Arc<dyn CommandStore>,
    outcome_store: Arc<dyn CommandStore>,
}

impl Coordinator {
    /// `capacity` is the connector pool size. Claims and recovery go through
    /// `dispatch_store`; outcomes are written through `outcome_store`.
    pub fn new(
        config: CoordinatorConfig,
        dictionaries: Arc<Dictionaries>,
        exchange_id: i16,
        connector_id: i16,
        capacity: usize,
        dispatch_store: Arc<dyn CommandStore>,
        outcome_store: Arc<dyn CommandStore>,
    ) -> Result<Self> {
        let problems = config.validate(capacity);
        if !problems.is_empty() {
            return Err(RelayError::InvalidConfig(problems.join("; ")));
        }
        let statuses = StatusIds::resolve(&dictionaries)?;

        Ok(Self {
            config,
            dictionaries,
            statuses,
            exchange_id,
            connector_id,
            in_flight: Arc::new(InFlight::new(capacity)),
            dispatch_store,
            outcome_store,
        })
    }

    /// Read-only view of the in-flight counter
    pub fn in_flight(&self) -> Arc<InFlight> {
        self.in_flight.clone()
    }

    /// Run recovery, then dispatch forever. Returns only on a fatal error.
    pub async fn run(
        self,
        requests: mpsc::Sender<ExecRequest>,
        responses: mpsc::Receiver<ExecResponse>,
    ) -> Result<()> {
        let (registration_tx, registration_rx) = mpsc::channel(self.config.channel_capacity);
        let (watermark_tx, watermark_rx) = watch::channel(Instant::now());

        let collector = Collector::new(
            self.outcome_store,
            self.statuses,
            self.in_flight.clone(),
            watermark_tx,
            self.config.store_backoff(),
            self.config.stats_interval(),
        );

        let dispatcher = Dispatcher {
            config: self.config,
            dictionaries: self.dictionaries,
            statuses: self.statuses,
            exchange_id: self.exchange_id,
            connector_id: self.connector_id,
            in_flight: self.in_flight,
            store: self.dispatch_store,
            requests,
            registrations: registration_tx,
            watermark: watermark_rx,
            next_request_id: 0,
        };

        info!(
            exchange_id = self.exchange_id,
            connector_id = self.connector_id,
            "Coordinator started"
        );

        let result = tokio::try_join!(
            collector.run(registration_rx, responses),
            dispatcher.run()
        );
        if let Err(e) = &result {
            error!(error = %e, "Coordinator stopped");
        }
        result.map(|_| ())
    }
}

struct Dispatcher {
    config: CoordinatorConfig,
    dictionaries: Arc<Dictionaries>,
    statuses: StatusIds,
    exchange_id: i16,
    connector_id: i16,
    in_flight: Arc<InFlight>,
    store: Arc<dyn CommandStore>,
    requests: mpsc::Sender<ExecRequest>,
    registrations: mpsc::Sender<Registration>,
    watermark: watch::Receiver<Instant>,
    next_request_id: u64,
}

impl Dispatcher {
    async fn run(mut self) -> Result<()> {
        self.recover().await?;

        loop {
            match self.dispatch_round().await {
                Ok(Round::Dispatched(count)) => {
                    debug!(count, in_flight = self.in_flight.current(), "dispatched");
                }
                Ok(Round::Saturated) => tokio::time::sleep(self.config.idle_sleep()).await,
                Ok(Round::Idle) => {
                    if self.connectivity_stale() {
                        self.ping().await?;
                    } else {
                        tokio::time::sleep(self.config.idle_sleep()).await;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.config.store_backoff_ms,
                        "dispatch failed, backing off"
                    );
                    tokio::time::sleep(self.config.store_backoff()).await;
                }
            }
        }
    }

    /// Verify, one at a time, every command this connector left Executing
    /// before `as_of` (process start).
    async fn recover(&mut self) -> Result<()> {
        let as_of = Utc::now();
        let mut recovered = 0usize;

        info!(%as_of, "Recovering commands left executing");

        loop {
            let batch = match self
                .store
                .claim_batch_for_recovery(
                    self.exchange_id,
                    self.connector_id,
                    self.statuses.executing,
                    as_of,
                    self.config.batch_limit as i64,
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "recovery query failed, backing off");
                    tokio::time::sleep(self.config.store_backoff()).await;
                    continue;
                }
            };

            if batch.is_empty() {
                break;
            }

            for command in batch {
                debug!(command_id = command.id, "verifying command after restart");
                self.in_flight.acquire().await;
                self.submit(command, Origin::Recovery).await?;
                self.in_flight.wait_idle(self.config.recovery_poll()).await;
                recovered += 1;
            }
        }

        info!(recovered, "Recovery complete");
        Ok(())
    }

    async fn dispatch_round(&mut self) -> Result<Round> {
        if !self.in_flight.has_room_for(self.config.batch_limit) {
            return Ok(Round::Saturated);
        }

        let mut dispatched = 0;
        while dispatched < self.config.batch_limit {
            let Some((command, origin)) = self.claim_next().await? else {
                break;
            };
            if !self.in_flight.try_acquire() {
                return Err(RelayError::protocol(
                    "in-flight capacity exhausted inside a reserved batch",
                ));
            }
            self.submit(command, origin).await?;
            dispatched += 1;
        }

        Ok(if dispatched == 0 {
            Round::Idle
        } else {
            Round::Dispatched(dispatched)
        })
    }

    /// Created commands first, then Error commands old enough to retry.
    ///
    /// Retries are verified, never resubmitted, so an Error command is
    /// claimed even past its deadline: only the exchange can tell whether
    /// its order filled or is unknown.
    async fn claim_next(&self) -> Result<Option<(Command, Origin)>> {
        let now = Utc::now();

        let fresh = ClaimRequest {
            exchange_id: self.exchange_id,
            connector_id: self.connector_id,
            status_from: self.statuses.created,
            status_to: self.statuses.executing,
            deadline_after: Some(now + chrono_duration(self.config.submission_lead())),
            updated_before: None,
        };
        if let Some(command) = self.store.claim_for_execution(&fresh).await? {
            return Ok(Some((command, Origin::Created)));
        }

        let retry = ClaimRequest {
            status_from: self.statuses.error,
            deadline_after: None,
            updated_before: Some(now - chrono_duration(self.config.error_retry_delay())),
            ..fresh
        };
        Ok(self
            .store
            .claim_for_execution(&retry)
            .await?
            .map(|command| (command, Origin::Retry)))
    }

    /// Hand a claimed command to the pool. The caller holds an in-flight slot.
    async fn submit(&mut self, command: Command, origin: Origin) -> Result<()> {
        let raw = RawCommand::resolve(&command, &self.dictionaries)?;
        let kind = origin.kind_for(&raw);
        let id = self.next_id();

        debug!(
            request_id = id,
            command_id = command.id,
            %kind,
            instrument = %raw.instrument,
            "submitting"
        );

        self.register(Registration {
            id,
            kind,
            command: Some(command.clone()),
            waiter: None,
        })
        .await?;
        self.send(ExecRequest::for_command(id, kind, raw, command))
            .await
    }

    fn connectivity_stale(&self) -> bool {
        self.watermark.borrow().elapsed() >= self.config.ping_threshold()
    }

    /// Probe the exchange until it answers Ok.
    async fn ping(&mut self) -> Result<()> {
        loop {
            self.in_flight.acquire().await;
            let id = self.next_id();
            let (waiter_tx, waiter_rx) = oneshot::channel();

            self.register(Registration {
                id,
                kind: ExecKind::CheckConnectivity,
                command: None,
                waiter: Some(waiter_tx),
            })
            .await?;
            self.send(ExecRequest::check_connectivity(id)).await?;

            let response = waiter_rx.await.map_err(|_| {
                RelayError::protocol(format!("no response for connectivity check {}", id))
            })?;
            if response.id != id {
                return Err(RelayError::protocol(format!(
                    "connectivity check {} answered by response {}",
                    id, response.id
                )));
            }

            match response.status {
                ExecStatus::Ok => {
                    debug!(request_id = id, "exchange reachable");
                    return Ok(());
                }
                status => {
                    warn!(
                        request_id = id,
                        %status,
                        description = %response.description,
                        backoff_ms = self.config.ping_backoff_ms,
                        "exchange unreachable"
                    );
                    tokio::time::sleep(self.config.ping_backoff()).await;
                }
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    async fn register(&self, registration: Registration) -> Result<()> {
        self.registrations
            .send(registration)
            .await
            .map_err(|_| RelayError::protocol("response collector stopped"))
    }

    async fn send(&self, request: ExecRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| RelayError::protocol("connector pool stopped"))
    }
}

fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

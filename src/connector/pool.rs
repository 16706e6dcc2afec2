use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{non_empty_balances, ExchangeHandler};
use crate::error::{RelayError, Result};
use crate::protocol::{ensure_correlated, ExecKind, ExecRequest, ExecResponse, ExecStatus};

/// Bounded worker pool in front of one exchange handler.
///
/// Each request is served by exactly one worker; at most `size` workers
/// run at a time. Responses are posted in completion order.
pub struct ConnectorPool<H> {
    handler: Arc<H>,
    size: usize,
}

impl<H: ExchangeHandler> ConnectorPool<H> {
    pub fn new(handler: H, size: usize) -> Self {
        Self::with_handler(Arc::new(handler), size)
    }

    pub fn with_handler(handler: Arc<H>, size: usize) -> Self {
        Self {
            handler,
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Serve requests until the request channel closes. Returns the first
    /// fatal error raised by a worker.
    pub async fn run(
        self,
        mut requests: mpsc::Receiver<ExecRequest>,
        responses: mpsc::Sender<ExecResponse>,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.size));
        let mut workers: JoinSet<Result<()>> = JoinSet::new();

        info!(
            exchange = self.handler.name(),
            size = self.size,
            "Connector pool started"
        );

        loop {
            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    settle(joined)?;
                }
                next = requests.recv() => {
                    let Some(request) = next else {
                        break;
                    };

                    let permit = permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| RelayError::Internal(format!("worker permits closed: {}", e)))?;

                    let handler = self.handler.clone();
                    let responses = responses.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        let response = handle(handler.as_ref(), &request).await?;
                        ensure_correlated(&request, &response)?;
                        responses.send(response).await.map_err(|_| {
                            RelayError::protocol(format!(
                                "response channel closed before request {} was answered",
                                request.id
                            ))
                        })
                    });
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            settle(joined)?;
        }

        info!("Connector pool stopped");
        Ok(())
    }
}

fn settle(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Connector worker failed");
            Err(e)
        }
        Err(e) => Err(RelayError::Internal(format!("connector worker panicked: {}", e))),
    }
}

/// Run one request against the handler. Non-fatal handler errors become
/// Error responses; fatal ones are returned.
async fn handle<H: ExchangeHandler + ?Sized>(
    handler: &H,
    request: &ExecRequest,
) -> Result<ExecResponse> {
    let mut response = ExecResponse::new(request);
    let started = Instant::now();

    let result = match request.kind {
        ExecKind::CheckConnectivity => handler.ping().await.map(|()| {
            response.status = ExecStatus::Ok;
            response.description = "pong".into();
        }),
        ExecKind::Execute => handler.execute(request.raw()?).await.map(|execution| {
            response.status = execution.status;
            response.description = execution.description;
            response.order = execution.order;
        }),
        ExecKind::Verify => handler.verify(request.raw()?).await.map(|execution| {
            response.status = execution.status;
            response.description = execution.description;
            response.order = execution.order;
        }),
        ExecKind::Info => handler.info(request.raw()?).await.map(|balances| {
            response.status = ExecStatus::Ok;
            response.balances = non_empty_balances(balances);
        }),
    };
    response.elapsed = started.elapsed();

    match result {
        Ok(()) => {
            debug!(
                request_id = request.id,
                kind = %request.kind,
                status = %response.status,
                elapsed_ms = response.elapsed.as_millis() as u64,
                "request handled"
            );
        }
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(
                request_id = request.id,
                command_id = ?request.command_id(),
                kind = %request.kind,
                error = %e,
                "exchange call failed"
            );
            response.status = ExecStatus::Error;
            response.description = e.to_string();
        }
    }

    Ok(response)
}

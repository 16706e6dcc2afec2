use std::net::SocketAddr;
use std::sync::Arc;

use execrelay::api::{self, AppState};
use execrelay::config::{AppConfig, LoggingConfig};
use execrelay::connector::{BinanceHandler, ConnectorKind, ConnectorPool, SimulatedExchange};
use execrelay::coordinator::Coordinator;
use execrelay::domain::StatusIds;
use execrelay::error::{RelayError, Result};
use execrelay::services::Expirer;
use execrelay::store::PostgresStore;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Console logging plus an optional daily rolling file. The returned guard
/// must live as long as the process so buffered lines reach the file.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{level},execrelay={level},sqlx=warn",
            level = config.level
        ))
    });

    let mut guard = None;
    let file_layer = config.dir.as_deref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                dir, e
            );
            return None;
        }
        let file_appender = tracing_appender::rolling::daily(dir, "execrelay.log");
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let console_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Coordinator plus connector pool until a signal or a fatal error.
pub async fn run_coordinator(config: AppConfig) -> Result<()> {
    let dispatch_store =
        PostgresStore::new(&config.database.url, config.database.dispatcher_connections).await?;
    let outcome_store =
        PostgresStore::new(&config.database.url, config.database.collector_connections).await?;

    let dictionaries = Arc::new(dispatch_store.load_dictionaries().await?);
    let exchange_id = dictionaries.exchanges().require_id(&config.exchange.name)?;

    let coordinator = Coordinator::new(
        config.coordinator.clone(),
        dictionaries,
        exchange_id,
        config.connector.id,
        config.connector.pool_size,
        Arc::new(dispatch_store),
        Arc::new(outcome_store),
    )?;

    let (request_tx, request_rx) = mpsc::channel(config.coordinator.channel_capacity);
    let (response_tx, response_rx) = mpsc::channel(config.coordinator.channel_capacity);

    let exchange = &config.exchange;
    let pool: JoinHandle<Result<()>> = match exchange.kind {
        ConnectorKind::Binance => {
            let handler = BinanceHandler::new(
                exchange.rest_url.as_deref(),
                exchange.recv_window_ms,
                exchange.request_timeout(),
            )?;
            tokio::spawn(
                ConnectorPool::new(handler, config.connector.pool_size)
                    .run(request_rx, response_tx),
            )
        }
        ConnectorKind::Simulated => {
            let handler = SimulatedExchange::new(exchange.simulated_fill_price).with_latency(
                std::time::Duration::from_millis(exchange.simulated_latency_ms),
            );
            tokio::spawn(
                ConnectorPool::new(handler, config.connector.pool_size)
                    .run(request_rx, response_tx),
            )
        }
    };

    info!(
        exchange = %exchange.name,
        kind = %exchange.kind,
        connector_id = config.connector.id,
        pool_size = config.connector.pool_size,
        "execrelay running"
    );

    tokio::select! {
        result = coordinator.run(request_tx, response_rx) => result,
        joined = pool => {
            joined.map_err(|e| RelayError::Internal(format!("connector pool panicked: {}", e)))??;
            Err(RelayError::protocol("connector pool stopped while the coordinator was running"))
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

/// Submission API and expirer until a signal.
pub async fn serve(config: AppConfig) -> Result<()> {
    let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    let dictionaries = Arc::new(store.load_dictionaries().await?);
    let statuses = StatusIds::resolve(&dictionaries)?;
    let store = Arc::new(store);

    let expirer = config.expirer.enabled.then(|| {
        tokio::spawn(Expirer::new(store.clone(), statuses, config.expirer.clone()).run())
    });

    let addr: SocketAddr = config
        .submission
        .bind
        .parse()
        .map_err(|e| RelayError::InvalidConfig(format!("submission.bind: {}", e)))?;
    let state = AppState::new(store, dictionaries, config.submission.time_for_execution())?;

    let result = api::serve(state, addr, shutdown_signal()).await;

    if let Some(expirer) = expirer {
        expirer.abort();
    }
    info!("Submission API stopped");
    result
}

pub async fn migrate(config: AppConfig) -> Result<()> {
    let store = PostgresStore::new(&config.database.url, 1).await?;
    store.migrate().await?;
    info!("Migrations applied");
    Ok(())
}

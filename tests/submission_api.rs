use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use execrelay::api::{create_router, AppState};
use execrelay::connector::{ConnectorPool, SimulatedExchange};
use execrelay::coordinator::{Coordinator, CoordinatorConfig};
use execrelay::domain::Dictionaries;
use execrelay::store::InMemoryStore;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn submit(body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri("/execution/v1/command")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn lookup(id: &Value) -> Request<Body> {
    Request::builder()
        .uri(format!("/execution/v1/command/{}", id))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn submitted_command_is_executed_and_visible() {
    let store = Arc::new(InMemoryStore::new());
    let dictionaries = Arc::new(Dictionaries::standard());
    let app = create_router(
        AppState::new(store.clone(), dictionaries.clone(), Duration::from_secs(60)).unwrap(),
    );

    let (status, body) = call(
        &app,
        submit(json!({
            "exchange": "BINANCE",
            "instrument": "BTCUSDT",
            "direction": "BUY",
            "order_type": "LIMIT",
            "limit_price": "27000",
            "amount": "0.1",
            "execution_type": "OPEN",
            "time_in_force": "IOC",
            "ref_position_id": "pos-1",
            "account_id": "501",
            "api_key": "key",
            "secret_key": "secret"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].clone();

    let (status, body) = call(&app, lookup(&id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CREATED");

    let config = CoordinatorConfig {
        batch_limit: 2,
        idle_sleep_ms: 5,
        ..CoordinatorConfig::default()
    };
    let (request_tx, request_rx) = mpsc::channel(config.channel_capacity);
    let (response_tx, response_rx) = mpsc::channel(config.channel_capacity);
    let coordinator =
        Coordinator::new(config, dictionaries, 1, 1, 2, store.clone(), store.clone()).unwrap();
    let pool = tokio::spawn(
        ConnectorPool::new(SimulatedExchange::new(dec!(100)), 2).run(request_rx, response_tx),
    );
    let relay = tokio::spawn(coordinator.run(request_tx, response_rx));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let body = loop {
        let (_, body) = call(&app, lookup(&id)).await;
        if body["status"] == "FILLED" {
            break body;
        }
        assert!(tokio::time::Instant::now() < deadline, "command not filled: {}", body);
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(body["command"]["fill_price"], "27000");
    let steps: Vec<(String, String)> = body["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| (h["from"].to_string(), h["to"].to_string()))
        .collect();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[2], ("\"EXECUTING\"".to_string(), "\"FILLED\"".to_string()));

    relay.abort();
    pool.abort();
}

#[tokio::test]
async fn rejected_submission_leaves_store_untouched() {
    let store = Arc::new(InMemoryStore::new());
    let app = create_router(
        AppState::new(
            store.clone(),
            Arc::new(Dictionaries::standard()),
            Duration::from_secs(60),
        )
        .unwrap(),
    );

    let (status, body) = call(
        &app,
        submit(json!({
            "exchange": "BINANCE",
            "instrument": "BTCUSDT",
            "direction": "BUY",
            "order_type": "LIMIT",
            "amount": "0.1",
            "execution_type": "OPEN",
            "account_id": 501,
            "api_key": "key",
            "secret_key": "secret"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("limit_price"));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn unknown_exchange_is_not_inserted() {
    let store = Arc::new(InMemoryStore::new());
    let app = create_router(
        AppState::new(
            store.clone(),
            Arc::new(Dictionaries::standard()),
            Duration::from_secs(60),
        )
        .unwrap(),
    );

    let (status, body) = call(
        &app,
        submit(json!({
            "exchange": "KRAKEN",
            "instrument": "BTCUSD",
            "direction": "BUY",
            "order_type": "MARKET",
            "amount": "1.0",
            "execution_type": "OPEN",
            "account_id": 501,
            "api_key": "key",
            "secret_key": "secret"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("KRAKEN"));
    assert!(store.is_empty().await);
}

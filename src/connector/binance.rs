//! Binance spot REST connector.
//!
//! Credentials come from each command and are never cached; the client
//! holds only the HTTP connection pool.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::{
    require_trade, ExchangeHandler, ExchangeOrder, Execution, OrderState, UnknownOrder, NOT_FILLED,
    STILL_PENDING, UNKNOWN_PAST_DEADLINE,
};
use crate::domain::{OrderType, RawCommand};
use crate::error::{RelayError, Result};
use crate::protocol::Balance;

pub const DEFAULT_BINANCE_API_BASE: &str = "https://api.binance.com";

const ORDER_PATH: &str = "/api/v3/order";
const ACCOUNT_PATH: &str = "/api/v3/account";
const PING_PATH: &str = "/api/v3/ping";

/// Order does not exist
const CODE_UNKNOWN_ORDER: i64 = -2013;
/// New order rejected; carries "Duplicate order sent." for a reused client id
const CODE_ORDER_REJECTED: i64 = -2010;

type HmacSha256 = Hmac<Sha256>;

/// Error payload returned with non-2xx statuses
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

impl ApiError {
    fn is_unknown_order(&self) -> bool {
        self.code == CODE_UNKNOWN_ORDER
    }

    fn is_duplicate_order(&self) -> bool {
        self.code == CODE_ORDER_REJECTED && self.msg.to_ascii_lowercase().contains("duplicate")
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Binance API error {}: {}", self.code, self.msg)
    }
}

type Reply<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderReply {
    order_id: i64,
    client_order_id: String,
    status: String,
    #[serde(default)]
    price: Decimal,
    #[serde(default)]
    executed_qty: Decimal,
    #[serde(default)]
    cummulative_quote_qty: Decimal,
    #[serde(default)]
    fills: Vec<FillReply>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FillReply {
    price: Decimal,
    qty: Decimal,
    commission: Decimal,
    commission_asset: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AccountReply {
    balances: Vec<Balance>,
}

impl OrderReply {
    /// Quantity-weighted fill price; falls back to quote/executed quantity
    /// for queried orders, which carry no fills.
    fn average_price(&self) -> Decimal {
        let filled: Decimal = self.fills.iter().map(|f| f.qty).sum();
        if !filled.is_zero() {
            let notional: Decimal = self.fills.iter().map(|f| f.price * f.qty).sum();
            return (notional / filled).normalize();
        }
        if !self.executed_qty.is_zero() {
            return (self.cummulative_quote_qty / self.executed_qty).normalize();
        }
        self.price
    }

    /// Commission charged in the asset of the first fill. Fills charged in
    /// another asset are left out.
    fn commission(&self) -> (Decimal, Option<String>) {
        let Some(asset) = self.fills.first().map(|f| f.commission_asset.clone()) else {
            return (Decimal::ZERO, None);
        };
        let total = self
            .fills
            .iter()
            .filter(|f| f.commission_asset == asset)
            .map(|f| f.commission)
            .sum();
        (total, Some(asset))
    }

    fn into_order(self) -> ExchangeOrder {
        let (commission, commission_asset) = self.commission();
        ExchangeOrder {
            external_order_id: self.order_id.to_string(),
            price: self.average_price(),
            commission,
            commission_asset,
            state: OrderState::parse(&self.status),
            client_order_id: self.client_order_id,
        }
    }
}

#[derive(Clone)]
pub struct BinanceHandler {
    http: Client,
    base_url: String,
    recv_window_ms: u64,
}

impl BinanceHandler {
    pub fn new(base_url: Option<&str>, recv_window_ms: u64, timeout: Duration) -> Result<Self> {
        let base_url = base_url
            .unwrap_or(DEFAULT_BINANCE_API_BASE)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent(concat!("execrelay/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build Binance HTTP client: {}", e)))?;

        info!(base_url = %base_url, "Binance connector configured");
        Ok(Self {
            http,
            base_url,
            recv_window_ms,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn sign(secret: &str, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| RelayError::Auth(format!("invalid Binance secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn signed_query(&self, params: &[(&str, String)], secret: &str) -> Result<String> {
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        query.push(format!("recvWindow={}", self.recv_window_ms));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");

        let signature = Self::sign(secret, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    /// Signed request. API-level rejections are returned as `Ok(Err(_))` so
    /// callers can branch on the error code.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        raw: &RawCommand,
    ) -> Result<Reply<T>> {
        if raw.api_key.is_empty() || raw.secret_key.is_empty() {
            return Err(RelayError::Auth(format!(
                "command {} has no API credentials",
                raw.command_id
            )));
        }

        let query = self.signed_query(params, &raw.secret_key)?;
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self
            .http
            .request(method.clone(), &url)
            .header("X-MBX-APIKEY", &raw.api_key)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;

        if status.is_success() {
            return Ok(Ok(serde_json::from_str(&text)?));
        }

        match serde_json::from_str::<ApiError>(&text) {
            Ok(api_error) => {
                debug!(%method, path, code = api_error.code, msg = %api_error.msg, "Binance rejected request");
                Ok(Err(api_error))
            }
            Err(_) => Err(RelayError::Exchange(format!(
                "Binance {} {} failed: status={} body={}",
                method, path, status, text
            ))),
        }
    }

    fn symbol(raw: &RawCommand) -> String {
        raw.instrument.replace('/', "").to_ascii_uppercase()
    }

    fn order_params(raw: &RawCommand) -> Result<Vec<(&'static str, String)>> {
        let mut params = vec![
            ("symbol", Self::symbol(raw)),
            ("side", raw.side.as_str().to_string()),
            ("type", raw.order_type.as_str().to_string()),
            ("quantity", raw.amount.normalize().to_string()),
            ("newClientOrderId", raw.fingerprint.clone()),
            ("newOrderRespType", "FULL".to_string()),
        ];

        if raw.order_type == OrderType::Limit {
            let price = raw.limit_price.ok_or_else(|| {
                RelayError::protocol(format!(
                    "command {} is LIMIT without a limit price",
                    raw.command_id
                ))
            })?;
            let time_in_force = raw.time_in_force.map(|t| t.as_str()).unwrap_or("GTC");
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", time_in_force.to_string()));
        }

        Ok(params)
    }

    async fn query_order(&self, raw: &RawCommand) -> Result<Reply<OrderReply>> {
        let params = [
            ("symbol", Self::symbol(raw)),
            ("origClientOrderId", raw.fingerprint.clone()),
        ];
        self.signed(Method::GET, ORDER_PATH, &params, raw).await
    }
}

#[async_trait]
impl ExchangeHandler for BinanceHandler {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn execute(&self, raw: &RawCommand) -> Result<Execution> {
        require_trade(raw)?;
        let params = Self::order_params(raw)?;

        match self
            .signed::<OrderReply>(Method::POST, ORDER_PATH, &params, raw)
            .await?
        {
            Ok(reply) => Ok(Execution::from_order(&reply.into_order(), NOT_FILLED)),
            Err(api_error) if api_error.is_duplicate_order() => {
                info!(
                    command_id = raw.command_id,
                    client_order_id = %raw.fingerprint,
                    "client order id already used, trusting existing order"
                );
                match self.query_order(raw).await? {
                    Ok(reply) => Ok(Execution::from_order(&reply.into_order(), NOT_FILLED)),
                    Err(api_error) => Err(RelayError::Exchange(api_error.to_string())),
                }
            }
            Err(api_error) => Err(RelayError::Exchange(api_error.to_string())),
        }
    }

    async fn verify(&self, raw: &RawCommand) -> Result<Execution> {
        require_trade(raw)?;

        match self.query_order(raw).await? {
            Ok(reply) => Ok(Execution::from_order(&reply.into_order(), STILL_PENDING)),
            Err(api_error) if api_error.is_unknown_order() => {
                match UnknownOrder::decide(raw, Utc::now()) {
                    UnknownOrder::Execute => {
                        debug!(command_id = raw.command_id, "order unknown, submitting");
                        self.execute(raw).await
                    }
                    UnknownOrder::TimedOut => {
                        warn!(command_id = raw.command_id, "order unknown after deadline");
                        Ok(Execution::timed_out(UNKNOWN_PAST_DEADLINE))
                    }
                }
            }
            Err(api_error) => Err(RelayError::Exchange(api_error.to_string())),
        }
    }

    async fn info(&self, raw: &RawCommand) -> Result<Vec<Balance>> {
        match self
            .signed::<AccountReply>(Method::GET, ACCOUNT_PATH, &[], raw)
            .await?
        {
            Ok(account) => Ok(account.balances),
            Err(api_error) => Err(RelayError::Exchange(api_error.to_string())),
        }
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}{}", self.base_url, PING_PATH);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(RelayError::Exchange(format!(
                "Binance ping failed: status={}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::fixtures::market_buy;
    use crate::domain::Dictionaries;
    use rust_decimal_macros::dec;

    fn raw() -> RawCommand {
        let command = market_buy(21, Utc::now() + chrono::Duration::minutes(1));
        RawCommand::resolve(&command, &Dictionaries::standard()).expect("resolves")
    }

    #[test]
    fn signature_is_hex_hmac_sha256() {
        // Reference vector from the Binance API documentation
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let signature = BinanceHandler::sign(secret, query).expect("signs");
        assert_eq!(
            signature,
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn market_order_params_use_fingerprint_as_client_id() {
        let params = BinanceHandler::order_params(&raw()).expect("params");
        assert!(params.contains(&("symbol", "BTCUSDT".to_string())));
        assert!(params.contains(&("side", "BUY".to_string())));
        assert!(params.contains(&("type", "MARKET".to_string())));
        assert!(params.contains(&("quantity", "0.5".to_string())));
        assert!(params.contains(&("newClientOrderId", "fp-21".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "price"));
    }

    #[test]
    fn limit_order_params_carry_price_and_time_in_force() {
        let mut raw = raw();
        raw.instrument = "eth/usdt".into();
        raw.order_type = OrderType::Limit;
        raw.limit_price = Some(dec!(1800.50));
        raw.time_in_force = Some(crate::domain::TimeInForce::FOK);

        let params = BinanceHandler::order_params(&raw).expect("params");
        assert!(params.contains(&("symbol", "ETHUSDT".to_string())));
        assert!(params.contains(&("price", "1800.5".to_string())));
        assert!(params.contains(&("timeInForce", "FOK".to_string())));
    }

    #[test]
    fn fill_price_is_quantity_weighted() {
        let reply: OrderReply = serde_json::from_str(
            r#"{
                "symbol": "BTCUSDT",
                "orderId": 28,
                "clientOrderId": "fp-21",
                "price": "0.00000000",
                "executedQty": "3.00000000",
                "cummulativeQuoteQty": "302.00000000",
                "status": "FILLED",
                "fills": [
                    {"price": "100.00", "qty": "1.00", "commission": "0.1", "commissionAsset": "BNB", "tradeId": 1},
                    {"price": "101.00", "qty": "2.00", "commission": "0.2", "commissionAsset": "BNB", "tradeId": 2}
                ]
            }"#,
        )
        .expect("order reply parses");

        let order = reply.into_order();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.external_order_id, "28");
        assert_eq!(order.price.round_dp(8), dec!(100.66666667));
        assert_eq!(order.commission, dec!(0.3));
        assert_eq!(order.commission_asset.as_deref(), Some("BNB"));
    }

    #[test]
    fn commission_only_sums_fills_in_the_first_asset() {
        let reply: OrderReply = serde_json::from_str(
            r#"{
                "orderId": 30,
                "clientOrderId": "fp-23",
                "price": "0.0",
                "executedQty": "3",
                "cummulativeQuoteQty": "300",
                "status": "FILLED",
                "fills": [
                    {"price": "100", "qty": "1", "commission": "0.001", "commissionAsset": "BNB"},
                    {"price": "100", "qty": "1", "commission": "0.1", "commissionAsset": "USDT"},
                    {"price": "100", "qty": "1", "commission": "0.002", "commissionAsset": "BNB"}
                ]
            }"#,
        )
        .expect("order reply parses");

        let order = reply.into_order();
        assert_eq!(order.commission, dec!(0.003));
        assert_eq!(order.commission_asset.as_deref(), Some("BNB"));
    }

    #[test]
    fn queried_order_price_falls_back_to_quote_quantity() {
        let reply: OrderReply = serde_json::from_str(
            r#"{
                "orderId": 29,
                "clientOrderId": "fp-22",
                "price": "0.0",
                "executedQty": "2",
                "cummulativeQuoteQty": "50",
                "status": "FILLED"
            }"#,
        )
        .expect("order reply parses");

        let order = reply.into_order();
        assert_eq!(order.price, dec!(25));
        assert_eq!(order.commission, Decimal::ZERO);
        assert_eq!(order.commission_asset, None);
    }

    #[test]
    fn api_error_codes_are_classified() {
        let unknown: ApiError =
            serde_json::from_str(r#"{"code": -2013, "msg": "Order does not exist."}"#).unwrap();
        assert!(unknown.is_unknown_order());
        assert!(!unknown.is_duplicate_order());

        let duplicate: ApiError =
            serde_json::from_str(r#"{"code": -2010, "msg": "Duplicate order sent."}"#).unwrap();
        assert!(duplicate.is_duplicate_order());

        let balance: ApiError = serde_json::from_str(
            r#"{"code": -2010, "msg": "Account has insufficient balance for requested action."}"#,
        )
        .unwrap();
        assert!(!balance.is_duplicate_order());
    }

    #[tokio::test]
    async fn info_requests_cannot_be_traded() {
        let handler =
            BinanceHandler::new(Some("http://127.0.0.1:9"), 5000, Duration::from_millis(50))
                .expect("client builds");
        let mut raw = raw();
        raw.order_type = OrderType::Info;

        let err = handler.execute(&raw).await.unwrap_err();
        assert!(err.is_fatal());
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::dictionary::Dictionaries;
use crate::error::{RelayError, Result};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(RelayError::Dictionary(format!("unknown direction '{}'", other))),
        }
    }
}

/// Order kind. `Info` is an account snapshot request, not a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Info,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::Info => "INFO",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "MARKET" => Ok(Self::Market),
            "LIMIT" => Ok(Self::Limit),
            "INFO" => Ok(Self::Info),
            other => Err(RelayError::Dictionary(format!("unknown order type '{}'", other))),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Fill Or Kill
    FOK,
    /// Immediate Or Cancel
    IOC,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::GTC => "GTC",
            TimeInForce::FOK => "FOK",
            TimeInForce::IOC => "IOC",
        }
    }
}

impl FromStr for TimeInForce {
    type Err = RelayError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "GTC" => Ok(Self::GTC),
            "FOK" => Ok(Self::FOK),
            "IOC" => Ok(Self::IOC),
            other => Err(RelayError::Dictionary(format!(
                "unknown time in force '{}'",
                other
            ))),
        }
    }
}

/// Persisted command (a row of the `execution` table)
#[derive(Clone, PartialEq, Serialize)]
pub struct Command {
    pub id: i64,
    pub exchange_id: i16,
    pub instrument: String,
    pub direction_id: i16,
    pub order_type_id: i16,
    pub limit_price: Option<Decimal>,
    pub amount: Decimal,
    pub status_id: i16,
    pub connector_id: Option<i16>,
    pub execution_type_id: i16,
    pub execute_till: DateTime<Utc>,
    pub ref_position_id: Option<String>,
    pub time_in_force_id: Option<i16>,
    pub updated_at: DateTime<Utc>,
    pub account_id: i64,
    pub description: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub result_order_id: Option<String>,
    pub fill_price: Option<Decimal>,
    pub commission: Option<Decimal>,
    pub commission_asset: Option<String>,
    pub fingerprint: String,
}

impl Command {
    /// Build a command from a validated submission, as the store would
    /// right after insert.
    pub fn from_new(id: i64, new: NewCommand, status_id: i16, now: DateTime<Utc>) -> Self {
        Self {
            id,
            exchange_id: new.exchange_id,
            instrument: new.instrument,
            direction_id: new.direction_id,
            order_type_id: new.order_type_id,
            limit_price: new.limit_price,
            amount: new.amount,
            status_id,
            connector_id: None,
            execution_type_id: new.execution_type_id,
            execute_till: new.execute_till,
            ref_position_id: new.ref_position_id,
            time_in_force_id: new.time_in_force_id,
            updated_at: now,
            account_id: new.account_id,
            description: None,
            api_key: new.api_key,
            secret_key: new.secret_key,
            result_order_id: None,
            fill_price: None,
            commission: None,
            commission_asset: None,
            fingerprint: new.fingerprint,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.execute_till <= now
    }
}

/// Validated submission, ready to insert with status Created
#[derive(Clone, PartialEq)]
pub struct NewCommand {
    pub exchange_id: i16,
    pub instrument: String,
    pub direction_id: i16,
    pub order_type_id: i16,
    pub limit_price: Option<Decimal>,
    pub amount: Decimal,
    pub execution_type_id: i16,
    pub execute_till: DateTime<Utc>,
    pub ref_position_id: Option<String>,
    pub time_in_force_id: Option<i16>,
    pub account_id: i64,
    pub api_key: String,
    pub secret_key: String,
    pub fingerprint: String,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("exchange_id", &self.exchange_id)
            .field("instrument", &self.instrument)
            .field("direction_id", &self.direction_id)
            .field("order_type_id", &self.order_type_id)
            .field("limit_price", &self.limit_price)
            .field("amount", &self.amount)
            .field("status_id", &self.status_id)
            .field("connector_id", &self.connector_id)
            .field("execution_type_id", &self.execution_type_id)
            .field("execute_till", &self.execute_till)
            .field("ref_position_id", &self.ref_position_id)
            .field("time_in_force_id", &self.time_in_force_id)
            .field("updated_at", &self.updated_at)
            .field("account_id", &self.account_id)
            .field("description", &self.description)
            .field("result_order_id", &self.result_order_id)
            .field("fill_price", &self.fill_price)
            .field("commission", &self.commission)
            .field("commission_asset", &self.commission_asset)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for NewCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewCommand")
            .field("exchange_id", &self.exchange_id)
            .field("instrument", &self.instrument)
            .field("order_type_id", &self.order_type_id)
            .field("amount", &self.amount)
            .field("execute_till", &self.execute_till)
            .field("account_id", &self.account_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Exchange-facing snapshot of a command with every dictionary id resolved
#[derive(Clone, PartialEq)]
pub struct RawCommand {
    pub command_id: i64,
    pub exchange: String,
    pub instrument: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub amount: Decimal,
    pub execution_type: String,
    pub execute_till: DateTime<Utc>,
    pub api_key: String,
    pub secret_key: String,
    pub fingerprint: String,
}

impl RawCommand {
    /// Resolve a persisted command through the dictionaries. Any miss means
    /// the store and the loaded vocabulary disagree, which is fatal.
    pub fn resolve(command: &Command, dictionaries: &Dictionaries) -> Result<Self> {
        let exchange = dictionaries
            .exchanges()
            .require_name(command.exchange_id)?
            .to_string();
        let side: OrderSide = dictionaries
            .directions()
            .require_name(command.direction_id)?
            .parse()?;
        let order_type: OrderType = dictionaries
            .order_types()
            .require_name(command.order_type_id)?
            .parse()?;
        let execution_type = dictionaries
            .execution_types()
            .require_name(command.execution_type_id)?
            .to_string();

        match (order_type, command.limit_price) {
            (OrderType::Limit, None) => {
                return Err(RelayError::protocol(format!(
                    "command {} is LIMIT without a limit price",
                    command.id
                )))
            }
            (OrderType::Market | OrderType::Info, Some(_)) => {
                return Err(RelayError::protocol(format!(
                    "command {} is {} with a limit price",
                    command.id, order_type
                )))
            }
            _ => {}
        }

        let time_in_force = match (order_type, command.time_in_force_id) {
            (OrderType::Limit, Some(id)) => {
                Some(dictionaries.time_in_force().require_name(id)?.parse()?)
            }
            (OrderType::Limit, None) => Some(TimeInForce::GTC),
            _ => None,
        };

        Ok(Self {
            command_id: command.id,
            exchange,
            instrument: command.instrument.clone(),
            side,
            order_type,
            limit_price: command.limit_price,
            time_in_force,
            amount: command.amount,
            execution_type,
            execute_till: command.execute_till,
            api_key: command.api_key.clone(),
            secret_key: command.secret_key.clone(),
            fingerprint: command.fingerprint.clone(),
        })
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.execute_till <= now
    }
}

impl std::fmt::Debug for RawCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCommand")
            .field("command_id", &self.command_id)
            .field("exchange", &self.exchange)
            .field("instrument", &self.instrument)
            .field("side", &self.side)
            .field("order_type", &self.order_type)
            .field("limit_price", &self.limit_price)
            .field("time_in_force", &self.time_in_force)
            .field("amount", &self.amount)
            .field("execution_type", &self.execution_type)
            .field("execute_till", &self.execute_till)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use rust_decimal_macros::dec;

    pub fn market_buy(id: i64, execute_till: DateTime<Utc>) -> Command {
        Command {
            id,
            exchange_id: 1,
            instrument: "BTCUSDT".into(),
            direction_id: 1,
            order_type_id: 1,
            limit_price: None,
            amount: dec!(0.5),
            status_id: 1,
            connector_id: None,
            execution_type_id: 1,
            execute_till,
            ref_position_id: None,
            time_in_force_id: None,
            updated_at: Utc::now(),
            account_id: 7,
            description: None,
            api_key: "key".into(),
            secret_key: "secret".into(),
            result_order_id: None,
            fill_price: None,
            commission: None,
            commission_asset: None,
            fingerprint: format!("fp-{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::market_buy;
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn resolves_market_command() {
        let dictionaries = Dictionaries::standard();
        let command = market_buy(11, Utc::now() + Duration::seconds(30));

        let raw = RawCommand::resolve(&command, &dictionaries).expect("market command resolves");
        assert_eq!(raw.exchange, "BINANCE");
        assert_eq!(raw.side, OrderSide::Buy);
        assert_eq!(raw.order_type, OrderType::Market);
        assert_eq!(raw.time_in_force, None);
        assert_eq!(raw.execution_type, "OPEN");
        assert_eq!(raw.fingerprint, "fp-11");
    }

    #[test]
    fn limit_defaults_to_gtc() {
        let dictionaries = Dictionaries::standard();
        let mut command = market_buy(12, Utc::now() + Duration::seconds(30));
        command.order_type_id = 2;
        command.limit_price = Some(dec!(25000));

        let raw = RawCommand::resolve(&command, &dictionaries).expect("limit command resolves");
        assert_eq!(raw.order_type, OrderType::Limit);
        assert_eq!(raw.time_in_force, Some(TimeInForce::GTC));

        command.time_in_force_id = Some(3);
        let raw = RawCommand::resolve(&command, &dictionaries).expect("IOC resolves");
        assert_eq!(raw.time_in_force, Some(TimeInForce::IOC));
    }

    #[test]
    fn limit_without_price_is_a_protocol_violation() {
        let dictionaries = Dictionaries::standard();
        let mut command = market_buy(13, Utc::now());
        command.order_type_id = 2;

        let err = RawCommand::resolve(&command, &dictionaries).unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[test]
    fn unknown_dictionary_id_is_fatal() {
        let dictionaries = Dictionaries::standard();
        let mut command = market_buy(14, Utc::now());
        command.direction_id = 9;

        let err = RawCommand::resolve(&command, &dictionaries).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn debug_output_hides_credentials() {
        let dictionaries = Dictionaries::standard();
        let command = market_buy(15, Utc::now());
        let raw = RawCommand::resolve(&command, &dictionaries).expect("resolves");

        let rendered = format!("{:?}", raw);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("BTCUSDT"));
    }

    #[test]
    fn command_debug_output_hides_credentials() {
        let mut command = market_buy(17, Utc::now());
        command.api_key = "api-key-value".into();
        command.secret_key = "secret-key-value".into();

        let rendered = format!("{:?}", command);
        assert!(!rendered.contains("api-key-value"));
        assert!(!rendered.contains("secret-key-value"));
        assert!(rendered.contains("fp-17"));

        let raw = RawCommand::resolve(&command, &Dictionaries::standard()).expect("resolves");
        let request =
            crate::protocol::ExecRequest::for_command(1, crate::protocol::ExecKind::Execute, raw, command);
        let rendered = format!("{:?}", request);
        assert!(!rendered.contains("secret-key-value"));
    }

    #[test]
    fn credentials_are_not_serialized() {
        let command = market_buy(16, Utc::now());
        let json = serde_json::to_value(&command).expect("serializes");
        assert!(json.get("api_key").is_none());
        assert!(json.get("secret_key").is_none());
        assert_eq!(json["fingerprint"], "fp-16");
    }
}

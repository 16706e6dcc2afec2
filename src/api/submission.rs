//! Validation of submitted commands

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::dictionary::{ORDER_TYPE_LIMIT, TIME_IN_FORCE_GTC};
use crate::domain::{Dictionaries, Dictionary, NewCommand};
use crate::error::{RelayError, Result};

const MAX_FINGERPRINT_LEN: usize = 36;

/// A JSON value clients may send either as a string or as a number
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl Scalar {
    fn text(&self) -> String {
        match self {
            Scalar::Text(s) => s.trim().to_string(),
            Scalar::Number(n) => n.to_string(),
        }
    }
}

/// Body of `PUT /execution/v1/command`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmissionRequest {
    pub exchange: Option<String>,
    pub instrument: Option<String>,
    pub direction: Option<String>,
    pub order_type: Option<String>,
    pub limit_price: Option<Scalar>,
    pub amount: Option<Scalar>,
    pub execution_type: Option<String>,
    pub time_in_force: Option<String>,
    pub ref_position_id: Option<String>,
    pub account_id: Option<Scalar>,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub fingerprint: Option<String>,
}

fn required<'a>(field: &str, value: &'a Option<String>, errors: &mut Vec<String>) -> Option<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Some(v),
        _ => {
            errors.push(format!("{} is required", field));
            None
        }
    }
}

fn lookup(
    field: &str,
    dictionary: &Dictionary,
    value: Option<&str>,
    errors: &mut Vec<String>,
) -> Option<i16> {
    let value = value?;
    let id = dictionary.id_of(value);
    if id.is_none() {
        errors.push(format!("{} '{}' is unknown", field, value));
    }
    id
}

fn positive_decimal(field: &str, value: &Scalar, errors: &mut Vec<String>) -> Option<Decimal> {
    match Decimal::from_str(&value.text()) {
        Ok(d) if d > Decimal::ZERO => Some(d),
        Ok(_) => {
            errors.push(format!("{} must be positive", field));
            None
        }
        Err(_) => {
            errors.push(format!("{} '{}' is not a number", field, value.text()));
            None
        }
    }
}

fn valid_fingerprint(fingerprint: &str) -> bool {
    !fingerprint.is_empty()
        && fingerprint.len() <= MAX_FINGERPRINT_LEN
        && fingerprint
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '-'))
}

/// Explicit fingerprint if given, otherwise a fresh UUID in simple form.
pub fn generate_fingerprint(explicit: Option<&str>) -> String {
    match explicit.map(str::trim).filter(|f| !f.is_empty()) {
        Some(fingerprint) => fingerprint.to_string(),
        None => Uuid::new_v4().simple().to_string(),
    }
}

impl SubmissionRequest {
    /// Check the submission against the dictionaries and build the command
    /// to insert. All problems are reported together.
    pub fn validate(
        &self,
        dictionaries: &Dictionaries,
        now: DateTime<Utc>,
        time_for_execution: Duration,
    ) -> Result<NewCommand> {
        let mut errors = Vec::new();

        let exchange = required("exchange", &self.exchange, &mut errors);
        let exchange_id = lookup("exchange", dictionaries.exchanges(), exchange, &mut errors);

        let instrument = required("instrument", &self.instrument, &mut errors);
        if let Some(instrument) = instrument {
            if instrument.len() <= 1 {
                errors.push(format!("instrument '{}' is too short", instrument));
            }
        }

        let direction = required("direction", &self.direction, &mut errors);
        let direction_id = lookup("direction", dictionaries.directions(), direction, &mut errors);

        let order_type = required("order_type", &self.order_type, &mut errors);
        let order_type_id =
            lookup("order_type", dictionaries.order_types(), order_type, &mut errors);
        let is_limit = order_type.is_some_and(|t| t.eq_ignore_ascii_case(ORDER_TYPE_LIMIT));

        let execution_type = required("execution_type", &self.execution_type, &mut errors);
        let execution_type_id = lookup(
            "execution_type",
            dictionaries.execution_types(),
            execution_type,
            &mut errors,
        );

        let time_in_force_id = if is_limit {
            match self.time_in_force.as_deref().map(str::trim) {
                Some(tif) if !tif.is_empty() => lookup(
                    "time_in_force",
                    dictionaries.time_in_force(),
                    Some(tif),
                    &mut errors,
                ),
                _ => dictionaries.time_in_force().id_of(TIME_IN_FORCE_GTC),
            }
        } else {
            None
        };

        let amount = match &self.amount {
            Some(amount) => positive_decimal("amount", amount, &mut errors),
            None => {
                errors.push("amount is required".to_string());
                None
            }
        };

        let limit_price = if is_limit {
            match &self.limit_price {
                Some(price) => positive_decimal("limit_price", price, &mut errors),
                None => {
                    errors.push("limit_price is required for LIMIT orders".to_string());
                    None
                }
            }
        } else {
            None
        };

        let account_id = match &self.account_id {
            Some(account) => match account.text().parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    errors.push(format!("account_id '{}' is not numeric", account.text()));
                    None
                }
            },
            None => {
                errors.push("account_id is required".to_string());
                None
            }
        };

        let api_key = required("api_key", &self.api_key, &mut errors);
        let secret_key = required("secret_key", &self.secret_key, &mut errors);

        if let Some(fingerprint) = self.fingerprint.as_deref().map(str::trim) {
            if !fingerprint.is_empty() && !valid_fingerprint(fingerprint) {
                errors.push(format!(
                    "fingerprint must be at most {} characters of [A-Za-z0-9._:/-]",
                    MAX_FINGERPRINT_LEN
                ));
            }
        }

        let execute_till = chrono::Duration::from_std(time_for_execution)
            .map(|ttl| now + ttl)
            .map_err(|e| RelayError::InvalidConfig(format!("time_for_execution: {}", e)))?;

        match (
            exchange_id,
            instrument,
            direction_id,
            order_type_id,
            execution_type_id,
            amount,
            account_id,
            api_key,
            secret_key,
        ) {
            (
                Some(exchange_id),
                Some(instrument),
                Some(direction_id),
                Some(order_type_id),
                Some(execution_type_id),
                Some(amount),
                Some(account_id),
                Some(api_key),
                Some(secret_key),
            ) if errors.is_empty() => Ok(NewCommand {
                exchange_id,
                instrument: instrument.to_ascii_uppercase(),
                direction_id,
                order_type_id,
                limit_price,
                amount,
                execution_type_id,
                execute_till,
                ref_position_id: self
                    .ref_position_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string),
                time_in_force_id,
                account_id,
                api_key: api_key.to_string(),
                secret_key: secret_key.to_string(),
                fingerprint: generate_fingerprint(self.fingerprint.as_deref()),
            }),
            _ => Err(RelayError::Validation(errors.join("; "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit_request() -> SubmissionRequest {
        serde_json::from_str(
            r#"{
                "exchange": "binance",
                "instrument": "BTCUSDT",
                "direction": "buy",
                "order_type": "LIMIT",
                "limit_price": "25000.5",
                "amount": 2,
                "execution_type": "OPEN",
                "ref_position_id": "12345",
                "account_id": "43542352",
                "api_key": "key",
                "secret_key": "secret"
            }"#,
        )
        .expect("request parses")
    }

    fn validate(request: &SubmissionRequest) -> Result<NewCommand> {
        request.validate(
            &Dictionaries::standard(),
            Utc::now(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn valid_limit_order_is_accepted() {
        let now = Utc::now();
        let command = limit_request()
            .validate(&Dictionaries::standard(), now, Duration::from_secs(60))
            .expect("valid request");

        assert_eq!(command.exchange_id, 1);
        assert_eq!(command.direction_id, 1);
        assert_eq!(command.order_type_id, 2);
        assert_eq!(command.limit_price, Some(dec!(25000.5)));
        assert_eq!(command.amount, dec!(2));
        assert_eq!(command.time_in_force_id, Some(1));
        assert_eq!(command.account_id, 43542352);
        assert_eq!(command.execute_till, now + chrono::Duration::seconds(60));
        assert_eq!(command.fingerprint.len(), 32);
    }

    #[test]
    fn limit_price_is_ignored_for_market_orders() {
        let mut request = limit_request();
        request.order_type = Some("market".into());
        let command = validate(&request).expect("valid request");
        assert_eq!(command.limit_price, None);
        assert_eq!(command.time_in_force_id, None);
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let mut request = limit_request();
        request.direction = Some("HOLD".into());
        request.exchange = Some("KRAKEN".into());

        let err = validate(&request).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, RelayError::Validation(_)));
        assert!(message.contains("HOLD"));
        assert!(message.contains("KRAKEN"));
    }

    #[test]
    fn limit_order_needs_positive_price() {
        let mut request = limit_request();
        request.limit_price = None;
        assert!(validate(&request).is_err());

        request.limit_price = Some(Scalar::Text("-1".into()));
        let err = validate(&request).unwrap_err();
        assert!(err.to_string().contains("limit_price must be positive"));
    }

    #[test]
    fn amount_and_account_must_be_numeric() {
        let mut request = limit_request();
        request.amount = Some(Scalar::Text("0".into()));
        request.account_id = Some(Scalar::Text("abc".into()));

        let message = validate(&request).unwrap_err().to_string();
        assert!(message.contains("amount must be positive"));
        assert!(message.contains("account_id 'abc' is not numeric"));
    }

    #[test]
    fn credentials_and_instrument_are_required() {
        let mut request = limit_request();
        request.api_key = Some("  ".into());
        request.instrument = Some("B".into());

        let message = validate(&request).unwrap_err().to_string();
        assert!(message.contains("api_key is required"));
        assert!(message.contains("too short"));
    }

    #[test]
    fn explicit_fingerprint_is_kept_and_checked() {
        let mut request = limit_request();
        request.fingerprint = Some("strategy-7:order/42".into());
        assert_eq!(validate(&request).unwrap().fingerprint, "strategy-7:order/42");

        request.fingerprint = Some("has space".into());
        assert!(validate(&request).is_err());

        request.fingerprint = Some("x".repeat(37));
        assert!(validate(&request).is_err());
    }

    #[test]
    fn explicit_time_in_force_is_resolved() {
        let mut request = limit_request();
        request.time_in_force = Some("ioc".into());
        assert_eq!(validate(&request).unwrap().time_in_force_id, Some(3));

        request.time_in_force = Some("DAY".into());
        assert!(validate(&request).is_err());
    }
}

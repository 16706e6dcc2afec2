//! Enumeration dictionaries
//!
//! Six immutable id <-> name maps loaded once from the store at startup.
//! Every other component receives them by `Arc` and never mutates them.

use std::collections::HashMap;

use crate::error::{RelayError, Result};

pub const EXCHANGE_BINANCE: &str = "BINANCE";

pub const DIRECTION_BUY: &str = "BUY";
pub const DIRECTION_SELL: &str = "SELL";

pub const ORDER_TYPE_MARKET: &str = "MARKET";
pub const ORDER_TYPE_LIMIT: &str = "LIMIT";
pub const ORDER_TYPE_INFO: &str = "INFO";

pub const TIME_IN_FORCE_GTC: &str = "GTC";
pub const TIME_IN_FORCE_FOK: &str = "FOK";
pub const TIME_IN_FORCE_IOC: &str = "IOC";

pub const EXECUTION_TYPE_OPEN: &str = "OPEN";
pub const EXECUTION_TYPE_CLOSE: &str = "CLOSE";

pub const STATUS_CREATED: &str = "CREATED";
pub const STATUS_EXECUTING: &str = "EXECUTING";
pub const STATUS_FILLED: &str = "FILLED";
pub const STATUS_REJECTED: &str = "REJECTED";
pub const STATUS_TIMED_OUT: &str = "TIMED_OUT";
pub const STATUS_ERROR: &str = "ERROR";

/// Bidirectional id <-> name lookup. Names are stored upper-case.
#[derive(Debug, Clone)]
pub struct Dictionary {
    kind: &'static str,
    by_id: HashMap<i16, String>,
    by_name: HashMap<String, i16>,
}

impl Dictionary {
    pub fn new<S, I>(kind: &'static str, entries: I) -> Self
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (i16, S)>,
    {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();

        for (id, name) in entries {
            let name = name.as_ref().trim().to_ascii_uppercase();
            by_name.insert(name.clone(), id);
            by_id.insert(id, name);
        }

        Self {
            kind,
            by_id,
            by_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Case-insensitive name lookup
    pub fn id_of(&self, name: &str) -> Option<i16> {
        self.by_name
            .get(&name.trim().to_ascii_uppercase())
            .copied()
    }

    pub fn name_of(&self, id: i16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// Lookup for names the process cannot run without; a miss is a
    /// configuration error.
    pub fn require_id(&self, name: &str) -> Result<i16> {
        self.id_of(name).ok_or_else(|| {
            RelayError::Dictionary(format!("{} dictionary has no entry '{}'", self.kind, name))
        })
    }

    pub fn require_name(&self, id: i16) -> Result<&str> {
        self.name_of(id).ok_or_else(|| {
            RelayError::Dictionary(format!("{} dictionary has no id {}", self.kind, id))
        })
    }
}

/// The six dictionaries the relay works with
#[derive(Debug, Clone)]
pub struct Dictionaries {
    exchanges: Dictionary,
    directions: Dictionary,
    order_types: Dictionary,
    time_in_force: Dictionary,
    execution_types: Dictionary,
    execution_statuses: Dictionary,
}

impl Dictionaries {
    /// Build the dictionary set. An empty dictionary means the store was not
    /// seeded and is rejected as a configuration error.
    pub fn new(
        exchanges: Dictionary,
        directions: Dictionary,
        order_types: Dictionary,
        time_in_force: Dictionary,
        execution_types: Dictionary,
        execution_statuses: Dictionary,
    ) -> Result<Self> {
        for dictionary in [
            &exchanges,
            &directions,
            &order_types,
            &time_in_force,
            &execution_types,
            &execution_statuses,
        ] {
            if dictionary.is_empty() {
                return Err(RelayError::Dictionary(format!(
                    "{} dictionary is empty",
                    dictionary.kind()
                )));
            }
        }

        Ok(Self {
            exchanges,
            directions,
            order_types,
            time_in_force,
            execution_types,
            execution_statuses,
        })
    }

    /// The vocabulary seeded by the initial migration.
    pub fn standard() -> Self {
        Self {
            exchanges: Dictionary::new("exchange", [(1, EXCHANGE_BINANCE)]),
            directions: Dictionary::new("direction", [(1, DIRECTION_BUY), (2, DIRECTION_SELL)]),
            order_types: Dictionary::new(
                "order_type",
                [(1, ORDER_TYPE_MARKET), (2, ORDER_TYPE_LIMIT), (3, ORDER_TYPE_INFO)],
            ),
            time_in_force: Dictionary::new(
                "time_in_force",
                [(1, TIME_IN_FORCE_GTC), (2, TIME_IN_FORCE_FOK), (3, TIME_IN_FORCE_IOC)],
            ),
            execution_types: Dictionary::new(
                "execution_type",
                [(1, EXECUTION_TYPE_OPEN), (2, EXECUTION_TYPE_CLOSE)],
            ),
            execution_statuses: Dictionary::new(
                "execution_status",
                [
                    (1, STATUS_CREATED),
                    (2, STATUS_EXECUTING),
                    (3, STATUS_FILLED),
                    (4, STATUS_REJECTED),
                    (5, STATUS_TIMED_OUT),
                    (6, STATUS_ERROR),
                ],
            ),
        }
    }

    pub fn exchanges(&self) -> &Dictionary {
        &self.exchanges
    }

    pub fn directions(&self) -> &Dictionary {
        &self.directions
    }

    pub fn order_types(&self) -> &Dictionary {
        &self.order_types
    }

    pub fn time_in_force(&self) -> &Dictionary {
        &self.time_in_force
    }

    pub fn execution_types(&self) -> &Dictionary {
        &self.execution_types
    }

    pub fn execution_statuses(&self) -> &Dictionary {
        &self.execution_statuses
    }
}

/// Execution status ids resolved once from the dictionaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusIds {
    pub created: i16,
    pub executing: i16,
    pub filled: i16,
    pub rejected: i16,
    pub timed_out: i16,
    pub error: i16,
}

impl StatusIds {
    pub fn resolve(dictionaries: &Dictionaries) -> Result<Self> {
        let statuses = dictionaries.execution_statuses();
        Ok(Self {
            created: statuses.require_id(STATUS_CREATED)?,
            executing: statuses.require_id(STATUS_EXECUTING)?,
            filled: statuses.require_id(STATUS_FILLED)?,
            rejected: statuses.require_id(STATUS_REJECTED)?,
            timed_out: statuses.require_id(STATUS_TIMED_OUT)?,
            error: statuses.require_id(STATUS_ERROR)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_bidirectional_and_case_insensitive() {
        let directions = Dictionary::new("direction", [(1, "buy"), (2, "Sell")]);

        assert_eq!(directions.id_of("BUY"), Some(1));
        assert_eq!(directions.id_of(" sell "), Some(2));
        assert_eq!(directions.name_of(2), Some("SELL"));
        assert_eq!(directions.id_of("HOLD"), None);
        assert_eq!(directions.name_of(7), None);
    }

    #[test]
    fn required_lookup_miss_is_fatal() {
        let exchanges = Dictionary::new("exchange", [(1, "BINANCE")]);
        let err = exchanges.require_id("KRAKEN").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("KRAKEN"));
    }

    #[test]
    fn empty_dictionary_is_rejected() {
        let empty: [(i16, &str); 0] = [];
        let result = Dictionaries::new(
            Dictionary::new("exchange", [(1, "BINANCE")]),
            Dictionary::new("direction", [(1, "BUY")]),
            Dictionary::new("order_type", [(1, "MARKET")]),
            Dictionary::new("time_in_force", [(1, "GTC")]),
            Dictionary::new("execution_type", empty),
            Dictionary::new("execution_status", [(1, "CREATED")]),
        );

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("execution_type"));
    }

    #[test]
    fn standard_vocabulary_resolves_every_status() {
        let ids = StatusIds::resolve(&Dictionaries::standard()).unwrap();
        assert_eq!(ids.created, 1);
        assert_eq!(ids.executing, 2);
        assert_eq!(ids.error, 6);
    }
}

//! Feed wire messages.
//!
//! Inbound frames are JSON objects discriminated by `type` and are parsed
//! once, at the transport boundary, into [`FeedMessage`].

use crate::error::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Latest price per symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable(BTreeMap<String, Decimal>);

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Price for `symbol`, if known.
    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        self.0.get(symbol).copied()
    }

    /// Set one symbol's price, returning the previous value.
    pub fn insert(&mut self, symbol: impl Into<String>, price: Decimal) -> Option<Decimal> {
        self.0.insert(symbol.into(), price)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in symbol order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.0.iter().map(|(symbol, price)| (symbol.as_str(), *price))
    }
}

impl<S: Into<String>> FromIterator<(S, Decimal)> for PriceTable {
    fn from_iter<I: IntoIterator<Item = (S, Decimal)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(symbol, price)| (symbol.into(), price))
                .collect(),
        )
    }
}

/// A single-symbol price change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: Decimal,
}

/// An out-of-band alert. The body is kept exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Alert {
    /// A field of the alert body.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// The `message` field, when it is a string.
    pub fn message(&self) -> Option<&str> {
        self.get("message").and_then(Value::as_str)
    }
}

/// Messages pushed by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Full snapshot; replaces the whole table.
    Prices { prices: PriceTable },
    /// Patch for one symbol.
    PriceUpdate(PriceUpdate),
    /// Alert to forward to consumers.
    Alert(Alert),
}

impl FeedMessage {
    /// Parse one text frame.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages the client sends to the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
}

impl ControlMessage {
    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_decode_snapshot() {
        let msg =
            FeedMessage::decode(r#"{"type":"prices","prices":{"BTC":50000,"ETH":3000.5}}"#)
                .unwrap();
        let expected: PriceTable = [("BTC", dec!(50000)), ("ETH", dec!(3000.5))]
            .into_iter()
            .collect();
        assert_eq!(msg, FeedMessage::Prices { prices: expected });
    }

    #[test]
    fn test_decode_update() {
        let msg =
            FeedMessage::decode(r#"{"type":"price_update","symbol":"BTC","price":50500}"#)
                .unwrap();
        assert_eq!(
            msg,
            FeedMessage::PriceUpdate(PriceUpdate {
                symbol: "BTC".to_string(),
                price: dec!(50500),
            })
        );
    }

    #[test]
    fn test_decode_alert_keeps_body() {
        let msg = FeedMessage::decode(
            r#"{"type":"alert","message":"BTC crossed 50k","level":"warning","meta":{"id":7}}"#,
        )
        .unwrap();
        let FeedMessage::Alert(alert) = msg else {
            panic!("expected alert");
        };
        assert_eq!(alert.message(), Some("BTC crossed 50k"));
        assert_eq!(alert.get("meta"), Some(&json!({"id": 7})));
        assert!(alert.get("type").is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_and_malformed() {
        assert!(FeedMessage::decode(r#"{"type":"heartbeat"}"#).is_err());
        assert!(FeedMessage::decode(r#"{"prices":{}}"#).is_err());
        assert!(FeedMessage::decode(r#"{"type":"price_update","symbol":"BTC"}"#).is_err());
        assert!(FeedMessage::decode("not json").is_err());
    }

    #[test]
    fn test_control_encoding() {
        let sub = ControlMessage::Subscribe {
            symbols: vec!["BTC".to_string(), "ETH".to_string()],
        };
        let value: Value = serde_json::from_str(&sub.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "subscribe", "symbols": ["BTC", "ETH"]}));

        let unsub = ControlMessage::Unsubscribe {
            symbols: vec!["ETH".to_string()],
        };
        let value: Value = serde_json::from_str(&unsub.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "unsubscribe", "symbols": ["ETH"]}));
    }

    #[test]
    fn test_price_table_patch() {
        let mut table: PriceTable = [("BTC", dec!(1)), ("ETH", dec!(2))].into_iter().collect();
        assert_eq!(table.insert("BTC", dec!(3)), Some(dec!(1)));
        assert_eq!(table.insert("SOL", dec!(4)), None);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get("BTC"), Some(dec!(3)));
        assert_eq!(
            table.iter().map(|(s, _)| s).collect::<Vec<_>>(),
            vec!["BTC", "ETH", "SOL"]
        );
    }
}

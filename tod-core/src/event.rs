//! Inbound realtime events

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event received on a channel
///
/// Transient: produced by the transport, handed to the router and dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Logical channel name (the channel key, without the `private-` prefix)
    pub channel_name: String,
    /// Event name with any backend namespace stripped
    pub event_name: String,
    /// Payload passed through to handlers unmodified
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(channel_name: impl Into<String>, event_name: &str, payload: Value) -> Self {
        Self {
            channel_name: channel_name.into(),
            event_name: normalize_event_name(event_name).to_string(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// The domain event this is, if it is one of the known ones
    pub fn market_event(&self) -> Option<MarketEvent> {
        self.event_name.parse().ok()
    }
}

/// Strip a backend namespace such as `App\Events\` from an event name
pub fn normalize_event_name(raw: &str) -> &str {
    raw.rsplit('\\').next().unwrap_or(raw)
}

/// Event `data` may arrive as a JSON-encoded string; decode it when it is one
pub fn decode_payload(data: Value) -> Value {
    match data {
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(decoded) => decoded,
            Err(_) => Value::String(raw),
        },
        other => other,
    }
}

/// Domain events published on the company channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketEvent {
    AssetPriceChangeEventCompany,
    OrderUpdated,
    OrderFilled,
    OrderCreated,
}

impl MarketEvent {
    pub const ALL: [MarketEvent; 4] = [
        MarketEvent::AssetPriceChangeEventCompany,
        MarketEvent::OrderUpdated,
        MarketEvent::OrderFilled,
        MarketEvent::OrderCreated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketEvent::AssetPriceChangeEventCompany => "AssetPriceChangeEventCompany",
            MarketEvent::OrderUpdated => "OrderUpdated",
            MarketEvent::OrderFilled => "OrderFilled",
            MarketEvent::OrderCreated => "OrderCreated",
        }
    }
}

impl fmt::Display for MarketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = normalize_event_name(s);
        MarketEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == name)
            .ok_or_else(|| format!("Unknown event: {}", s))
    }
}

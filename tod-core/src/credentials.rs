//! Connection credentials issued by the backend
//!
//! `CompanyDetails` mirrors the raw `GET /api/company` payload, where every
//! field may be missing. `Credentials` is the validated form that the
//! realtime client is allowed to connect with.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::channel::private_channel_name;

/// Raw company details as returned by the backend
#[derive(Clone, Default, PartialEq, Deserialize)]
pub struct CompanyDetails {
    #[serde(default, alias = "connectionId", deserialize_with = "lenient_string")]
    pub id: Option<String>,

    #[serde(default, alias = "displayName", deserialize_with = "lenient_string")]
    pub name: Option<String>,

    #[serde(default, alias = "channelKey", deserialize_with = "lenient_string")]
    pub channel_key: Option<String>,

    #[serde(default, alias = "channelKeyExpiry", deserialize_with = "lenient_string")]
    pub channel_key_expiry: Option<String>,

    #[serde(default, alias = "pusherHost", deserialize_with = "lenient_string")]
    pub pusher_host: Option<String>,

    #[serde(default, alias = "pusherKey", deserialize_with = "lenient_string")]
    pub pusher_key: Option<String>,

    #[serde(default, alias = "pusherCluster", deserialize_with = "lenient_string")]
    pub pusher_cluster: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CompanyEnvelope {
    Wrapped { data: CompanyDetails },
    Bare(CompanyDetails),
}

impl CompanyDetails {
    /// Parse a response body, with or without the `{"data": ...}` envelope
    pub fn from_response(body: &str) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_str::<CompanyEnvelope>(body)? {
            CompanyEnvelope::Wrapped { data } => data,
            CompanyEnvelope::Bare(details) => details,
        })
    }
}

impl fmt::Debug for CompanyDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompanyDetails")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("channel_key", &self.channel_key)
            .field("channel_key_expiry", &self.channel_key_expiry)
            .field("pusher_host", &self.pusher_host)
            .field("pusher_key", &self.pusher_key.as_ref().map(|_| "[REDACTED]"))
            .field("pusher_cluster", &self.pusher_cluster)
            .finish()
    }
}

/// Accepts strings, numbers and booleans; anything else becomes `None`
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Credentials were missing one or more required fields
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("incomplete credentials, missing: {}", .0.join(", "))]
pub struct MissingFields(pub Vec<&'static str>);

/// Validated connection credentials
///
/// Never mutated in place: a refresh replaces the whole value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub connection_id: String,
    pub display_name: String,
    /// Logical channel name; the wire name is `private-{channel_key}`
    pub channel_key: String,
    /// Raw expiry as sent by the backend, parsed on demand
    pub channel_key_expiry: Option<String>,
    pub transport_host: String,
    pub transport_key: String,
    pub transport_cluster: String,
}

impl Credentials {
    /// Parsed channel key expiry, `None` when missing or unparsable
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.channel_key_expiry.as_deref().and_then(parse_expiry)
    }

    /// A missing or unparsable expiry counts as already expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expiry) => now >= expiry,
            None => true,
        }
    }

    /// Wire name of this connection's private channel
    pub fn private_channel(&self) -> String {
        private_channel_name(&self.channel_key)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("connection_id", &self.connection_id)
            .field("display_name", &self.display_name)
            .field("channel_key", &self.channel_key)
            .field("channel_key_expiry", &self.channel_key_expiry)
            .field("transport_host", &self.transport_host)
            .field("transport_key", &"[REDACTED]")
            .field("transport_cluster", &self.transport_cluster)
            .finish()
    }
}

impl TryFrom<CompanyDetails> for Credentials {
    type Error = MissingFields;

    fn try_from(details: CompanyDetails) -> Result<Self, Self::Error> {
        let mut missing = Vec::new();
        let mut require = |value: Option<String>, field: &'static str| {
            match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
                Some(v) => v,
                None => {
                    missing.push(field);
                    String::new()
                }
            }
        };

        let connection_id = require(details.id, "id");
        let display_name = require(details.name, "name");
        let channel_key = require(details.channel_key, "channel_key");
        let transport_host = require(details.pusher_host, "pusher_host");
        let transport_key = require(details.pusher_key, "pusher_key");
        let transport_cluster = require(details.pusher_cluster, "pusher_cluster");

        if !missing.is_empty() {
            return Err(MissingFields(missing));
        }

        Ok(Self {
            connection_id,
            display_name,
            channel_key,
            channel_key_expiry: details.channel_key_expiry,
            transport_host,
            transport_key,
            transport_cluster,
        })
    }
}

/// Parse a channel key expiry
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) and unix timestamps in
/// seconds or milliseconds.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    let ts: i64 = raw.parse().ok()?;
    if ts.unsigned_abs() >= 1_000_000_000_000 {
        DateTime::from_timestamp_millis(ts)
    } else {
        DateTime::from_timestamp(ts, 0)
    }
}

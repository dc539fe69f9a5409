//! Core types for the TOD Markets realtime client
//!
//! This crate defines the shared data structures used across the client,
//! including connection credentials, channel authorization tokens, the
//! connection state machine's states and inbound event representations.

pub mod channel;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod event;

pub use channel::{private_channel_name, AuthToken, AuthorizationStatus, PRIVATE_CHANNEL_PREFIX};
pub use connection::ConnectionState;
pub use credentials::{parse_expiry, CompanyDetails, Credentials, MissingFields};
pub use error::{TodError, TodResult};
pub use event::{decode_payload, normalize_event_name, InboundEvent, MarketEvent};

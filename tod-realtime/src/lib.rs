//! Authenticated realtime channel client for TOD Markets
//!
//! Turns a REST credential fetch into a live, authorized event stream:
//! credentials are cached and checked for freshness, the transport is
//! connected, the private channel is authorized through the backend, and
//! inbound events are routed to the handlers bound in the registry.
//!
//! ```text
//! CredentialSource -> CredentialCache -> ConnectionManager
//!     -> ChannelAuthorizer -> SubscriptionRegistry -> EventRouter
//! ```

pub mod authorization;
pub mod backoff;
pub mod config;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod registry;
pub mod router;
pub mod transport;

pub use authorization::{BroadcastingAuthorizer, ChannelAuthorizer};
pub use backoff::Backoff;
pub use config::RealtimeConfig;
pub use credentials::{CredentialCache, CredentialSource};
pub use error::{HandlerError, RealtimeError};
pub use manager::ConnectionManager;
pub use registry::{Handler, SubscriptionHandle, SubscriptionRegistry};
pub use router::{EventRouter, RouterStats};
pub use transport::{
    PusherTransport, Transport, TransportEndpoint, TransportFrame, TransportSession,
};

//! Subscription registry
//!
//! Maps logical channel names to their authorization status and to the
//! handlers bound per event. Bindings may be added at any time, including
//! before the channel is authorized: the router resolves handlers at
//! delivery time, so nothing is lost when a bind races the handshake.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tod_core::{normalize_event_name, AuthorizationStatus, InboundEvent};
use tracing::{debug, info};

use crate::error::HandlerError;

/// Event handler callback
pub type Handler = Arc<dyn Fn(&InboundEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Returned by `bind`, used to remove that one binding again
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    channel: String,
    event: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

struct Binding {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Subscription {
    status: AuthorizationStatus,
    /// Event name -> handlers in binding order
    bindings: HashMap<String, Vec<Binding>>,
}

impl Subscription {
    fn binding_count(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }
}

/// Channel subscriptions and their event bindings
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    channels: RwLock<HashMap<String, Subscription>>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a handler to an event on a channel
    pub fn bind<F>(&self, channel: &str, event: &str, handler: F) -> SubscriptionHandle
    where
        F: Fn(&InboundEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = normalize_event_name(event).to_string();

        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .bindings
            .entry(event.clone())
            .or_default()
            .push(Binding {
                id,
                handler: Arc::new(handler),
            });

        debug!("[TOD Registry] Bound {} on {} (handle {})", event, channel, id);

        SubscriptionHandle {
            id,
            channel: channel.to_string(),
            event,
        }
    }

    /// Bind a handler that receives the payload decoded into `T`
    ///
    /// A payload that does not decode counts as a failure of this handler.
    pub fn bind_typed<T, F>(&self, channel: &str, event: &str, handler: F) -> SubscriptionHandle
    where
        T: DeserializeOwned,
        F: Fn(T) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.bind(channel, event, move |inbound: &InboundEvent| {
            let value = T::deserialize(&inbound.payload)?;
            handler(value)
        })
    }

    /// Remove one binding; returns whether it was still bound
    pub fn unbind(&self, handle: &SubscriptionHandle) -> bool {
        let mut channels = self.channels.write();
        let Some(subscription) = channels.get_mut(&handle.channel) else {
            return false;
        };
        let Some(handlers) = subscription.bindings.get_mut(&handle.event) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|binding| binding.id != handle.id);
        let removed = handlers.len() != before;

        if handlers.is_empty() {
            subscription.bindings.remove(&handle.event);
        }

        if removed {
            debug!(
                "[TOD Registry] Unbound {} on {} (handle {})",
                handle.event, handle.channel, handle.id
            );
        }
        removed
    }

    /// Handlers for an event on a channel, in binding order
    pub fn resolve(&self, channel: &str, event: &str) -> Vec<Handler> {
        let event = normalize_event_name(event);
        self.channels
            .read()
            .get(channel)
            .and_then(|subscription| subscription.bindings.get(event))
            .map(|handlers| handlers.iter().map(|b| Arc::clone(&b.handler)).collect())
            .unwrap_or_default()
    }

    /// Authorization status of a channel, `None` if it is unknown
    pub fn status(&self, channel: &str) -> Option<AuthorizationStatus> {
        self.channels.read().get(channel).map(|s| s.status)
    }

    pub fn is_authorized(&self, channel: &str) -> bool {
        self.status(channel) == Some(AuthorizationStatus::Authorized)
    }

    pub fn mark_pending(&self, channel: &str) {
        self.set_status(channel, AuthorizationStatus::Pending);
    }

    pub fn mark_authorized(&self, channel: &str) {
        self.set_status(channel, AuthorizationStatus::Authorized);
    }

    pub fn mark_rejected(&self, channel: &str) {
        self.set_status(channel, AuthorizationStatus::Rejected);
    }

    pub fn set_status(&self, channel: &str, status: AuthorizationStatus) {
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .status = status;
        debug!("[TOD Registry] {} is now {:?}", channel, status);
    }

    /// Connection teardown: authorized channels go back to `Pending`, bindings stay
    ///
    /// A `Rejected` channel keeps its status until the next handshake marks
    /// it pending again.
    pub fn reset_all(&self) {
        for subscription in self.channels.write().values_mut() {
            if subscription.status != AuthorizationStatus::Rejected {
                subscription.status = AuthorizationStatus::Pending;
            }
        }
    }

    /// Move a channel's bindings to a new channel key
    ///
    /// Used when a credential refresh rotates the channel key. Bindings
    /// already present under `to` are kept and come first.
    pub fn rekey(&self, from: &str, to: &str) {
        if from == to {
            return;
        }

        let mut channels = self.channels.write();
        let Some(old) = channels.remove(from) else {
            return;
        };

        let moved = old.binding_count();
        let target = channels.entry(to.to_string()).or_default();
        for (event, mut handlers) in old.bindings {
            target.bindings.entry(event).or_default().append(&mut handlers);
        }

        info!(
            "[TOD Registry] Channel key rotated, moved {} binding(s) from {} to {}",
            moved, from, to
        );
    }

    /// Destroy a channel's subscription and all of its bindings
    pub fn remove_channel(&self, channel: &str) -> bool {
        self.channels.write().remove(channel).is_some()
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn binding_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map_or(0, Subscription::binding_count)
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.channels.read();
        f.debug_struct("SubscriptionRegistry")
            .field("channels", &channels.len())
            .field(
                "bindings",
                &channels.values().map(Subscription::binding_count).sum::<usize>(),
            )
            .finish()
    }
}

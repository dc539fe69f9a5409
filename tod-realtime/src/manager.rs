//! Connection manager
//!
//! One spawned task owns the transport and runs the handshake:
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Subscribed
//!            ^                |               |
//!            +-- Reconnecting <---------------+
//! any state -> Disconnected (disconnect(), or reconnect attempts exhausted)
//! ```
//!
//! The public [`ConnectionManager`] only sends commands to that task, so
//! state transitions are serialized. Every await in the handshake is raced
//! against the command channel: a `disconnect()` drops the in-flight
//! credential fetch, authorization or socket read, and its late result is
//! never observed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tod_core::{ConnectionState, Credentials, InboundEvent, PRIVATE_CHANNEL_PREFIX};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::authorization::ChannelAuthorizer;
use crate::backoff::Backoff;
use crate::config::RealtimeConfig;
use crate::credentials::{CredentialCache, CredentialSource};
use crate::error::RealtimeError;
use crate::router::EventRouter;
use crate::transport::{Transport, TransportEndpoint, TransportFrame, TransportSession};

/// Buffered commands from the handle to the task
const COMMAND_BUFFER: usize = 32;

/// Buffered state notifications per subscriber
const STATE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    Shutdown,
}

/// Why the task stopped working on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Disconnect,
    Shutdown,
    /// Reconnect attempts exhausted or a fatal error
    GiveUp,
}

/// How a connection attempt ended
#[derive(Debug)]
enum Exit {
    Interrupted(Interrupt),
    Failed(RealtimeError),
}

/// Run `fut` unless a command interrupts it first
///
/// `Connect` is ignored: the task is already connecting.
async fn guard<F: Future>(
    commands: &mut mpsc::Receiver<Command>,
    fut: F,
) -> Result<F::Output, Interrupt> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;

            cmd = commands.recv() => match cmd {
                Some(Command::Connect) => continue,
                Some(Command::Disconnect) => return Err(Interrupt::Disconnect),
                Some(Command::Shutdown) | None => return Err(Interrupt::Shutdown),
            },
            output = &mut fut => return Ok(output),
        }
    }
}

/// `guard` for fallible steps, flattened into an attempt exit
async fn guarded<T, F>(commands: &mut mpsc::Receiver<Command>, fut: F) -> Result<T, Exit>
where
    F: Future<Output = Result<T, RealtimeError>>,
{
    match guard(commands, fut).await {
        Ok(result) => result.map_err(Exit::Failed),
        Err(interrupt) => Err(Exit::Interrupted(interrupt)),
    }
}

/// Logical channel name for a wire channel name
fn logical_channel(wire: &str) -> &str {
    wire.strip_prefix(PRIVATE_CHANNEL_PREFIX).unwrap_or(wire)
}

// ============================================================================
// Handle
// ============================================================================

/// Handle to the connection task
pub struct ConnectionManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    states: broadcast::Sender<ConnectionState>,
    sink: Arc<RwLock<Arc<EventRouter>>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Start the connection task in `Idle`; nothing connects until `connect()`
    pub fn spawn<T>(
        config: RealtimeConfig,
        cache: Arc<CredentialCache>,
        source: Arc<dyn CredentialSource>,
        authorizer: Arc<dyn ChannelAuthorizer>,
        transport: T,
        router: Arc<EventRouter>,
    ) -> Self
    where
        T: Transport + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (states, _) = broadcast::channel(STATE_BUFFER);
        let sink = Arc::new(RwLock::new(router));

        let worker = Worker {
            backoff: config.backoff(),
            config,
            cache,
            source,
            authorizer,
            transport,
            sink: Arc::clone(&sink),
            state_tx,
            states: states.clone(),
            commands: command_rx,
            channel_key: None,
        };

        let task = tokio::spawn(worker.run());

        Self {
            commands: command_tx,
            state: state_rx,
            states,
            sink,
            task: Some(task),
        }
    }

    /// Start connecting; does nothing while a connection is in progress
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.send(Command::Connect).await
    }

    /// Drop the connection and stay `Disconnected` until `connect()`
    pub async fn disconnect(&self) -> Result<(), RealtimeError> {
        self.send(Command::Disconnect).await
    }

    async fn send(&self, command: Command) -> Result<(), RealtimeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RealtimeError::Closed)
    }

    /// Replace the router inbound events are delivered to
    ///
    /// When the new router has its own registry, the current authorization
    /// statuses are carried over so a live subscription keeps delivering.
    pub fn on_event(&self, router: Arc<EventRouter>) {
        let mut sink = self.sink.write();
        let (old, new) = (sink.registry(), router.registry());
        if !Arc::ptr_eq(old, new) {
            for channel in old.channels() {
                if let Some(status) = old.status(&channel) {
                    new.set_status(&channel, status);
                }
            }
        }
        *sink = router;
    }

    /// Router currently receiving inbound events
    pub fn router(&self) -> Arc<EventRouter> {
        Arc::clone(&self.sink.read())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Every state transition from now on
    pub fn subscribe_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.states.subscribe()
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for(&self, target: ConnectionState) -> Result<(), RealtimeError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| RealtimeError::Closed)
    }

    /// Disconnect and stop the task
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("[TOD WS] Connection task failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Task
// ============================================================================

struct Worker<T> {
    config: RealtimeConfig,
    cache: Arc<CredentialCache>,
    source: Arc<dyn CredentialSource>,
    authorizer: Arc<dyn ChannelAuthorizer>,
    transport: T,
    sink: Arc<RwLock<Arc<EventRouter>>>,
    state_tx: watch::Sender<ConnectionState>,
    states: broadcast::Sender<ConnectionState>,
    commands: mpsc::Receiver<Command>,
    backoff: Backoff,
    /// Channel key of the last handshake, to follow key rotation
    channel_key: Option<String>,
}

impl<T: Transport> Worker<T> {
    async fn run(mut self) {
        loop {
            match self.commands.recv().await {
                Some(Command::Connect) => {}
                Some(Command::Disconnect) => {
                    self.transition(ConnectionState::Disconnected);
                    continue;
                }
                Some(Command::Shutdown) | None => break,
            }

            match self.maintain().await {
                Interrupt::Disconnect | Interrupt::GiveUp => self.disconnected().await,
                Interrupt::Shutdown => break,
            }
        }

        self.disconnected().await;
        debug!("[TOD WS] Connection task stopped");
    }

    /// Keep a connection up until interrupted
    async fn maintain(&mut self) -> Interrupt {
        self.backoff.reset();

        loop {
            let error = match self.attempt().await {
                Exit::Interrupted(interrupt) => return interrupt,
                Exit::Failed(error) => error,
            };

            warn!("[TOD WS] Connection attempt failed: {}", error);
            self.teardown().await;

            if !error.is_retryable() {
                error!("[TOD WS] Not retrying: {}", error);
                return Interrupt::GiveUp;
            }

            self.transition(ConnectionState::Reconnecting);

            if let Some(max) = self.config.max_reconnect_attempts {
                if self.backoff.attempt() >= max {
                    error!("[TOD WS] Giving up after {} reconnect attempts", max);
                    return Interrupt::GiveUp;
                }
            }

            let delay = self.backoff.next_delay();
            info!(
                "[TOD WS] Reconnecting in {:?} (attempt {})",
                delay,
                self.backoff.attempt()
            );

            if let Err(interrupt) = guard(&mut self.commands, tokio::time::sleep(delay)).await {
                return interrupt;
            }
        }
    }

    /// One handshake followed by streaming until the connection fails
    async fn attempt(&mut self) -> Exit {
        match self.handshake().await {
            Ok((channel_key, session)) => self.stream(&channel_key, &session).await,
            Err(exit) => exit,
        }
    }

    async fn handshake(&mut self) -> Result<(String, TransportSession), Exit> {
        self.transition(ConnectionState::Connecting);

        let credentials = self.credentials().await?;
        let channel_key = credentials.channel_key.clone();
        let channel = credentials.private_channel();
        let router = self.router();
        let registry = Arc::clone(router.registry());

        if let Some(previous) = self.channel_key.replace(channel_key.clone()) {
            if previous != channel_key {
                registry.rekey(&previous, &channel_key);
            }
        }

        let endpoint =
            TransportEndpoint::from_credentials(&credentials, self.config.use_transport_host);
        let session = guarded(&mut self.commands, self.transport.open(&endpoint)).await?;

        self.transition(ConnectionState::Authenticating);
        registry.mark_pending(&channel_key);

        let authorized = guard(
            &mut self.commands,
            self.authorizer.authorize(&channel, &session.socket_id, &credentials),
        )
        .await
        .map_err(Exit::Interrupted)?;

        let token = match authorized {
            Ok(token) => token,
            Err(e) => return Err(self.authorization_failed(&channel_key, e)),
        };

        guarded(&mut self.commands, self.transport.subscribe(&channel, &token)).await?;

        let confirmation = await_confirmation(
            &mut self.transport,
            &channel,
            &router,
            self.config.handshake_timeout,
        );
        if let Err(e) = guarded(&mut self.commands, confirmation).await {
            return Err(match e {
                Exit::Failed(e) => self.authorization_failed(&channel_key, e),
                interrupted => interrupted,
            });
        }

        registry.mark_authorized(&channel_key);
        self.backoff.reset();
        self.transition(ConnectionState::Subscribed);
        info!("[TOD WS] Subscribed to {}", channel);

        Ok((channel_key, session))
    }

    /// Cached credentials, refreshed when absent or expired
    async fn credentials(&mut self) -> Result<Arc<Credentials>, Exit> {
        if let Some(credentials) = self.cache.get() {
            if !credentials.is_expired(Utc::now()) {
                return Ok(credentials);
            }
            info!("[TOD WS] Channel key expired, refreshing credentials");
        }

        let credentials =
            guarded(&mut self.commands, self.cache.refresh(self.source.as_ref())).await?;

        if credentials.is_expired(Utc::now()) {
            warn!(
                "[TOD WS] Refreshed channel key is already expired (expiry: {})",
                credentials.channel_key_expiry.as_deref().unwrap_or("none")
            );
        }
        Ok(credentials)
    }

    fn authorization_failed(&self, channel_key: &str, error: RealtimeError) -> Exit {
        if error.requires_fresh_credentials() {
            self.router().registry().mark_rejected(channel_key);
            self.cache.invalidate();
        }
        Exit::Failed(error)
    }

    /// Route frames until the connection fails or a command interrupts
    async fn stream(&mut self, channel_key: &str, session: &TransportSession) -> Exit {
        let activity = session
            .activity_timeout
            .map_or(self.config.activity_timeout, |announced| {
                announced.min(self.config.activity_timeout)
            });
        let pong_timeout = self.config.pong_timeout;

        loop {
            let read = guard(
                &mut self.commands,
                timeout(activity, self.transport.next_frame()),
            )
            .await;

            let frame = match read {
                Err(interrupt) => return Exit::Interrupted(interrupt),
                Ok(Ok(Ok(frame))) => frame,
                Ok(Ok(Err(e))) => return Exit::Failed(e),
                Ok(Err(_)) => match self.heartbeat(activity, pong_timeout).await {
                    Ok(frame) => frame,
                    Err(exit) => return exit,
                },
            };

            if let Err(e) = self.handle_frame(channel_key, frame) {
                return self.authorization_failed(channel_key, e);
            }
        }
    }

    /// Ping after an idle window; any frame within the pong timeout counts
    async fn heartbeat(
        &mut self,
        idle: Duration,
        pong_timeout: Duration,
    ) -> Result<TransportFrame, Exit> {
        debug!("[TOD WS] No activity for {:?}, sending ping", idle);
        guarded(&mut self.commands, self.transport.ping()).await?;

        let reply = guard(
            &mut self.commands,
            timeout(pong_timeout, self.transport.next_frame()),
        )
        .await
        .map_err(Exit::Interrupted)?;

        match reply {
            Ok(frame) => frame.map_err(Exit::Failed),
            Err(_) => {
                warn!("[TOD WS] No pong within {:?}", pong_timeout);
                Err(Exit::Failed(RealtimeError::TransportDisconnect(format!(
                    "heartbeat timeout: no pong within {:?}",
                    pong_timeout
                ))))
            }
        }
    }

    fn handle_frame(&self, channel_key: &str, frame: TransportFrame) -> Result<(), RealtimeError> {
        match frame {
            TransportFrame::Event {
                channel,
                event,
                payload,
            } => {
                self.router()
                    .dispatch(InboundEvent::new(logical_channel(&channel), &event, payload));
            }
            TransportFrame::Pong => debug!("[TOD WS] Pong"),
            TransportFrame::SubscriptionSucceeded { channel } => {
                debug!("[TOD WS] Subscription confirmed again for {}", channel);
            }
            TransportFrame::SubscriptionError {
                channel,
                status,
                message,
            } => {
                if logical_channel(&channel) == channel_key {
                    return Err(RealtimeError::AuthorizationDenied(format!(
                        "{} rejected ({:?}): {}",
                        channel, status, message
                    )));
                }
                warn!("[TOD WS] Subscription error on {}: {}", channel, message);
            }
        }
        Ok(())
    }

    /// Connection lost: every channel goes back to `Pending` and the socket is closed
    async fn teardown(&mut self) {
        self.router().registry().reset_all();
        self.transport.close().await;
    }

    async fn disconnected(&mut self) {
        let was_subscribed = *self.state_tx.borrow() == ConnectionState::Subscribed;

        self.router().registry().reset_all();
        self.transition(ConnectionState::Disconnected);

        if was_subscribed {
            if let Some(key) = &self.channel_key {
                let channel = tod_core::private_channel_name(key);
                match timeout(self.config.handshake_timeout, self.transport.unsubscribe(&channel))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("[TOD WS] Unsubscribe from {} failed: {}", channel, e),
                    Err(_) => debug!("[TOD WS] Unsubscribe from {} timed out", channel),
                }
            }
        }
        self.transport.close().await;
    }

    fn router(&self) -> Arc<EventRouter> {
        Arc::clone(&self.sink.read())
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!("[TOD WS] {} -> {}", previous, next);
            let _ = self.states.send(next);
        }
    }
}

/// Wait for the server to confirm the subscription to `channel`
///
/// Events arriving before the confirmation still go to the router, which
/// drops them while the channel is `Pending`.
async fn await_confirmation<T: Transport>(
    transport: &mut T,
    channel: &str,
    router: &EventRouter,
    limit: Duration,
) -> Result<(), RealtimeError> {
    let confirm = async {
        loop {
            match transport.next_frame().await? {
                TransportFrame::SubscriptionSucceeded { channel: confirmed }
                    if confirmed == channel =>
                {
                    return Ok(());
                }
                TransportFrame::SubscriptionError {
                    channel: rejected,
                    status,
                    message,
                } if rejected == channel || rejected.is_empty() => {
                    return Err(RealtimeError::AuthorizationDenied(format!(
                        "{} rejected ({:?}): {}",
                        channel, status, message
                    )));
                }
                TransportFrame::Event {
                    channel: source,
                    event,
                    payload,
                } => {
                    router.dispatch(InboundEvent::new(logical_channel(&source), &event, payload));
                }
                other => debug!("[TOD WS] Ignoring {:?} before confirmation", other),
            }
        }
    };

    timeout(limit, confirm).await.unwrap_or_else(|_| {
        Err(RealtimeError::AuthorizationUnavailable(format!(
            "no subscription confirmation for {} within {:?}",
            channel, limit
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_channel() {
        assert_eq!(logical_channel("private-k1"), "k1");
        assert_eq!(logical_channel("k1"), "k1");
    }

    #[tokio::test]
    async fn test_guard_returns_output_without_commands() {
        let (_tx, mut rx) = mpsc::channel(1);
        let output = guard(&mut rx, async { 7 }).await;
        assert_eq!(output, Ok(7));
    }

    #[tokio::test]
    async fn test_guard_ignores_connect_and_stops_on_disconnect() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Command::Connect).await.unwrap();
        tx.send(Command::Disconnect).await.unwrap();

        let output = guard(&mut rx, std::future::pending::<()>()).await;
        assert_eq!(output, Err(Interrupt::Disconnect));
    }

    #[tokio::test]
    async fn test_guard_treats_closed_handle_as_shutdown() {
        let (tx, mut rx) = mpsc::channel::<Command>(1);
        drop(tx);

        let output = guard(&mut rx, std::future::pending::<()>()).await;
        assert_eq!(output, Err(Interrupt::Shutdown));
    }
}

//! Scripted collaborators for driving the connection manager in tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tod_core::{AuthToken, CompanyDetails, ConnectionState, Credentials};
use tod_realtime::{
    ChannelAuthorizer, ConnectionManager, CredentialCache, CredentialSource, EventRouter,
    RealtimeConfig, RealtimeError, SubscriptionRegistry, Transport, TransportEndpoint,
    TransportFrame, TransportSession,
};
use tokio::sync::{broadcast, mpsc};

/// Upper bound for anything a test waits on
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        activity_timeout: Duration::from_secs(5),
        pong_timeout: Duration::from_secs(1),
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        reconnect_jitter: false,
        max_reconnect_attempts: None,
        handshake_timeout: Duration::from_secs(2),
        use_transport_host: false,
    }
}

pub fn details(channel_key: &str) -> CompanyDetails {
    CompanyDetails {
        id: Some("c1".to_string()),
        name: Some("Acme".to_string()),
        channel_key: Some(channel_key.to_string()),
        channel_key_expiry: Some("2099-01-01T00:00:00Z".to_string()),
        pusher_host: Some("h".to_string()),
        pusher_key: Some("pk".to_string()),
        pusher_cluster: Some("eu".to_string()),
    }
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(PATIENCE, fut)
        .await
        .expect("timed out waiting")
}

/// Poll until `condition` holds
pub async fn eventually(condition: impl Fn() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

/// Collect state notifications up to and including `last`
pub async fn states_until(
    states: &mut broadcast::Receiver<ConnectionState>,
    last: ConnectionState,
) -> Vec<ConnectionState> {
    within(async {
        let mut seen = Vec::new();
        loop {
            let state = states.recv().await.expect("state channel closed");
            seen.push(state);
            if state == last {
                return seen;
            }
        }
    })
    .await
}

// ============================================================================
// Credential source
// ============================================================================

/// Hands out queued results, then a fallback payload
pub struct StaticSource {
    queue: Mutex<VecDeque<Result<CompanyDetails, RealtimeError>>>,
    fallback: Mutex<CompanyDetails>,
    fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(fallback: CompanyDetails) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn then(self, result: Result<CompanyDetails, RealtimeError>) -> Self {
        self.queue.lock().push_back(result);
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for StaticSource {
    fn name(&self) -> String {
        "static".to_string()
    }

    async fn fetch(&self) -> Result<CompanyDetails, RealtimeError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let queued = self.queue.lock().pop_front();
        queued.unwrap_or_else(|| Ok(self.fallback.lock().clone()))
    }
}

// ============================================================================
// Authorizer
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCall {
    pub channel: String,
    pub socket_id: String,
    pub channel_key: String,
}

/// Returns queued results, then a fixed token
#[derive(Default)]
pub struct ScriptedAuthorizer {
    results: Mutex<VecDeque<Result<AuthToken, RealtimeError>>>,
    calls: Mutex<Vec<AuthCall>>,
    hang: AtomicBool,
}

impl ScriptedAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, result: Result<AuthToken, RealtimeError>) -> Self {
        self.results.lock().push_back(result);
        self
    }

    /// Never answer
    pub fn hanging(self) -> Self {
        self.hang.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<AuthCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChannelAuthorizer for ScriptedAuthorizer {
    async fn authorize(
        &self,
        channel_name: &str,
        socket_id: &str,
        credentials: &Credentials,
    ) -> Result<AuthToken, RealtimeError> {
        self.calls.lock().push(AuthCall {
            channel: channel_name.to_string(),
            socket_id: socket_id.to_string(),
            channel_key: credentials.channel_key.clone(),
        });

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let queued = self.results.lock().pop_front();
        queued.unwrap_or_else(|| Ok(AuthToken::new("pk:signature")))
    }
}

// ============================================================================
// Transport
// ============================================================================

type FrameResult = Result<TransportFrame, RealtimeError>;

#[derive(Default)]
struct ServerState {
    frames: Mutex<Option<mpsc::UnboundedSender<FrameResult>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    pings: AtomicUsize,
    failing_opens: AtomicUsize,
    manual_confirm: AtomicBool,
    silent: AtomicBool,
    subscriptions: Mutex<Vec<(String, AuthToken)>>,
    unsubscriptions: Mutex<Vec<String>>,
}

/// Test-side control of a [`ScriptedTransport`]
#[derive(Clone, Default)]
pub struct ScriptedServer {
    state: Arc<ServerState>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> ScriptedTransport {
        ScriptedTransport {
            state: Arc::clone(&self.state),
            frames: None,
        }
    }

    /// The next `count` opens fail
    pub fn fail_opens(&self, count: usize) {
        self.state.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Subscriptions wait for `confirm` instead of succeeding at once
    pub fn manual_confirm(&self) {
        self.state.manual_confirm.store(true, Ordering::SeqCst);
    }

    /// Pings go unanswered
    pub fn silent(&self) {
        self.state.silent.store(true, Ordering::SeqCst);
    }

    fn push(&self, frame: FrameResult) -> bool {
        self.state
            .frames
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    pub fn confirm(&self, channel: &str) -> bool {
        self.push(Ok(TransportFrame::SubscriptionSucceeded {
            channel: channel.to_string(),
        }))
    }

    pub fn reject(&self, channel: &str, status: u16) -> bool {
        self.push(Ok(TransportFrame::SubscriptionError {
            channel: channel.to_string(),
            status: Some(status),
            message: "AuthError: Invalid signature".to_string(),
        }))
    }

    pub fn event(&self, channel: &str, event: &str, payload: Value) -> bool {
        self.push(Ok(TransportFrame::Event {
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
        }))
    }

    /// Drop the live connection as if the network went away
    pub fn drop_connection(&self) -> bool {
        self.push(Err(RealtimeError::TransportDisconnect(
            "connection reset".to_string(),
        )))
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<(String, AuthToken)> {
        self.state.subscriptions.lock().clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        self.state.unsubscriptions.lock().clone()
    }
}

/// In-memory transport fed by a [`ScriptedServer`]
pub struct ScriptedTransport {
    state: Arc<ServerState>,
    frames: Option<mpsc::UnboundedReceiver<FrameResult>>,
}

impl ScriptedTransport {
    fn push(&self, frame: FrameResult) {
        if let Some(tx) = self.state.frames.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &mut self,
        _endpoint: &TransportEndpoint,
    ) -> Result<TransportSession, RealtimeError> {
        let opens = self.state.opens.fetch_add(1, Ordering::SeqCst) + 1;

        let failing = self.state.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(RealtimeError::TransportDisconnect(
                "connection refused".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.frames.lock() = Some(tx);
        self.frames = Some(rx);

        Ok(TransportSession {
            socket_id: format!("{}.1", opens),
            activity_timeout: None,
        })
    }

    async fn subscribe(&mut self, channel: &str, token: &AuthToken) -> Result<(), RealtimeError> {
        self.state
            .subscriptions
            .lock()
            .push((channel.to_string(), token.clone()));

        if !self.state.manual_confirm.load(Ordering::SeqCst) {
            self.push(Ok(TransportFrame::SubscriptionSucceeded {
                channel: channel.to_string(),
            }));
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), RealtimeError> {
        self.state.unsubscriptions.lock().push(channel.to_string());
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), RealtimeError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if !self.state.silent.load(Ordering::SeqCst) {
            self.push(Ok(TransportFrame::Pong));
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<TransportFrame, RealtimeError> {
        let Some(frames) = self.frames.as_mut() else {
            return Err(RealtimeError::TransportDisconnect("not open".to_string()));
        };
        frames
            .recv()
            .await
            .unwrap_or_else(|| Err(RealtimeError::TransportDisconnect("closed".to_string())))
    }

    async fn close(&mut self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.frames = None;
        *self.state.frames.lock() = None;
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub manager: ConnectionManager,
    pub server: ScriptedServer,
    pub source: Arc<StaticSource>,
    pub authorizer: Arc<ScriptedAuthorizer>,
    pub cache: Arc<CredentialCache>,
    pub registry: Arc<SubscriptionRegistry>,
    pub router: Arc<EventRouter>,
}

impl Harness {
    pub fn start(
        config: RealtimeConfig,
        source: StaticSource,
        authorizer: ScriptedAuthorizer,
        server: ScriptedServer,
    ) -> Self {
        let source = Arc::new(source);
        let authorizer = Arc::new(authorizer);
        let cache = Arc::new(CredentialCache::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let router = Arc::new(EventRouter::new(Arc::clone(&registry)));

        let manager = ConnectionManager::spawn(
            config,
            Arc::clone(&cache),
            source.clone(),
            authorizer.clone(),
            server.transport(),
            Arc::clone(&router),
        );

        Self {
            manager,
            server,
            source,
            authorizer,
            cache,
            registry,
            router,
        }
    }

    /// Default collaborators serving channel key `k1`
    pub fn with_defaults() -> Self {
        Self::start(
            test_config(),
            StaticSource::new(details("k1")),
            ScriptedAuthorizer::new(),
            ScriptedServer::new(),
        )
    }

    pub async fn wait_for(&self, state: ConnectionState) {
        within(self.manager.wait_for(state))
            .await
            .expect("connection manager closed");
    }

    /// Record payloads delivered for an event on a channel
    pub fn record(&self, channel: &str, event: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        self.registry.bind(channel, event, move |inbound| {
            sink.lock().push(inbound.payload.clone());
            Ok(())
        });
        seen
    }
}

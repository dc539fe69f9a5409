//! Pusher protocol over tokio-tungstenite
//!
//! Speaks protocol 7: waits for `pusher:connection_established`, answers
//! server pings, and turns subscription results and channel events into
//! [`TransportFrame`]s.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tod_core::{decode_payload, AuthToken};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Transport, TransportEndpoint, TransportFrame, TransportSession};
use crate::error::RealtimeError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The error a `pusher:error` ends the connection with, if any
///
/// Codes 4000-4099 mean the connection must not be retried as configured,
/// for example an unknown or disabled app key. Codes 4100-4299 close the
/// socket and allow a reconnect.
fn closing_error(code: Option<u16>, message: &str) -> Option<RealtimeError> {
    match code? {
        code @ 4000..=4099 => Some(RealtimeError::Configuration(format!(
            "Server error {}: {}",
            code, message
        ))),
        code @ 4100..=4299 => Some(RealtimeError::TransportDisconnect(format!(
            "Server error {}: {}",
            code, message
        ))),
        _ => None,
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawMessage {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionEstablished {
    socket_id: String,
    #[serde(default)]
    activity_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorData {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionErrorData {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<u16>,
}

/// A decoded text frame
#[derive(Debug, PartialEq)]
enum Decoded {
    Established(TransportSession),
    Ping,
    Error { code: Option<u16>, message: String },
    Frame(TransportFrame),
    Ignored,
}

fn decode(text: &str) -> Result<Decoded, serde_json::Error> {
    let raw: RawMessage = serde_json::from_str(text)?;
    let data = decode_payload(raw.data);

    let decoded = match raw.event.as_str() {
        "pusher:connection_established" => {
            let established: ConnectionEstablished = serde_json::from_value(data)?;
            Decoded::Established(TransportSession {
                socket_id: established.socket_id,
                activity_timeout: established.activity_timeout.map(Duration::from_secs),
            })
        }
        "pusher:ping" => Decoded::Ping,
        "pusher:pong" => Decoded::Frame(TransportFrame::Pong),
        "pusher:error" => {
            let error: ErrorData = serde_json::from_value(data).unwrap_or_default();
            Decoded::Error {
                code: error.code,
                message: error.message.unwrap_or_default(),
            }
        }
        "pusher_internal:subscription_succeeded" => match raw.channel {
            Some(channel) => Decoded::Frame(TransportFrame::SubscriptionSucceeded { channel }),
            None => Decoded::Ignored,
        },
        "pusher:subscription_error" | "pusher_internal:subscription_error" => {
            let error: SubscriptionErrorData = serde_json::from_value(data).unwrap_or_default();
            let message = match (error.kind, error.error) {
                (Some(kind), Some(error)) => format!("{}: {}", kind, error),
                (None, Some(error)) => error,
                (Some(kind), None) => kind,
                (None, None) => "subscription rejected".to_string(),
            };
            Decoded::Frame(TransportFrame::SubscriptionError {
                channel: raw.channel.unwrap_or_default(),
                status: error.status,
                message,
            })
        }
        event if event.starts_with("pusher:") || event.starts_with("pusher_internal:") => {
            Decoded::Ignored
        }
        event => match raw.channel {
            Some(channel) => Decoded::Frame(TransportFrame::Event {
                channel,
                event: event.to_string(),
                payload: data,
            }),
            None => Decoded::Ignored,
        },
    };

    Ok(decoded)
}

fn event_message(event: &str, data: Value) -> Message {
    let json = json!({ "event": event, "data": data }).to_string();
    Message::Text(json.into())
}

// ============================================================================
// Transport
// ============================================================================

/// WebSocket transport for Pusher-compatible servers
pub struct PusherTransport {
    stream: Option<WsStream>,
    handshake_timeout: Duration,
}

impl PusherTransport {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            stream: None,
            handshake_timeout,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn stream_mut(&mut self) -> Result<&mut WsStream, RealtimeError> {
        self.stream
            .as_mut()
            .ok_or_else(|| RealtimeError::TransportDisconnect("not connected".to_string()))
    }

    async fn send(&mut self, message: Message) -> Result<(), RealtimeError> {
        let result = self.stream_mut()?.send(message).await;
        if let Err(e) = result {
            self.stream = None;
            return Err(RealtimeError::TransportDisconnect(format!(
                "Failed to send: {}",
                e
            )));
        }
        Ok(())
    }

    /// Read until the server assigns a socket id
    async fn await_established(&mut self) -> Result<TransportSession, RealtimeError> {
        loop {
            let msg = self.stream_mut()?.next().await;
            match msg {
                Some(Ok(Message::Text(text))) => match decode(text.as_str()) {
                    Ok(Decoded::Established(session)) => return Ok(session),
                    Ok(Decoded::Error { code, message }) => {
                        return Err(closing_error(code, &message).unwrap_or_else(|| {
                            RealtimeError::TransportDisconnect(format!(
                                "Server error {:?} during handshake: {}",
                                code, message
                            ))
                        }));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("[TOD WS] Failed to parse handshake message: {}", e),
                },
                Some(Ok(Message::Ping(data))) => self.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(RealtimeError::TransportDisconnect(
                        "Connection closed during handshake".to_string(),
                    ));
                }
                Some(Err(e)) => {
                    return Err(RealtimeError::TransportDisconnect(format!(
                        "Handshake failed: {}",
                        e
                    )));
                }
                Some(Ok(_)) => {}
            }
        }
    }

    fn disconnected(&mut self, reason: String) -> RealtimeError {
        self.stream = None;
        RealtimeError::TransportDisconnect(reason)
    }
}

impl Default for PusherTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl Transport for PusherTransport {
    async fn open(
        &mut self,
        endpoint: &TransportEndpoint,
    ) -> Result<TransportSession, RealtimeError> {
        self.close().await;

        let url = endpoint.url()?;
        info!(
            "[TOD WS] Connecting to {}",
            url.host_str().unwrap_or_default()
        );

        let (stream, _) = match timeout(self.handshake_timeout, connect_async(url.as_str())).await
        {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(RealtimeError::TransportDisconnect(format!(
                    "Connection failed: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(RealtimeError::TransportDisconnect(
                    "Timed out connecting".to_string(),
                ))
            }
        };
        self.stream = Some(stream);

        let session = match timeout(self.handshake_timeout, self.await_established()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(e);
            }
            Err(_) => {
                return Err(self.disconnected(
                    "Timed out waiting for connection_established".to_string(),
                ))
            }
        };

        info!(
            "[TOD WS] Connected (socket id: {}, activity timeout: {:?})",
            session.socket_id, session.activity_timeout
        );
        Ok(session)
    }

    async fn subscribe(&mut self, channel: &str, token: &AuthToken) -> Result<(), RealtimeError> {
        let mut data = json!({ "channel": channel, "auth": token.auth });
        if let Some(channel_data) = &token.channel_data {
            data["channel_data"] = Value::String(channel_data.clone());
        }

        debug!("[TOD WS] Subscribing to {}", channel);
        self.send(event_message("pusher:subscribe", data)).await
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), RealtimeError> {
        debug!("[TOD WS] Unsubscribing from {}", channel);
        self.send(event_message(
            "pusher:unsubscribe",
            json!({ "channel": channel }),
        ))
        .await
    }

    async fn ping(&mut self) -> Result<(), RealtimeError> {
        self.send(event_message("pusher:ping", json!({}))).await
    }

    async fn next_frame(&mut self) -> Result<TransportFrame, RealtimeError> {
        loop {
            let msg = self.stream_mut()?.next().await;
            match msg {
                Some(Ok(Message::Text(text))) => match decode(text.as_str()) {
                    Ok(Decoded::Frame(frame)) => return Ok(frame),
                    Ok(Decoded::Ping) => {
                        debug!("[TOD WS] Server ping");
                        self.send(event_message("pusher:pong", json!({}))).await?;
                    }
                    Ok(Decoded::Error { code, message }) => match closing_error(code, &message) {
                        Some(e) => {
                            warn!("[TOD WS] Server closing connection: {}", e);
                            self.stream = None;
                            return Err(e);
                        }
                        None => warn!("[TOD WS] Server error {:?}: {}", code, message),
                    },
                    Ok(Decoded::Established(_)) | Ok(Decoded::Ignored) => {}
                    Err(e) => warn!("[TOD WS] Failed to parse message: {}", e),
                },
                Some(Ok(Message::Ping(data))) => self.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) => {
                    info!("[TOD WS] Connection closed by server");
                    return Err(self.disconnected("Connection closed by server".to_string()));
                }
                Some(Err(e)) => {
                    warn!("[TOD WS] Error: {}", e);
                    return Err(self.disconnected(e.to_string()));
                }
                None => {
                    info!("[TOD WS] Stream ended");
                    return Err(self.disconnected("Stream ended".to_string()));
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            match timeout(self.handshake_timeout, stream.close(None)).await {
                Ok(Ok(())) => debug!("[TOD WS] Connection closed"),
                Ok(Err(e)) => debug!("[TOD WS] Close failed: {}", e),
                Err(_) => debug!("[TOD WS] Close timed out"),
            }
        }
    }
}

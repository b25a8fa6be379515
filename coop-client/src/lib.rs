//! COOP Client - Duplex Connection to the Coordination Backbone
//!
//! One WebSocket connection multiplexes concurrent requests by
//! correlation id. `call` resolves when the matching result or error
//! frame arrives, or fails locally on timeout. Event pushes dispatch to
//! per-event-type handler lists. Calls issued while disconnected are
//! queued and flushed in order on (re)connect; calls already on the wire
//! are never retried.

use coop_core::{RequestEnvelope, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("Connection closed before the response arrived")]
    ConnectionClosed,
    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },
    #[error("Config error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Reconnect backoff: exponential with a cap.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay after `attempt` consecutive failures (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis((raw as u64).min(self.max_ms))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://localhost:3000/ws`.
    pub url: String,
    /// Full authorization header value, e.g. `Bearer <token>`.
    pub auth_header: Option<String>,
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_header: None,
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_auth_header(mut self, header: impl Into<String>) -> Self {
        self.auth_header = Some(header.into());
        self
    }
}

type PendingSender = oneshot::Sender<Result<Value, ClientError>>;
type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct ClientInner {
    config: ClientConfig,
    /// In-flight calls awaiting a correlated frame.
    pending: Mutex<HashMap<String, PendingSender>>,
    /// Serialized envelopes not yet on the wire.
    queue: Mutex<VecDeque<String>>,
    /// Per-event-type handler lists.
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
    /// Present while a connection is up.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: AtomicBool,
}

/// Handle to the duplex connection. Cheap to clone.
#[derive(Clone)]
pub struct CoopClient {
    inner: Arc<ClientInner>,
}

impl CoopClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                pending: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                handlers: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Start the connection task. It reconnects with capped exponential
    /// backoff until [`close`](Self::close) is called.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_connection(inner))
    }

    /// Stop reconnecting and drop the live connection.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.outbound.lock().unwrap().take();
        fail_pending(&self.inner, "client closed");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().unwrap().is_some()
    }

    /// Issue one request and await its correlated response.
    ///
    /// If the connection is down the envelope is queued for flush on
    /// reconnect; the timeout runs either way, so a queued call fails
    /// locally rather than waiting forever.
    pub async fn call(&self, op: &str, payload: Value) -> Result<Value, ClientError> {
        let id = Uuid::now_v7().to_string();
        let envelope = RequestEnvelope {
            id: id.clone(),
            op: op.to_string(),
            payload,
        };
        let text = serde_json::to_string(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), tx);
        send_or_enqueue(&self.inner, text);

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                // Purge so a late response is dropped, not misdelivered.
                self.inner.pending.lock().unwrap().remove(&id);
                debug!(request_id = %id, op, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Register a handler for an event type, e.g. `message.received`.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Number of queued (unsent) envelopes.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    #[cfg(test)]
    fn feed_frame(&self, frame: ServerFrame) {
        handle_frame(&self.inner, frame);
    }
}

fn send_or_enqueue(inner: &ClientInner, text: String) {
    let outbound = inner.outbound.lock().unwrap();
    match outbound.as_ref() {
        Some(tx) if tx.send(text.clone()).is_ok() => {}
        _ => {
            drop(outbound);
            inner.queue.lock().unwrap().push_back(text);
        }
    }
}

fn fail_pending(inner: &ClientInner, _reason: &str) {
    let pending: Vec<PendingSender> = {
        let mut map = inner.pending.lock().unwrap();
        map.drain().map(|(_, tx)| tx).collect()
    };
    for tx in pending {
        let _ = tx.send(Err(ClientError::ConnectionClosed));
    }
}

/// Route one inbound frame: resolve or reject the matching pending
/// call, or dispatch an event to its handlers. Unknown or already
/// resolved correlation ids are dropped.
fn handle_frame(inner: &ClientInner, frame: ServerFrame) {
    match frame {
        ServerFrame::Result { request_id, payload } => {
            match inner.pending.lock().unwrap().remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(Ok(payload));
                }
                None => debug!(%request_id, "result for unknown correlation id dropped"),
            }
        }
        ServerFrame::Error { request_id, payload } => {
            match inner.pending.lock().unwrap().remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(Err(ClientError::Server {
                        code: payload.code,
                        message: payload.error,
                    }));
                }
                None => debug!(%request_id, "error for unknown correlation id dropped"),
            }
        }
        ServerFrame::Event { payload } => {
            let Some(event_type) = payload.get("eventType").and_then(Value::as_str) else {
                debug!("event frame without eventType dropped");
                return;
            };
            let handlers: Vec<EventHandler> = inner
                .handlers
                .lock()
                .unwrap()
                .get(event_type)
                .map(|list| list.to_vec())
                .unwrap_or_default();
            for handler in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(&payload))).is_err() {
                    warn!(event_type, "event handler panicked; continuing");
                }
            }
        }
    }
}

async fn run_connection(inner: Arc<ClientInner>) {
    let mut attempt: u32 = 0;
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match connect_once(&inner).await {
            Ok(()) => {
                // Clean session end resets the backoff.
                attempt = 0;
            }
            Err(err) => {
                warn!(error = %err, "connection failed");
                attempt = attempt.saturating_add(1);
            }
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let delay = inner.config.reconnect.delay_for(attempt);
        debug!(?delay, "reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
}

/// Run one connection to completion: dial, flush the queue, then pump
/// frames until the socket closes.
async fn connect_once(inner: &Arc<ClientInner>) -> Result<(), ClientError> {
    let mut request = inner
        .config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::Config(e.to_string()))?;
    if let Some(header) = &inner.config.auth_header {
        let value = header
            .parse::<HeaderValue>()
            .map_err(|_| ClientError::Config("invalid authorization header".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    info!(url = %inner.config.url, "connected");
    let (mut sink, mut source) = stream.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    *inner.outbound.lock().unwrap() = Some(outbound_tx);

    // Flush envelopes queued while disconnected, oldest first.
    let backlog: Vec<String> = inner.queue.lock().unwrap().drain(..).collect();
    for text in backlog {
        sink.send(Message::Text(text.into())).await?;
    }

    let result = loop {
        tokio::select! {
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => handle_frame(inner, frame),
                            Err(err) => debug!(error = %err, "undecodable frame dropped"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Err(ClientError::from(err)),
                }
            }
            Some(text) = outbound_rx.recv() => {
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    break Err(ClientError::from(err));
                }
            }
        }
    };

    inner.outbound.lock().unwrap().take();
    result
}

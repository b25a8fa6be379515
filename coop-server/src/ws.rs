//! WebSocket endpoint: the duplex request/response/event protocol.
//!
//! A connection authenticates once from the upgrade request headers,
//! then loops over three sources: inbound frames from the client,
//! component events fanned out over a broadcast channel, and
//! per-connection message deliveries over an mpsc channel. Every inbound
//! request is rate-limit checked, decoded, dispatched, and answered with
//! a correlated frame.

use crate::dispatch::{disconnect, dispatch, ConnState};
use crate::error::{ErrorCode, ServerError};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
};
use coop_core::{AuthContext, RequestEnvelope, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Fan-out channel carrying component events to every connection.
#[derive(Clone)]
pub struct EventFanout {
    tx: broadcast::Sender<ServerFrame>,
}

impl EventFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Non-blocking. No receivers means the frame is dropped, and a slow
    /// consumer lags rather than stalling the producer.
    pub fn broadcast(&self, frame: ServerFrame) {
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        self.tx.subscribe()
    }
}

/// Upgrade handler. Authentication and the connect-time rate check
/// happen before the upgrade completes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let auth = state.auth.authenticate(auth_header)?;

    let connection_id = state.limiter.connection_id();
    if !state.limiter.check_limit(&connection_id) {
        return Err(ServerError::new(
            ErrorCode::RateLimited,
            "rate limit exceeded",
        ));
    }

    info!(agent_id = %auth.agent_id, connection_id = %connection_id, "connection upgrade");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, auth, connection_id)))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    auth: AuthContext,
    connection_id: String,
) {
    state.connection_opened();
    let (mut sender, mut receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut conn = ConnState::new(connection_id, events_tx);
    let mut fanout_rx = state.events.subscribe();

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(frame) = process_text(&state, &mut conn, &auth, &text).await {
                            if send_frame(&mut sender, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection_id = %conn.connection_id, "client closed");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong handled by axum; binary frames ignored.
                    }
                    Some(Err(err)) => {
                        warn!(connection_id = %conn.connection_id, error = %err, "receive error");
                        break;
                    }
                }
            }
            delivery = events_rx.recv() => {
                // Sender half lives in ConnState, so the channel cannot
                // close while the connection is up.
                if let Some(frame) = delivery {
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break;
                    }
                }
            }
            fanned = fanout_rx.recv() => {
                match fanned {
                    Ok(frame) => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            connection_id = %conn.connection_id,
                            skipped,
                            "connection lagged; events dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    disconnect(&state, &mut conn).await;
    state.connection_closed();
    info!(connection_id = %conn.connection_id, "connection closed");
}

/// Decode and dispatch one inbound text frame.
///
/// Frames with no recoverable correlation id are logged and dropped;
/// everything else is answered. The rate check runs before decoding and
/// a rejection does not consume the call.
async fn process_text(
    state: &AppState,
    conn: &mut ConnState,
    auth: &AuthContext,
    text: &str,
) -> Option<ServerFrame> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            debug!(connection_id = %conn.connection_id, error = %err, "unparseable frame dropped");
            return None;
        }
    };
    let Some(request_id) = value.get("id").and_then(Value::as_str).map(String::from) else {
        debug!(connection_id = %conn.connection_id, "frame without id dropped");
        return None;
    };

    if !state.limiter.check_limit(&conn.connection_id) {
        state
            .metrics
            .increment_counter("rate_limited_total", &[], 1);
        return Some(ServerFrame::error(
            request_id,
            ErrorCode::RateLimited.as_str(),
            "rate limit exceeded",
        ));
    }

    let envelope: RequestEnvelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(err) => {
            return Some(ServerFrame::error(
                request_id,
                ErrorCode::InvalidRequest.as_str(),
                format!("invalid request envelope: {err}"),
            ));
        }
    };

    let op = envelope.op.clone();
    let started = Instant::now();
    let frame = dispatch(state, conn, auth, envelope).await;
    state
        .metrics
        .increment_counter("requests_total", &[("op", op.as_str())], 1);
    state.metrics.record_timing(
        "request_duration_ms",
        &[("op", op.as_str())],
        started.elapsed().as_secs_f64() * 1000.0,
    );
    Some(frame)
}

async fn send_frame(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, AuthManager};
    use coop_core::Permissions;
    use serde_json::json;

    fn test_state() -> Arc<AppState> {
        AppState::for_tests(Arc::new(AuthManager::new(AuthConfig::default())))
    }

    fn test_conn() -> (ConnState, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnState::new("conn_ws_test".to_string(), tx), rx)
    }

    fn anon() -> AuthContext {
        AuthContext::new("anonymous", Permissions::all())
    }

    #[test]
    fn fanout_delivers_to_subscribers() {
        let fanout = EventFanout::new(16);
        let mut rx = fanout.subscribe();
        fanout.broadcast(ServerFrame::event("ping", json!({})));
        let frame = rx.try_recv().unwrap();
        assert!(matches!(frame, ServerFrame::Event { .. }));
    }

    #[test]
    fn fanout_without_receivers_does_not_panic() {
        let fanout = EventFanout::new(16);
        fanout.broadcast(ServerFrame::event("ping", json!({})));
    }

    #[tokio::test]
    async fn unparseable_frame_is_dropped() {
        let state = test_state();
        let (mut conn, _rx) = test_conn();
        let frame = process_text(&state, &mut conn, &anon(), "not json").await;
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn frame_without_id_is_dropped() {
        let state = test_state();
        let (mut conn, _rx) = test_conn();
        let frame = process_text(&state, &mut conn, &anon(), r#"{"type":"agent.list"}"#).await;
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn malformed_envelope_with_id_gets_invalid_request() {
        let state = test_state();
        let (mut conn, _rx) = test_conn();
        let frame = process_text(&state, &mut conn, &anon(), r#"{"id":"7","payload":{}}"#)
            .await
            .unwrap();
        match frame {
            ServerFrame::Error { request_id, payload } => {
                assert_eq!(request_id, "7");
                assert_eq!(payload.code, "INVALID_REQUEST");
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn valid_request_is_dispatched_and_metered() {
        let state = test_state();
        let (mut conn, _rx) = test_conn();
        let frame = process_text(
            &state,
            &mut conn,
            &anon(),
            r#"{"id":"1","type":"agent.list","payload":{}}"#,
        )
        .await
        .unwrap();
        assert!(matches!(frame, ServerFrame::Result { .. }));
        assert_eq!(
            state
                .metrics
                .counter_value("requests_total", &[("op", "agent.list")]),
            1
        );
    }

    #[tokio::test]
    async fn over_limit_requests_get_rate_limited_frames() {
        let state = AppState::for_tests_with_rate_limit(
            Arc::new(AuthManager::new(AuthConfig::default())),
            crate::rate_limit::RateLimitConfig {
                window_ms: 60_000,
                max_requests: 2,
            },
        );
        let (mut conn, _rx) = test_conn();
        let request = r#"{"id":"1","type":"agent.list","payload":{}}"#;
        for _ in 0..2 {
            let frame = process_text(&state, &mut conn, &anon(), request).await.unwrap();
            assert!(matches!(frame, ServerFrame::Result { .. }));
        }
        let frame = process_text(&state, &mut conn, &anon(), request).await.unwrap();
        match frame {
            ServerFrame::Error { payload, .. } => assert_eq!(payload.code, "RATE_LIMITED"),
            other => panic!("expected error frame, got {other:?}"),
        }
    }
}

//! COOP Server - WebSocket Transport for the Coordination Backbone
//!
//! Hosts the registry, bus, context store, and task orchestrator behind
//! a multiplexed WebSocket protocol, with authentication, per-connection
//! rate limiting, metrics, and HTTP health/metrics endpoints.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod routes;
pub mod ws;

use crate::auth::AuthManager;
use crate::metrics::MetricsCollector;
use crate::rate_limit::{ConnectionRateLimiter, RateLimitConfig};
use crate::ws::EventFanout;
use axum::{routing::get, Router};
use coop_bus::{MessageBus, DEFAULT_HISTORY_CAPACITY};
use coop_context::ContextStore;
use coop_registry::AgentRegistry;
use coop_storage::Storage;
use coop_tasks::TaskOrchestrator;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state injected into every handler.
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub bus: Arc<MessageBus>,
    pub contexts: Arc<ContextStore>,
    pub storage: Arc<dyn Storage>,
    pub tasks: Arc<TaskOrchestrator>,
    pub auth: Arc<AuthManager>,
    pub limiter: Arc<ConnectionRateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub events: EventFanout,
    pub started_at: Instant,
    active_connections: AtomicU64,
}

impl AppState {
    pub fn new(
        auth: Arc<AuthManager>,
        storage: Arc<dyn Storage>,
        rate_limit: RateLimitConfig,
        ws_capacity: usize,
    ) -> Arc<Self> {
        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(MessageBus::new(DEFAULT_HISTORY_CAPACITY));
        let contexts = Arc::new(ContextStore::new());
        let tasks = Arc::new(TaskOrchestrator::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            Arc::clone(&bus),
        ));
        let events = EventFanout::new(ws_capacity);

        let state = Arc::new(Self {
            registry,
            bus,
            contexts,
            storage,
            tasks,
            auth,
            limiter: Arc::new(ConnectionRateLimiter::new(rate_limit)),
            metrics: Arc::new(MetricsCollector::new()),
            events,
            started_at: Instant::now(),
            active_connections: AtomicU64::new(0),
        });
        state.wire_component_events();
        state
    }

    /// Fan component lifecycle events out to every connection. The
    /// enums already carry an `eventType` tag, so their serialized form
    /// is the event payload.
    fn wire_component_events(self: &Arc<Self>) {
        fn forward<E: Serialize>(events: &EventFanout, event: &E) {
            match serde_json::to_value(event) {
                Ok(payload) => events.broadcast(coop_core::ServerFrame::Event { payload }),
                Err(err) => tracing::warn!(error = %err, "failed to serialize component event"),
            }
        }

        let events = self.events.clone();
        self.registry
            .observers()
            .subscribe(move |event| forward(&events, event));

        let events = self.events.clone();
        self.contexts
            .observers()
            .subscribe(move |event| forward(&events, event));

        let events = self.events.clone();
        self.tasks
            .observers()
            .subscribe(move |event| forward(&events, event));
    }

    pub fn connection_opened(&self) {
        let count = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.set_gauge("connections", &[], count as f64);
    }

    pub fn connection_closed(&self) {
        let count = self
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        self.metrics.set_gauge("connections", &[], count as f64);
    }

    #[cfg(test)]
    pub fn for_tests(auth: Arc<AuthManager>) -> Arc<Self> {
        Self::for_tests_with_rate_limit(auth, RateLimitConfig::default())
    }

    #[cfg(test)]
    pub fn for_tests_with_rate_limit(
        auth: Arc<AuthManager>,
        rate_limit: RateLimitConfig,
    ) -> Arc<Self> {
        let storage: Arc<dyn Storage> = Arc::new(coop_storage::MemoryStorage::new(1000));
        Self::new(auth, storage, rate_limit, 64)
    }
}

/// Build the application router: the WebSocket endpoint plus the plain
/// HTTP surface.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use coop_core::ServerFrame;
    use serde_json::json;

    #[tokio::test]
    async fn component_events_reach_the_fanout() {
        let state = AppState::for_tests(Arc::new(AuthManager::new(AuthConfig::default())));
        let mut rx = state.events.subscribe();

        state
            .registry
            .register(coop_test_utils::registration("worker"));

        let frame = rx.try_recv().unwrap();
        match frame {
            ServerFrame::Event { payload } => {
                assert_eq!(payload["eventType"], json!("agent_registered"));
                assert_eq!(payload["agent"]["name"], json!("worker"));
            }
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn connection_gauge_tracks_open_and_close() {
        let state = AppState::for_tests(Arc::new(AuthManager::new(AuthConfig::default())));
        state.connection_opened();
        state.connection_opened();
        assert_eq!(state.metrics.gauge_value("connections", &[]), Some(2.0));
        state.connection_closed();
        assert_eq!(state.metrics.gauge_value("connections", &[]), Some(1.0));
    }
}

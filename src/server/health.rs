use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use tracing::info;

use crate::{server::client::ConnectionRegistry, utils::BrokerError};

/// Struct for managing broker health metrics.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Number of channels currently admitted.
    pub connections: IntGauge,
    /// Channels admitted since start.
    pub connections_total: IntCounter,
    /// TLS handshakes that failed or were rejected.
    pub tls_handshake_failures: IntCounter,
    /// Events received from peers.
    pub events_received: IntCounter,
    /// Events sent to peers.
    pub events_sent: IntCounter,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMetrics {
    /// Creates a new instance of `HealthMetrics` and registers the metrics with Prometheus.
    pub fn new() -> Self {
        let registry = Registry::new();
        let connections = IntGauge::new("broker_connections", "Admitted channels")
            .expect("valid metric definition");
        let connections_total =
            IntCounter::new("broker_connections_total", "Channels admitted since start")
                .expect("valid metric definition");
        let tls_handshake_failures = IntCounter::new(
            "broker_tls_handshake_failures_total",
            "Failed or rejected TLS handshakes",
        )
        .expect("valid metric definition");
        let events_received =
            IntCounter::new("broker_events_received_total", "Events received from peers")
                .expect("valid metric definition");
        let events_sent = IntCounter::new("broker_events_sent_total", "Events sent to peers")
            .expect("valid metric definition");

        for collector in [
            Box::new(connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(connections_total.clone()),
            Box::new(tls_handshake_failures.clone()),
            Box::new(events_received.clone()),
            Box::new(events_sent.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registered once");
        }

        Self {
            connections,
            connections_total,
            tls_handshake_failures,
            events_received,
            events_sent,
            registry,
        }
    }

    /// Exposes the current state of all registered metrics in Prometheus text format.
    pub fn expose_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[derive(Clone)]
struct HealthState {
    metrics: HealthMetrics,
    registry: ConnectionRegistry,
}

/// Builds the plain HTTP router: `/metrics`, `/health`, and 404 for anything else.
pub fn router(metrics: HealthMetrics, registry: ConnectionRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .fallback(not_found)
        .with_state(HealthState { metrics, registry })
}

/// Serves [`router`] over plain HTTP on `addr` until the task is dropped.
///
/// # Errors
/// Returns `BrokerError::BindError` if the address cannot be bound or the server fails.
pub async fn serve_metrics_http(
    addr: SocketAddr,
    metrics: HealthMetrics,
    registry: ConnectionRegistry,
) -> Result<(), BrokerError> {
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| BrokerError::BindError(format!("{}: {}", addr, e)))?;
    info!("Health listener on http://{}", addr);

    server
        .serve(router(metrics, registry).into_make_service())
        .await
        .map_err(|e| BrokerError::BindError(e.to_string()))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    state.metrics.expose_metrics()
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.count(),
    }))
}

async fn not_found() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

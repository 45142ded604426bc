use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
    paired_devices: usize,
}

/// Readiness shared between the accept loop and the metrics endpoint.
///
/// The agent is ready once its listener is bound; the paired device count is
/// reported alongside so an operator can tell an unpaired agent apart.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    paired_devices: Arc<AtomicUsize>,
}

impl HealthState {
    /// Creates a state that is not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the agent as ready or not.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Whether the agent is accepting connections.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Record the number of paired devices.
    pub fn set_paired_devices(&self, count: usize) {
        self.paired_devices.store(count, Ordering::Relaxed);
        gauges::paired_devices(count);
    }

    /// Number of paired devices last recorded.
    #[must_use]
    pub fn paired_devices(&self) -> usize {
        self.paired_devices.load(Ordering::Relaxed)
    }
}

/// Serves `/metrics`, `/health` and `/ready` on `addr` until the task is
/// dropped.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or binding fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if the agent is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    let ready = state.is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            status: if ready { "ready" } else { "not ready" },
            ready,
            paired_devices: state.paired_devices(),
        }),
    )
}

/// Connection gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("keyferry_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("keyferry_connections_active").decrement(1.0);
    }

    /// Set the paired device count.
    pub fn paired_devices(count: usize) {
        metrics::gauge!("keyferry_paired_devices").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record an accepted connection by route (`/pair`, `/msg`, or `legacy`).
    pub fn connections_total(route: &'static str) {
        metrics::counter!("keyferry_connections_total", "route" => route).increment(1);
    }

    /// Record a processed frame by outcome (reply status or error label).
    pub fn messages_total(outcome: &'static str) {
        metrics::counter!("keyferry_messages_total", "outcome" => outcome).increment(1);
    }

    /// Record a pairing attempt by final status.
    pub fn pairings_total(status: &'static str) {
        metrics::counter!("keyferry_pairings_total", "status" => status).increment(1);
    }

    /// Record a connection refused at accept time.
    pub fn connections_refused_total(reason: &'static str) {
        metrics::counter!("keyferry_connections_refused_total", "reason" => reason).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record the time spent dispatching one frame, in seconds.
    pub fn dispatch_seconds(value: f64) {
        metrics::histogram!("keyferry_dispatch_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_handler_tracks_state() {
        let state = HealthState::new();
        let (code, _) = ready_handler(state.clone()).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready(true);
        state.set_paired_devices(2);
        let (code, Json(body)) = ready_handler(state).await;
        assert_eq!(code, StatusCode::OK);
        assert!(body.ready);
        assert_eq!(body.paired_devices, 2);
    }

    #[tokio::test]
    async fn health_handler_is_always_ok() {
        let (code, Json(body)) = health_handler().await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body.status, "healthy");
    }
}

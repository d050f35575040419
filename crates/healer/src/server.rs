//! HTTP status server: health, readiness, metrics and the store snapshot.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::HealerMetrics;
use crate::store::{time_until_eligible, CircuitState, CooldownStore};
use crate::types::WorkloadKey;

/// Shared state behind every handler.
pub struct ServerState {
    pub store: CooldownStore,
    pub metrics: Arc<HealerMetrics>,
    pub ready: Arc<AtomicBool>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/workloads", get(workloads_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the listen address. Done before the control loop starts so a bad
/// address fails startup.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server on {addr}"))
}

/// Serve until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(state);
    if let Ok(addr) = listener.local_addr() {
        info!("Healer status server listening on {addr}");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("status server failed")?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ready_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no successful scan yet")
    }
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}

/// One row of the workload listing.
#[derive(Debug, Serialize)]
struct WorkloadStatus {
    workload: WorkloadKey,
    circuit: CircuitState,
    consecutive_failures: u32,
    last_action: Option<DateTime<Utc>>,
    reopen_at: Option<DateTime<Utc>>,
    backoff_secs: u64,
    in_flight: bool,
    /// Seconds until the next action could be granted, if gated
    eligible_in_secs: Option<i64>,
}

async fn workloads_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let now = Utc::now();
    let cooldown: Duration = state.store.policy().cooldown;

    let rows: Vec<WorkloadStatus> = state
        .store
        .snapshot_all()
        .into_iter()
        .map(|(workload, entry)| WorkloadStatus {
            eligible_in_secs: time_until_eligible(&entry, cooldown, now).map(|d| d.num_seconds()),
            workload,
            circuit: entry.circuit,
            consecutive_failures: entry.consecutive_failures,
            last_action: entry.last_action,
            reopen_at: entry.reopen_at,
            backoff_secs: entry.backoff.as_secs(),
            in_flight: entry.in_flight,
        })
        .collect();

    Json(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StorePolicy;
    use crate::types::Outcome;
    use axum::body::to_bytes;
    use axum::response::Response;

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState {
            store: CooldownStore::new(StorePolicy {
                cooldown: Duration::from_secs(300),
                failure_threshold: 3,
                backoff_base: Duration::from_secs(60),
                backoff_cap: Duration::from_secs(3600),
                max_idle_cycles: 100,
                max_entries: 100,
            }),
            metrics: Arc::new(HealerMetrics::new()),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_readiness_follows_flag() {
        let state = state();
        let response = ready_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.ready.store(true, Ordering::Relaxed);
        let response = ready_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_text() {
        let response = metrics_handler(State(state())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("healer_scans_total 0"));
    }

    #[tokio::test]
    async fn test_workloads_lists_store_entries() {
        let state = state();
        let key = WorkloadKey::Pod {
            namespace: "shop".to_string(),
            name: "debug".to_string(),
        };
        let now = Utc::now();
        let permit = state.store.try_acquire(&key, now).unwrap();
        state.store.report(permit, &Outcome::Success, now);

        let response = workloads_handler(State(state)).await.into_response();
        let rows: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["circuit"], "Closed");
        assert_eq!(rows[0]["workload"]["name"], "debug");
        assert!(rows[0]["eligible_in_secs"].as_i64().unwrap() > 0);
    }
}

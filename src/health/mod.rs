//! HTTP health endpoints.
//!
//! - `GET /health/live`     liveness: 200 whenever the process runs
//! - `GET /health/ready`    readiness: 200 iff `CanTrade()`, else 503
//! - `GET /health/status`   component-level summary
//! - `GET /health/detailed` full snapshot including metrics

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use crate::engine::EngineStatus;
use crate::metrics::MetricsRegistry;
use crate::reliability::ReliabilityGate;

#[derive(Clone)]
pub struct HealthState {
    pub gate: Arc<ReliabilityGate>,
    pub engine_status: Arc<EngineStatus>,
    pub metrics: Arc<MetricsRegistry>,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/health/status", get(status))
        .route("/health/detailed", get(detailed))
        .with_state(state)
}

async fn live(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "alive",
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let (ok, reason) = state.gate.can_trade();
    if ok {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "issues": [reason],
            })),
        )
    }
}

async fn status(State(state): State<HealthState>) -> Json<Value> {
    let (ok, reason) = state.gate.can_trade();
    let engine = state.engine_status.snapshot();
    Json(json!({
        "can_trade": ok,
        "reason": reason,
        "engine": engine,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
    }))
}

async fn detailed(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "reliability": state.gate.status_summary(),
        "engine": state.engine_status.snapshot(),
        "metrics": state.metrics.snapshot(),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Serve the health endpoints until the shutdown flag flips.
pub async fn serve(
    state: HealthState,
    host: &str,
    port: u16,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "health endpoints listening");

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !shutdown.load(Ordering::SeqCst) {
                sleep(Duration::from_millis(500)).await;
            }
        })
        .await;
    if let Err(e) = &result {
        error!(error = %e, "health server error");
    }
    result.map_err(Into::into)
}

//! Hub HTTP surface: error bus ingress and metric rollup export
//!
//! Agents publish [`ErrorReport`]s here (`ERROR_BUS_ENDPOINT`); operators and
//! external scrapers read rollups and probe history. Long-term metric
//! retention lives behind the configured observability endpoint, not here.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::alerts::ErrorBus;
use super::metrics::{CapabilityRollup, ReportHistory, RollupBoard, StampedReport};
use crate::domain_types::AgentName;
use crate::error::ErrorReport;

/// Shared state for the hub HTTP surface
#[derive(Clone)]
pub struct HubHttpState {
    bus: ErrorBus,
    history: Arc<ReportHistory>,
    rollups: Arc<RollupBoard>,
}

impl HubHttpState {
    /// Creates HTTP state over the hub's aggregates
    #[must_use]
    pub fn new(bus: ErrorBus, history: Arc<ReportHistory>, rollups: Arc<RollupBoard>) -> Self {
        Self {
            bus,
            history,
            rollups,
        }
    }
}

/// Rollup export document
#[derive(Debug, Serialize)]
pub struct MetricsExport {
    /// Per-capability rollups
    pub rollups: Vec<CapabilityRollup>,
}

/// Builds the hub router
#[must_use]
pub fn router(state: HubHttpState) -> Router {
    Router::new()
        .route("/errors", post(ingest_error))
        .route("/metrics", get(export_metrics))
        .route("/reports/{name}", get(agent_reports))
        .route("/health", get(self_health))
        .with_state(state)
}

async fn ingest_error(
    State(state): State<HubHttpState>,
    Json(report): Json<ErrorReport>,
) -> StatusCode {
    debug!(source = %report.source, kind = %report.kind, "error bus ingress");
    state.bus.publish(report);
    StatusCode::ACCEPTED
}

async fn export_metrics(State(state): State<HubHttpState>) -> Json<MetricsExport> {
    Json(MetricsExport {
        rollups: state.rollups.snapshot(),
    })
}

async fn agent_reports(State(state): State<HubHttpState>, Path(name): Path<String>) -> Response {
    let Ok(name) = AgentName::try_new(name) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let reports: Vec<StampedReport> = state.history.recent(&name);
    Json(reports).into_response()
}

async fn self_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Forwards rollups to the external observability endpoint on a cadence
///
/// The core does not persist long-term metrics; this push is best effort and
/// failures are logged, never propagated.
pub fn spawn_rollup_forwarder(
    endpoint: String,
    rollups: Arc<RollupBoard>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let export = MetricsExport {
                rollups: rollups.snapshot(),
            };
            if let Err(e) = client.post(&endpoint).json(&export).send().await {
                warn!(endpoint = %endpoint, error = %e, "rollup forward failed");
            }
        }
    })
}

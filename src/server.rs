//! Admin surface for the running orchestrator
//!
//! The CLI subcommands other than `start` talk to this: status rendering,
//! plan inspection, smoke testing, config reload, and cooperative fleet
//! shutdown. Read-only except for `/shutdown` and `/reload`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tracing::info;

use crate::domain_types::AgentName;
use crate::orchestrator::Orchestrator;

/// Builds the admin router over a running orchestrator
#[must_use]
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/status/{name}", get(status_one))
        .route("/plan", get(plan))
        .route("/smoke", post(smoke))
        .route("/reload", post(reload))
        .route("/shutdown", post(shutdown))
        .route("/validate", get(validate))
        .with_state(orchestrator)
}

async fn status(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    Json(orchestrator.status().await).into_response()
}

async fn status_one(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Response {
    let Ok(name) = AgentName::try_new(name) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match orchestrator
        .status()
        .await
        .into_iter()
        .find(|row| row.name == name)
    {
        Some(row) => Json(row).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn plan(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    Json(orchestrator.plan().clone()).into_response()
}

async fn smoke(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    let results = orchestrator.smoke_test().await;
    let all_passed = results.iter().all(|r| r.passed);
    let status = if all_passed {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(results)).into_response()
}

async fn reload(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    match orchestrator.reload().await {
        Ok(delta) if delta.is_applicable() => (StatusCode::OK, Json(delta)).into_response(),
        // Breaking deltas are rejected with the reasons in the body.
        Ok(delta) => (StatusCode::CONFLICT, Json(delta)).into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "kind": "config", "message": e.to_string() })),
        )
            .into_response(),
    }
}

async fn shutdown(State(orchestrator): State<Arc<Orchestrator>>) -> StatusCode {
    info!("fleet shutdown requested over admin surface");
    orchestrator.request_shutdown();
    StatusCode::ACCEPTED
}

async fn validate(State(orchestrator): State<Arc<Orchestrator>>) -> Response {
    Json(orchestrator.validate()).into_response()
}

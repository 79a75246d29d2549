//! HTTP facade over the registry actor
//!
//! Agents talk to this surface (`REGISTRY_ENDPOINT`); in-process components
//! use [`RegistryHandle`] directly. JSON over HTTP with the shared error
//! taxonomy in response bodies.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AgentRecord, Registration, RegistryError, RegistryHandle, RenewOutcome};
use crate::domain_types::{AgentName, CapabilityName, LeaseToken};
use crate::error::{Classified, ErrorKind};

/// Shared state for the registry HTTP surface
#[derive(Clone)]
pub struct RegistryHttpState {
    handle: RegistryHandle,
    lease_ttl_ms: u64,
}

impl RegistryHttpState {
    /// Creates HTTP state over a registry handle
    #[must_use]
    pub fn new(handle: RegistryHandle, lease_ttl_ms: u64) -> Self {
        Self {
            handle,
            lease_ttl_ms,
        }
    }
}

/// Successful registration response
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Lease token for renewal and deregistration
    pub token: LeaseToken,
    /// How long the lease lives without renewal
    pub lease_ttl_ms: u64,
}

/// Renewal request body
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaseRequest {
    /// Token returned at registration
    pub token: LeaseToken,
}

/// Renewal response body
#[derive(Debug, Serialize, Deserialize)]
pub struct RenewResponse {
    /// `ok` or `expired`
    pub status: RenewOutcome,
}

/// Error body carried on every non-2xx response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Taxonomy kind
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

fn error_response(error: &RegistryError) -> Response {
    let status = match error {
        RegistryError::UnknownAgent { .. } | RegistryError::UnknownLease { .. } => {
            StatusCode::NOT_FOUND
        }
        RegistryError::LeaseHeld { .. } => StatusCode::CONFLICT,
        RegistryError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::Snapshot { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            kind: error.kind(),
            message: error.to_string(),
        }),
    )
        .into_response()
}

/// Builds the registry router
#[must_use]
pub fn router(state: RegistryHttpState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/renew", post(renew))
        .route("/deregister", post(deregister))
        .route("/lookup/{name}", get(lookup))
        .route("/query/{capability}", get(query))
        .route("/records", get(records))
        .with_state(state)
}

async fn register(
    State(state): State<RegistryHttpState>,
    Json(registration): Json<Registration>,
) -> Response {
    debug!(agent = %registration.name, endpoint = %registration.endpoint, "registration received");
    match state.handle.register(registration).await {
        Ok(token) => Json(RegisterResponse {
            token,
            lease_ttl_ms: state.lease_ttl_ms,
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn renew(
    State(state): State<RegistryHttpState>,
    Json(request): Json<LeaseRequest>,
) -> Response {
    match state.handle.renew(request.token).await {
        Ok(status) => Json(RenewResponse { status }).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn deregister(
    State(state): State<RegistryHttpState>,
    Json(request): Json<LeaseRequest>,
) -> Response {
    match state.handle.deregister(request.token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn lookup(State(state): State<RegistryHttpState>, Path(name): Path<String>) -> Response {
    let Ok(name) = AgentName::try_new(name) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.handle.lookup(name).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn query(
    State(state): State<RegistryHttpState>,
    Path(capability): Path<String>,
) -> Response {
    let Ok(capability) = CapabilityName::try_new(capability) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.handle.query(capability).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn records(State(state): State<RegistryHttpState>) -> Response {
    match state.handle.list().await {
        Ok(records) => Json::<Vec<AgentRecord>>(records).into_response(),
        Err(e) => error_response(&e),
    }
}

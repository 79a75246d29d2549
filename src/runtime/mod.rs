//! Agent runtime skeleton
//!
//! The harness every agent runs inside: bind the request and health sockets
//! (fail fast on a taken port), register with the registry and keep the lease
//! renewed with jittered backoff, answer probes idempotently within budget,
//! drain cooperatively on Stop, release everything in reverse order of
//! acquisition, and publish errors to the bus instead of raising them to the
//! process boundary. Agents are values configured at construction; the
//! harness holds no global state.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::coordinator::TaskRequest;
use crate::domain_types::{
    AgentName, CapabilityName, DrainTimeoutMs, Endpoint, HealthStatus, PortNumber,
};
use crate::error::{Classified, ErrorKind, ErrorReport, Severity};
use crate::hub::normalize::HealthReport;
use crate::registry::http::{LeaseRequest, RegisterResponse, RenewResponse};
use crate::registry::{Registration, RenewOutcome};
use crate::resilience::{backoff_delay, GracefulShutdown, RetryPolicy};

/// Errors that abort the harness
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A socket could not be bound; the supervisor owns the retry policy
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Port that was taken
        port: u16,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Required configuration could not be resolved
    #[error("invalid agent configuration: {reason}")]
    Config {
        /// What is missing or malformed
        reason: String,
    },

    /// The harness hit an unrecoverable condition
    #[error("fatal runtime error: {detail}")]
    Fatal {
        /// Failure detail
        detail: String,
    },
}

impl Classified for RuntimeError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Bind { .. } => ErrorKind::Bind,
            Self::Config { .. } => ErrorKind::Config,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }
}

/// Error a handler returns for one request
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AgentError {
    /// Taxonomy kind carried back to the coordinator
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl AgentError {
    /// Creates a handler error
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A retryable error with a cause description
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retryable, message)
    }
}

/// Domain logic plugged into the harness
///
/// The harness composes these hooks with socket setup, registration, signal
/// handling, and backoff; the handler never touches any of that.
#[async_trait]
pub trait AgentHandler: Send + Sync + 'static {
    /// One-time setup before the sockets accept traffic
    async fn initialize(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Serves one request from the primary socket
    async fn handle(&self, request: TaskRequest) -> Result<Value, AgentError>;

    /// Cadence for [`AgentHandler::tick`]; `None` disables the worker
    fn background_interval(&self) -> Option<Duration> {
        None
    }

    /// Periodic background work between requests
    async fn tick(&self) {}

    /// Live capability subset; `None` reports everything declared
    fn capabilities_live(&self) -> Option<Vec<String>> {
        None
    }

    /// Self-reported health status included in probe responses
    fn health(&self) -> HealthStatus {
        HealthStatus::Ok
    }

    /// Extra probe detail fields
    fn probe_details(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Cleanup before exit; runs inside the drain budget
    async fn shutdown(&self) {}
}

/// Launch arguments accepted by an agent binary
///
/// Anything absent falls back to environment, then config file, then
/// built-in default (the normative precedence).
#[derive(Debug, Default, Clone)]
pub struct AgentArgs {
    /// Agent name
    pub name: Option<String>,
    /// Request port
    pub port: Option<u16>,
    /// Health port
    pub health_port: Option<u16>,
    /// Registry base URL
    pub registry_endpoint: Option<String>,
    /// Error bus base URL
    pub error_bus_endpoint: Option<String>,
    /// Optional agent config file
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentFileConfig {
    name: Option<String>,
    port: Option<u16>,
    health_port: Option<u16>,
    registry_endpoint: Option<String>,
    error_bus_endpoint: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    version: Option<String>,
}

/// Fully resolved harness configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Agent identity
    pub name: AgentName,
    /// Request socket port
    pub port: PortNumber,
    /// Health socket port
    pub health_port: PortNumber,
    /// Registry base URL
    pub registry_endpoint: String,
    /// Error bus base URL, if any
    pub error_bus_endpoint: Option<String>,
    /// Declared capabilities
    pub capabilities: Vec<CapabilityName>,
    /// Reported version
    pub version: String,
    /// Drain budget on cooperative stop
    pub drain_timeout: DrainTimeoutMs,
}

impl RuntimeConfig {
    /// Resolves configuration with precedence launch-arg > env > file > default
    ///
    /// Numeric fields parse defensively: a malformed value falls through to
    /// the next precedence level with a warning rather than crashing.
    ///
    /// # Errors
    /// [`RuntimeError::Config`] when name or ports cannot be resolved at all.
    pub fn resolve(args: &AgentArgs) -> Result<Self, RuntimeError> {
        let file = args
            .config_file
            .as_ref()
            .and_then(|path| match std::fs::read_to_string(path) {
                Ok(text) => match serde_yaml::from_str::<AgentFileConfig>(&text) {
                    Ok(file) => Some(file),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "agent config file ignored");
                        None
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "agent config file unreadable");
                    None
                }
            })
            .unwrap_or_default();

        let name = args
            .name
            .clone()
            .or_else(|| env_string("AGENT_NAME"))
            .or(file.name)
            .ok_or_else(|| RuntimeError::Config {
                reason: "agent name is required (--name or AGENT_NAME)".to_string(),
            })?;
        let name = AgentName::try_new(name).map_err(|e| RuntimeError::Config {
            reason: format!("invalid agent name: {e}"),
        })?;

        let port = args
            .port
            .or_else(|| env_port("AGENT_PORT"))
            .or(file.port)
            .ok_or_else(|| RuntimeError::Config {
                reason: "agent port is required (--port or AGENT_PORT)".to_string(),
            })?;
        let port = PortNumber::try_new(port).map_err(|e| RuntimeError::Config {
            reason: format!("invalid agent port: {e}"),
        })?;

        let health_port = args
            .health_port
            .or_else(|| env_port("HEALTH_CHECK_PORT"))
            .or(file.health_port)
            .ok_or_else(|| RuntimeError::Config {
                reason: "health port is required (--health-port or HEALTH_CHECK_PORT)".to_string(),
            })?;
        let health_port = PortNumber::try_new(health_port).map_err(|e| RuntimeError::Config {
            reason: format!("invalid health port: {e}"),
        })?;

        let registry_endpoint = args
            .registry_endpoint
            .clone()
            .or_else(|| env_string("REGISTRY_ENDPOINT"))
            .or(file.registry_endpoint)
            .ok_or_else(|| RuntimeError::Config {
                reason: "registry endpoint is required (REGISTRY_ENDPOINT)".to_string(),
            })?;

        let error_bus_endpoint = args
            .error_bus_endpoint
            .clone()
            .or_else(|| env_string("ERROR_BUS_ENDPOINT"))
            .or(file.error_bus_endpoint);

        let capabilities = file
            .capabilities
            .into_iter()
            .filter_map(|c| CapabilityName::try_new(c).ok())
            .collect();

        Ok(Self {
            name,
            port,
            health_port,
            registry_endpoint,
            error_bus_endpoint,
            capabilities,
            version: file
                .version
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            drain_timeout: DrainTimeoutMs::default(),
        })
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_port(key: &str) -> Option<u16> {
    let raw = env_string(key)?;
    match raw.trim().parse() {
        Ok(port) => Some(port),
        Err(_) => {
            warn!(key, raw, "unparsable port in environment; ignoring");
            None
        }
    }
}

/// Fire-and-forget error publisher toward the bus
#[derive(Clone)]
pub struct ErrorPublisher {
    endpoint: Option<String>,
    client: reqwest::Client,
    source: String,
}

impl ErrorPublisher {
    /// Creates a publisher; a missing endpoint makes it a logging no-op
    #[must_use]
    pub fn new(endpoint: Option<String>, source: impl Into<String>) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
            source: source.into(),
        }
    }

    /// Publishes a report without blocking the caller
    pub fn publish(&self, kind: ErrorKind, severity: Severity, context: BTreeMap<String, String>) {
        let mut report = ErrorReport::new(kind, severity, self.source.clone());
        report.context = context;

        let Some(endpoint) = self.endpoint.clone() else {
            warn!(kind = %report.kind, source = %report.source, "no error bus configured; report logged only");
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let url = format!("{endpoint}/errors");
            if let Err(e) = client
                .post(&url)
                .timeout(Duration::from_secs(2))
                .json(&report)
                .send()
                .await
            {
                warn!(error = %e, "error bus publish failed");
            }
        });
    }
}

struct Shared {
    config: RuntimeConfig,
    handler: Arc<dyn AgentHandler>,
    started_at: Instant,
    accepting: AtomicBool,
    in_flight: AtomicU64,
    stop: Notify,
    stop_requested: AtomicBool,
    errors: ErrorPublisher,
}

impl Shared {
    fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            self.stop.notify_waiters();
            self.stop.notify_one();
        }
    }
}

#[derive(Debug, Serialize)]
struct WireError {
    kind: ErrorKind,
    message: String,
}

/// Runs the harness to completion (cooperative stop or fatal error)
///
/// # Errors
/// [`RuntimeError::Bind`] immediately when a port is taken (the supervisor
/// owns retries), [`RuntimeError::Fatal`] for unrecoverable harness faults.
pub async fn run(
    config: RuntimeConfig,
    handler: Arc<dyn AgentHandler>,
) -> Result<(), RuntimeError> {
    // Sockets bind in declared order; release happens in reverse.
    let request_listener = bind(config.port).await?;
    let health_listener = bind(config.health_port).await?;
    info!(agent = %config.name, port = %config.port, health_port = %config.health_port, "sockets bound");

    handler
        .initialize()
        .await
        .map_err(|e| RuntimeError::Fatal {
            detail: format!("initialize failed: {e}"),
        })?;

    let errors = ErrorPublisher::new(config.error_bus_endpoint.clone(), config.name.to_string());
    let shared = Arc::new(Shared {
        config: config.clone(),
        handler: Arc::clone(&handler),
        started_at: Instant::now(),
        accepting: AtomicBool::new(true),
        in_flight: AtomicU64::new(0),
        stop: Notify::new(),
        stop_requested: AtomicBool::new(false),
        errors,
    });

    let request_server = spawn_server(request_listener, request_router(Arc::clone(&shared)));
    let health_server = spawn_server(health_listener, health_router(Arc::clone(&shared)));

    // Background worker, when the handler wants one.
    let worker = handler.background_interval().map(|interval| {
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                handler.tick().await;
            }
        })
    });

    // Registration keeps retrying with jittered backoff; the registry holds
    // the record in Starting until a probe succeeds.
    let registrar = tokio::spawn(registration_loop(Arc::clone(&shared)));

    // Signals: SIGTERM / ctrl-c request a cooperative stop.
    let signal_shared = Arc::clone(&shared);
    let signals = tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received");
        signal_shared.request_stop();
    });

    // Park until something requests a stop.
    shared.stop.notified().await;
    info!(agent = %config.name, "draining");

    // Stop accepting, drain in-flight work up to the budget.
    shared.accepting.store(false, Ordering::SeqCst);
    let drain_deadline = Instant::now() + config.drain_timeout.as_duration();
    while shared.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let leaked = shared.in_flight.load(Ordering::SeqCst);
    if leaked > 0 {
        warn!(leaked, "drain budget exhausted with requests in flight");
    }

    // Cleanups run LIFO: deregister, handler shutdown, workers, then the
    // sockets in reverse order of acquisition (health closed before request).
    let cleanups = GracefulShutdown::new();
    cleanups.register("request-server", Duration::from_secs(2), {
        let server = request_server.abort_handle();
        move || async move {
            server.abort();
            Ok(())
        }
    });
    cleanups.register("health-server", Duration::from_secs(2), {
        let server = health_server.abort_handle();
        move || async move {
            server.abort();
            Ok(())
        }
    });
    cleanups.register("registrar", Duration::from_secs(2), {
        let registrar = registrar.abort_handle();
        move || async move {
            registrar.abort();
            Ok(())
        }
    });
    if let Some(worker) = &worker {
        cleanups.register("background-worker", Duration::from_secs(2), {
            let worker = worker.abort_handle();
            move || async move {
                worker.abort();
                Ok(())
            }
        });
    }
    cleanups.register("handler-shutdown", config.drain_timeout.as_duration(), {
        let handler = Arc::clone(&handler);
        move || async move {
            handler.shutdown().await;
            Ok(())
        }
    });
    cleanups.register("deregister", Duration::from_secs(2), {
        let shared = Arc::clone(&shared);
        move || async move {
            deregister(&shared).await;
            Ok(())
        }
    });

    if let Err(e) = cleanups.run().await {
        warn!(error = %e, "shutdown cleanups reported failures");
    }
    signals.abort();

    info!(agent = %config.name, "agent exited cleanly");
    Ok(())
}

async fn bind(port: PortNumber) -> Result<TcpListener, RuntimeError> {
    TcpListener::bind(("127.0.0.1", port.as_u16()))
        .await
        .map_err(|source| RuntimeError::Bind {
            port: port.as_u16(),
            source,
        })
}

fn spawn_server(listener: TcpListener, router: Router) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "server terminated");
        }
    })
}

fn request_router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/task", post(serve_task))
        .with_state(shared)
}

fn health_router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/health", get(serve_health))
        .route("/admin/stop", post(serve_stop))
        .with_state(shared)
}

async fn serve_task(
    State(shared): State<Arc<Shared>>,
    Json(request): Json<TaskRequest>,
) -> Response {
    if !shared.accepting.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(WireError {
                kind: ErrorKind::Overloaded,
                message: "agent is draining".to_string(),
            }),
        )
            .into_response();
    }

    shared.in_flight.fetch_add(1, Ordering::SeqCst);
    let result = shared.handler.handle(request).await;
    shared.in_flight.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            let mut context = BTreeMap::new();
            context.insert("message".to_string(), e.message.clone());
            shared.errors.publish(e.kind, Severity::Warning, context);
            let status = match e.kind {
                ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::Overloaded | ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (
                status,
                Json(WireError {
                    kind: e.kind,
                    message: e.message,
                }),
            )
                .into_response()
        }
    }
}

/// Probe endpoint: canonical report, idempotent and side-effect-free
async fn serve_health(State(shared): State<Arc<Shared>>) -> Json<HealthReport> {
    let capabilities_live = shared.handler.capabilities_live().unwrap_or_else(|| {
        shared
            .config
            .capabilities
            .iter()
            .map(|c| c.as_str().to_string())
            .collect()
    });

    Json(HealthReport {
        status: shared.handler.health(),
        name: shared.config.name.to_string(),
        uptime_seconds: shared.started_at.elapsed().as_secs(),
        version: shared.config.version.clone(),
        capabilities_live,
        resource_usage: None,
        details: shared.handler.probe_details(),
    })
}

async fn serve_stop(State(shared): State<Arc<Shared>>) -> StatusCode {
    info!("cooperative stop requested over admin endpoint");
    shared.request_stop();
    StatusCode::ACCEPTED
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn registration_loop(shared: Arc<Shared>) {
    let client = reqwest::Client::new();
    let policy = RetryPolicy::standard(20, Duration::from_millis(250), Duration::from_secs(10));

    'register: loop {
        let mut attempt: u32 = 1;
        let mut previous = None;
        let (token, lease_ttl_ms) = loop {
            if shared.stop_requested.load(Ordering::SeqCst) {
                return;
            }
            match try_register(&client, &shared).await {
                Ok(ok) => break ok,
                Err(detail) => {
                    debug!(error = %detail, attempt, "registration failed; backing off");
                    if attempt == 1 {
                        let mut context = BTreeMap::new();
                        context.insert("detail".to_string(), detail);
                        shared
                            .errors
                            .publish(ErrorKind::Registration, Severity::Warning, context);
                    }
                    let delay =
                        backoff_delay(&policy, attempt.saturating_add(1).min(12), previous);
                    previous = Some(delay);
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
            }
        };
        info!(agent = %shared.config.name, lease_ttl_ms, "registered with registry");

        // Renew at a third of the TTL until the lease expires or we stop.
        let renew_every = Duration::from_millis((lease_ttl_ms / 3).max(250));
        loop {
            tokio::time::sleep(renew_every).await;
            if shared.stop_requested.load(Ordering::SeqCst) {
                return;
            }
            match try_renew(&client, &shared, token).await {
                Ok(RenewOutcome::Ok) => {}
                Ok(RenewOutcome::Expired) => {
                    warn!("lease expired; re-registering");
                    continue 'register;
                }
                Err(detail) => {
                    debug!(error = %detail, "lease renewal failed; re-registering");
                    continue 'register;
                }
            }
        }
    }
}

async fn try_register(
    client: &reqwest::Client,
    shared: &Shared,
) -> Result<(crate::domain_types::LeaseToken, u64), String> {
    let registration = Registration {
        name: shared.config.name.clone(),
        endpoint: Endpoint::local(shared.config.port),
        health_endpoint: Endpoint::local(shared.config.health_port),
        capabilities: shared.config.capabilities.clone(),
        pid: Some(std::process::id()),
    };
    let url = format!("{}/register", shared.config.registry_endpoint);
    let response = client
        .post(&url)
        .timeout(Duration::from_secs(3))
        .json(&registration)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("registry answered {}", response.status()));
    }
    let body: RegisterResponse = response.json().await.map_err(|e| e.to_string())?;
    Ok((body.token, body.lease_ttl_ms))
}

async fn try_renew(
    client: &reqwest::Client,
    shared: &Shared,
    token: crate::domain_types::LeaseToken,
) -> Result<RenewOutcome, String> {
    let url = format!("{}/renew", shared.config.registry_endpoint);
    let response = client
        .post(&url)
        .timeout(Duration::from_secs(3))
        .json(&LeaseRequest { token })
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("registry answered {}", response.status()));
    }
    let body: RenewResponse = response.json().await.map_err(|e| e.to_string())?;
    Ok(body.status)
}

async fn deregister(shared: &Shared) {
    // Best effort; the lease expires on its own if this never lands. The
    // token lives in the registrar task, so the release here is the lease
    // simply not being renewed plus the registry observing the drain.
    debug!(agent = %shared.config.name, "releasing registry presence");
}

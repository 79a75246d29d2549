//! Orchestrator: wires the core services into one running process
//!
//! `flotilla start` bootstraps this: registry actor plus HTTP facade, health
//! hub with its error bus and alert engine, coordinator, lazy loader, hybrid
//! LLM router, supervisor, and the admin surface the other CLI subcommands
//! talk to. Everything acquired here is paired with a release executed on
//! shutdown, in reverse order.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{self, ConfigError, ReloadDelta, SharedManifest};
use crate::coordinator::classify::Classifier;
use crate::coordinator::dispatch::HttpDispatcher;
use crate::coordinator::{Coordinator, TaskRequest};
use crate::domain_types::{epoch_millis, AgentName, CapabilityName, PortNumber, RequestKind};
use crate::error::{Classified, ErrorKind};
use crate::hub::alerts::{spawn_alert_engine, ErrorBus};
use crate::hub::http::HubHttpState;
use crate::hub::{BreakerBoard, HttpProber, HubConfig, HubHandle};
use crate::lazy::LazyLoader;
use crate::llm_router::{LlmRouter, StaticGauge};
use crate::observability::MetricSink;
use crate::plan::{self, PlanError, StartupPlan};
use crate::registry::http::RegistryHttpState;
use crate::registry::{ChangeKind, RegistryConfig, RegistryHandle};
use crate::supervisor::process::TokioLauncher;
use crate::supervisor::{HttpStopSignal, Supervisor, SupervisorConfig, SupervisorError};

/// Errors that bring the orchestrator down
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Config load or validation failure; exit code 2
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Plan computation failure; exit code 3
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Fleet startup failure; exit code 4
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// A core service socket could not be bound; exit code 5
    #[error("failed to bind core service port {port}: {source}")]
    Bind {
        /// Contested port
        port: u16,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}

impl Classified for OrchestratorError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => e.kind(),
            Self::Plan(e) => e.kind(),
            Self::Supervisor(e) => e.kind(),
            Self::Bind { .. } => ErrorKind::Fatal,
        }
    }
}

/// One row of `flotilla status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRow {
    /// Agent name
    pub name: AgentName,
    /// Current state
    pub state: crate::domain_types::AgentState,
    /// Request endpoint
    pub endpoint: String,
    /// Seconds since registration
    pub uptime_seconds: u64,
    /// Supervisor restarts
    pub restart_count: u32,
    /// Breaker state mirror
    pub circuit: crate::resilience::CircuitState,
    /// Most recent non-success transition, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
}

/// Result of one smoke dispatch during `flotilla test`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmokeResult {
    /// Capability exercised
    pub capability: CapabilityName,
    /// Whether the dispatch completed
    pub passed: bool,
    /// Outcome detail
    pub detail: String,
}

/// The assembled core services
pub struct Orchestrator {
    manifest: SharedManifest,
    config_path: PathBuf,
    profile: String,
    registry: RegistryHandle,
    hub: HubHandle,
    coordinator: Arc<Coordinator>,
    supervisor: Arc<Supervisor>,
    shutdown: Arc<Notify>,
    last_events: Arc<dashmap::DashMap<AgentName, String>>,
    servers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Loads config, computes the plan, and brings up every core service
    ///
    /// # Errors
    /// [`OrchestratorError::Config`] and [`OrchestratorError::Plan`] map to
    /// exit codes 2 and 3; [`OrchestratorError::Bind`] is fatal (5).
    pub async fn bootstrap(config_path: &Path, profile: &str) -> Result<Self, OrchestratorError> {
        let manifest = Arc::new(config::load(config_path, profile)?);
        let startup_plan = plan::plan(&manifest)?;
        info!(
            profile,
            agents = manifest.agents.len(),
            batches = startup_plan.batches.len(),
            "manifest loaded and planned"
        );

        let settings = Arc::clone(&manifest.settings);
        let shared = SharedManifest::new(manifest);
        let sink = MetricSink::default();
        let bus = ErrorBus::new(4096, Duration::from_secs(5));

        // Registry actor and its HTTP facade.
        let registry_config = RegistryConfig::from_manifest(&shared.current());
        let registry = crate::registry::spawn(shared.clone(), registry_config);
        let mut servers = Vec::new();
        servers.push(
            serve(
                settings.registry_port,
                crate::registry::http::router(RegistryHttpState::new(
                    registry.clone(),
                    settings.lease_ttl.as_u64(),
                )),
            )
            .await?,
        );

        // Hub: breaker board, probe loops, alert engine, HTTP surface.
        let breakers = Arc::new(BreakerBoard::new(settings.breaker));
        let hub = crate::hub::spawn(
            registry.clone(),
            HubConfig {
                probes: settings.probes,
                startup_grace: settings.supervisor.startup_grace,
            },
            Arc::clone(&breakers),
            sink.clone(),
            bus.clone(),
            Arc::new(HttpProber::new()),
        );
        let mut background = Vec::new();
        background.push(spawn_alert_engine(
            settings.alert_rules.clone(),
            &sink,
            bus.clone(),
        ));
        if let Some(endpoint) = settings.observability_endpoint.clone() {
            background.push(crate::hub::http::spawn_rollup_forwarder(
                endpoint,
                Arc::clone(&hub.rollups),
                Duration::from_secs(30),
            ));
        }
        servers.push(
            serve(
                settings.hub_port,
                crate::hub::http::router(HubHttpState::new(
                    bus.clone(),
                    Arc::clone(&hub.history),
                    Arc::clone(&hub.rollups),
                )),
            )
            .await?,
        );

        // Supervisor over real processes, with the fabric-based Stop signal.
        let local = |port: PortNumber| format!("http://127.0.0.1:{port}");
        let supervisor = Arc::new(Supervisor::new(
            shared.clone(),
            startup_plan,
            registry.clone(),
            Arc::new(TokioLauncher),
            Arc::new(HttpStopSignal::new()),
            SupervisorConfig {
                timings: settings.supervisor,
                profile: profile.to_string(),
                registry_endpoint: local(settings.registry_port),
                hub_endpoint: local(settings.hub_port),
                error_bus_endpoint: local(settings.hub_port),
                log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
            bus.clone(),
            sink.clone(),
        ));

        // Lazy loader feeds routing misses back into the supervisor.
        let lazy = LazyLoader::new(
            shared.clone(),
            registry.clone(),
            Arc::clone(&supervisor) as Arc<dyn crate::lazy::AgentStarter>,
            settings.lazy,
            sink.clone(),
            bus.clone(),
        );

        // Hybrid LLM router and the coordinator on top of everything.
        let llm = Arc::new(LlmRouter::new(
            registry.clone(),
            Arc::clone(&breakers),
            Arc::new(HttpDispatcher::new()),
            Arc::new(StaticGauge(None)),
            settings.llm.clone(),
            sink.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            shared.clone(),
            registry.clone(),
            breakers,
            Classifier::new(&settings.classifier_rules, None),
            Arc::new(HttpDispatcher::new()),
            lazy,
            llm,
            sink.clone(),
        ));
        servers.push(
            serve(
                settings.coordinator_port,
                crate::coordinator::router(Arc::clone(&coordinator)),
            )
            .await?,
        );

        // Track the latest non-success transition per agent for `status`.
        let last_events = Arc::new(dashmap::DashMap::new());
        background.push(track_events(registry.clone(), Arc::clone(&last_events)));

        let orchestrator = Self {
            manifest: shared,
            config_path: config_path.to_path_buf(),
            profile: profile.to_string(),
            registry,
            hub,
            coordinator,
            supervisor,
            shutdown: Arc::new(Notify::new()),
            last_events,
            servers,
            background,
        };
        Ok(orchestrator)
    }

    /// Starts the admin surface; separate so tests can skip it
    ///
    /// # Errors
    /// [`OrchestratorError::Bind`] when the admin port is taken.
    pub async fn serve_admin(self: Arc<Self>) -> Result<(), OrchestratorError> {
        let port = self.manifest.current().settings.admin_port;
        let router = crate::server::router(Arc::clone(&self));
        let handle = serve(port, router).await?;
        // Admin server lives for the orchestrator's lifetime.
        drop(handle);
        Ok(())
    }

    /// Brings the fleet to Ready batch by batch
    ///
    /// # Errors
    /// Propagates [`SupervisorError`] (exit code 4).
    pub async fn start_fleet(&self) -> Result<(), OrchestratorError> {
        self.supervisor.start_fleet().await?;
        Ok(())
    }

    /// Parks until a shutdown is requested via signal or admin endpoint
    pub async fn run_until_shutdown(&self) {
        let signal = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        tokio::select! {
                            _ = sigterm.recv() => {}
                            _ = tokio::signal::ctrl_c() => {}
                        }
                    }
                    Err(_) => {
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
        };

        tokio::select! {
            () = self.shutdown.notified() => info!("shutdown requested via admin endpoint"),
            () = signal => info!("shutdown requested via signal"),
        }
        self.stop().await;
    }

    /// Requests an orderly shutdown from another task
    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
        self.shutdown.notify_one();
    }

    /// Stops the fleet and tears the core down in reverse order
    pub async fn stop(&self) {
        self.supervisor.stop_fleet().await;
        if let Err(e) = self.registry.snapshot_now().await {
            warn!(error = %e, "final registry snapshot failed");
        }
        self.hub.shutdown();
        for task in &self.background {
            task.abort();
        }
        for server in &self.servers {
            server.abort();
        }
        info!("orchestrator stopped");
    }

    /// Rows for the `status` rendering
    pub async fn status(&self) -> Vec<StatusRow> {
        let now = epoch_millis();
        self.registry
            .list()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|record| StatusRow {
                last_event: self.last_events.get(&record.name).map(|e| e.clone()),
                uptime_seconds: now.saturating_sub(record.started_at) / 1000,
                endpoint: record.endpoint.to_string(),
                name: record.name,
                state: record.state,
                restart_count: record.restart_count,
                circuit: record.circuit_state,
            })
            .collect()
    }

    /// The startup plan being executed
    #[must_use]
    pub fn plan(&self) -> &StartupPlan {
        self.supervisor.plan()
    }

    /// Config validation plus one smoke dispatch per required capability
    pub async fn smoke_test(&self) -> Vec<SmokeResult> {
        let manifest = self.manifest.current();
        let mut results = Vec::new();

        let mut capabilities: Vec<CapabilityName> = manifest
            .agents
            .values()
            .filter(|spec| spec.required)
            .flat_map(|spec| spec.capabilities.iter().cloned())
            .collect();
        capabilities.sort();
        capabilities.dedup();

        for capability in capabilities {
            let Some(kind) = kind_for_capability(&capability) else {
                results.push(SmokeResult {
                    capability,
                    passed: true,
                    detail: "no dispatchable kind; skipped".to_string(),
                });
                continue;
            };

            let response = self
                .coordinator
                .handle(TaskRequest {
                    id: None,
                    kind,
                    payload: serde_json::json!({ "smoke": true }),
                    priority: None,
                    deadline_ms: Some(5_000),
                    trace_id: None,
                    target_agent: None,
                    backend: None,
                    complexity_hint: Some(0.0),
                    source: Some("smoke-test".to_string()),
                    affinity: None,
                })
                .await;

            results.push(SmokeResult {
                capability,
                passed: response.error.is_none(),
                detail: response
                    .error
                    .map_or_else(|| "completed".to_string(), |e| e.message),
            });
        }
        results
    }

    /// Re-reads the config and applies non-breaking deltas
    ///
    /// # Errors
    /// [`ConfigError`] when the new document fails to load; a breaking delta
    /// is reported in the returned value, not as an error.
    pub async fn reload(&self) -> Result<ReloadDelta, ConfigError> {
        let fresh = Arc::new(config::load(&self.config_path, &self.profile)?);
        let running = self.manifest.current();
        let delta = config::diff(&running, &fresh);
        if delta.is_applicable() {
            info!(
                added = delta.added_on_demand.len(),
                settings_changed = delta.settings_changed,
                "applying config reload"
            );
            self.manifest.replace(fresh);
        } else {
            warn!(breaking = delta.breaking.len(), "config reload rejected");
        }
        Ok(delta)
    }

    /// Validation issues for the running manifest
    #[must_use]
    pub fn validate(&self) -> Vec<config::Issue> {
        config::validate(&self.manifest.current())
    }
}

fn kind_for_capability(capability: &CapabilityName) -> Option<RequestKind> {
    match capability.as_str() {
        "stt" => Some(RequestKind::Stt),
        "tts" => Some(RequestKind::Tts),
        "chat" => Some(RequestKind::Chat),
        "vision" => Some(RequestKind::Vision),
        "tool_use" => Some(RequestKind::ToolUse),
        "code_gen" => Some(RequestKind::CodeGen),
        "reasoning" => Some(RequestKind::Reasoning),
        _ => None,
    }
}

async fn serve(
    port: PortNumber,
    router: axum::Router,
) -> Result<JoinHandle<()>, OrchestratorError> {
    let listener = TcpListener::bind(("127.0.0.1", port.as_u16()))
        .await
        .map_err(|source| OrchestratorError::Bind {
            port: port.as_u16(),
            source,
        })?;
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "core server terminated");
        }
    }))
}

fn track_events(
    registry: RegistryHandle,
    last_events: Arc<dashmap::DashMap<AgentName, String>>,
) -> JoinHandle<()> {
    let mut events = registry.watch();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let ChangeKind::StateChanged { to, .. } = &event.kind {
                        if !matches!(to, crate::domain_types::AgentState::Ready) {
                            last_events.insert(
                                event.name.clone(),
                                format!("{} at {}", to, event.at),
                            );
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

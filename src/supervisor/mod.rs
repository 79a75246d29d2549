//! Supervisor: launching, monitoring, restarting, and stopping the fleet
//!
//! Brings each startup batch to Ready before the next one starts, supervises
//! every launched process with its declared restart policy (full-jitter
//! exponential backoff, attempts reset after a stable run), and shuts the
//! fleet down in reverse topological order: cooperative Stop first, Kill
//! after the drain timeout. On_demand agents are never started eagerly; the
//! lazy loader enters through the same idempotent start path.

pub mod process;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AgentSpec, SharedManifest, SupervisorSettings};
use crate::domain_types::{AgentName, AgentState, AutoloadMode, RestartPolicyKind};
use crate::error::{Classified, ErrorKind, ErrorReport, Severity};
use crate::hub::alerts::ErrorBus;
use crate::lazy::{AgentStarter, StartError};
use crate::observability::{MetricEvent, MetricSink};
use crate::plan::StartupPlan;
use crate::registry::{AgentRecord, ChangeKind, RegistryHandle};
use crate::resilience::restart_delay;

use self::process::{ExitInfo, ProcessLauncher};

/// Errors that abort fleet startup
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A batch did not reach Ready within the startup grace
    #[error("batch {batch} startup timeout; still pending: {}", pending.iter().map(AgentName::as_str).collect::<Vec<_>>().join(", "))]
    StartupTimeout {
        /// Zero-based batch index
        batch: usize,
        /// Required agents not yet Ready
        pending: Vec<AgentName>,
    },

    /// A required agent reached terminal Failed during startup
    #[error("required agent '{name}' failed during startup")]
    AgentFailed {
        /// Failed agent
        name: AgentName,
    },

    /// The name is not part of the manifest
    #[error("agent '{name}' is unknown to the manifest")]
    UnknownAgent {
        /// Rejected name
        name: AgentName,
    },
}

impl Classified for SupervisorError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::StartupTimeout { .. } => ErrorKind::Timeout,
            Self::AgentFailed { .. } => ErrorKind::Fatal,
            Self::UnknownAgent { .. } => ErrorKind::Config,
        }
    }
}

/// Cooperative stop channel toward a running agent
///
/// The Stop signal travels over the fabric (an admin endpoint on the agent's
/// health server); SIGKILL is the escalation, owned by the process handle.
#[async_trait]
pub trait StopSignal: Send + Sync {
    /// Asks the agent to drain and exit; true when the signal was delivered
    async fn signal_stop(&self, record: &AgentRecord) -> bool;
}

/// Production stop signal: POST to the agent's admin endpoint
pub struct HttpStopSignal {
    client: reqwest::Client,
}

impl HttpStopSignal {
    /// Creates the HTTP stop signaler
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpStopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StopSignal for HttpStopSignal {
    async fn signal_stop(&self, record: &AgentRecord) -> bool {
        let url = format!("{}/admin/stop", record.health_endpoint.base_url());
        self.client
            .post(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

/// Environment handed to every launched agent
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Batch and restart timings
    pub timings: SupervisorSettings,
    /// Active profile, informational for agents
    pub profile: String,
    /// Registry base URL agents register against
    pub registry_endpoint: String,
    /// Hub base URL for metrics and health
    pub hub_endpoint: String,
    /// Error bus base URL
    pub error_bus_endpoint: String,
    /// Default log level for agents
    pub log_level: String,
}

enum Control {
    Stop,
}

struct ProcEntry {
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

/// The supervisor
pub struct Supervisor {
    manifest: SharedManifest,
    plan: StartupPlan,
    registry: RegistryHandle,
    launcher: Arc<dyn ProcessLauncher>,
    stop_signal: Arc<dyn StopSignal>,
    config: SupervisorConfig,
    procs: Arc<DashMap<AgentName, ProcEntry>>,
    bus: ErrorBus,
    sink: MetricSink,
}

impl Supervisor {
    /// Wires a supervisor over the plan and its collaborators
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        manifest: impl Into<SharedManifest>,
        plan: StartupPlan,
        registry: RegistryHandle,
        launcher: Arc<dyn ProcessLauncher>,
        stop_signal: Arc<dyn StopSignal>,
        config: SupervisorConfig,
        bus: ErrorBus,
        sink: MetricSink,
    ) -> Self {
        Self {
            manifest: manifest.into(),
            plan,
            registry,
            launcher,
            stop_signal,
            config,
            procs: Arc::new(DashMap::new()),
            bus,
            sink,
        }
    }

    /// The plan the supervisor is executing
    #[must_use]
    pub fn plan(&self) -> &StartupPlan {
        &self.plan
    }

    /// Brings each batch to Ready before starting the next
    ///
    /// # Errors
    /// [`SupervisorError::StartupTimeout`] when a required agent misses the
    /// grace window, [`SupervisorError::AgentFailed`] when one goes terminal.
    pub async fn start_fleet(&self) -> Result<(), SupervisorError> {
        info!(
            batches = self.plan.batches.len(),
            agents = self.plan.agent_count(),
            "starting fleet"
        );
        for (index, batch) in self.plan.batches.clone().iter().enumerate() {
            debug!(batch = index, size = batch.len(), "starting batch");
            for name in batch {
                self.ensure_running(name)?;
            }
            self.await_batch(index, batch).await?;
            info!(batch = index, "batch ready");
        }
        Ok(())
    }

    /// Starts one agent if it is not already supervised; idempotent
    ///
    /// # Errors
    /// [`SupervisorError::UnknownAgent`] for names outside the manifest.
    pub fn ensure_running(&self, name: &AgentName) -> Result<(), SupervisorError> {
        let spec = self
            .manifest
            .current()
            .get(name)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownAgent { name: name.clone() })?;

        if let Some(entry) = self.procs.get(name) {
            if !entry.task.is_finished() {
                debug!(agent = %name, "already supervised; start is a no-op");
                return Ok(());
            }
        }

        let (control_tx, control_rx) = mpsc::channel(4);
        let ctx = MonitorCtx {
            spec,
            registry: self.registry.clone(),
            launcher: Arc::clone(&self.launcher),
            stop_signal: Arc::clone(&self.stop_signal),
            config: self.config.clone(),
            bus: self.bus.clone(),
            sink: self.sink.clone(),
        };
        let task = tokio::spawn(supervise(ctx, control_rx));
        self.procs.insert(
            name.clone(),
            ProcEntry {
                control: control_tx,
                task,
            },
        );
        Ok(())
    }

    async fn await_batch(&self, index: usize, batch: &[AgentName]) -> Result<(), SupervisorError> {
        let grace = self.config.timings.startup_grace.as_duration();
        let soft = Duration::from_millis(self.config.timings.soft_timeout_ms);
        let started = Instant::now();

        loop {
            let mut required_pending = Vec::new();
            let mut optional_pending = Vec::new();

            let manifest = self.manifest.current();
            for name in batch {
                let required = manifest.get(name).is_some_and(|s| s.required);
                let state = self
                    .registry
                    .lookup(name.clone())
                    .await
                    .ok()
                    .flatten()
                    .map(|r| r.state);

                match state {
                    Some(AgentState::Ready) => {}
                    Some(AgentState::Failed) if required => {
                        return Err(SupervisorError::AgentFailed { name: name.clone() });
                    }
                    _ if required => required_pending.push(name.clone()),
                    _ => optional_pending.push(name.clone()),
                }
            }

            if required_pending.is_empty() {
                // Optional eager agents stop blocking after the soft timeout;
                // their absence is logged, not fatal.
                if optional_pending.is_empty() || started.elapsed() >= soft {
                    for name in optional_pending {
                        warn!(agent = %name, batch = index, "optional agent not ready; advancing");
                    }
                    return Ok(());
                }
            } else if started.elapsed() >= grace {
                return Err(SupervisorError::StartupTimeout {
                    batch: index,
                    pending: required_pending,
                });
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stops the whole fleet in reverse topological order
    ///
    /// On_demand agents (outside the plan) stop first, then each eager batch
    /// in reverse. Returns when every monitor has exited.
    pub async fn stop_fleet(&self) {
        info!("stopping fleet");

        let manifest = self.manifest.current();
        let on_demand: Vec<AgentName> = self
            .procs
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| {
                manifest
                    .get(name)
                    .is_some_and(|s| s.autoload == AutoloadMode::OnDemand)
            })
            .collect();
        for name in on_demand {
            self.stop_one(&name).await;
        }

        for batch in self.plan.shutdown_batches() {
            let stops = batch.iter().map(|name| self.stop_one(name));
            futures::future::join_all(stops).await;
        }
        info!("fleet stopped");
    }

    /// Stops one agent: cooperative Stop, drain wait, then Kill
    pub async fn stop_one(&self, name: &AgentName) {
        let Some((_, entry)) = self.procs.remove(name) else {
            return;
        };
        if entry.task.is_finished() {
            return;
        }
        let _ = entry.control.send(Control::Stop).await;

        // The monitor performs signal, drain, and kill; give it the drain
        // budget plus slack before abandoning it.
        let budget = self.config.timings.drain_timeout.as_duration() + Duration::from_secs(5);
        let task = entry.task;
        if tokio::time::timeout(budget, task).await.is_err() {
            warn!(agent = %name, "monitor did not stop in time; abandoning");
        }
    }

    /// Whether the supervisor currently supervises the agent
    #[must_use]
    pub fn is_supervised(&self, name: &AgentName) -> bool {
        self.procs
            .get(name)
            .is_some_and(|entry| !entry.task.is_finished())
    }
}

#[async_trait]
impl AgentStarter for Supervisor {
    async fn start_agent(&self, name: &AgentName) -> Result<(), StartError> {
        self.ensure_running(name).map_err(|e| StartError::Rejected {
            detail: e.to_string(),
        })
    }
}

struct MonitorCtx {
    spec: Arc<AgentSpec>,
    registry: RegistryHandle,
    launcher: Arc<dyn ProcessLauncher>,
    stop_signal: Arc<dyn StopSignal>,
    config: SupervisorConfig,
    bus: ErrorBus,
    sink: MetricSink,
}

impl MonitorCtx {
    fn agent_env(&self) -> Vec<(String, String)> {
        vec![
            ("AGENT_NAME".to_string(), self.spec.name.to_string()),
            ("AGENT_PORT".to_string(), self.spec.port.to_string()),
            (
                "HEALTH_CHECK_PORT".to_string(),
                self.spec.health_port.to_string(),
            ),
            (
                "REGISTRY_ENDPOINT".to_string(),
                self.config.registry_endpoint.clone(),
            ),
            (
                "OBS_HUB_ENDPOINT".to_string(),
                self.config.hub_endpoint.clone(),
            ),
            (
                "ERROR_BUS_ENDPOINT".to_string(),
                self.config.error_bus_endpoint.clone(),
            ),
            ("PROFILE".to_string(), self.config.profile.clone()),
            ("LOG_LEVEL".to_string(), self.config.log_level.clone()),
        ]
    }
}

enum RunEnd {
    Exited(ExitInfo),
    Unreachable,
    StopRequested,
}

async fn supervise(ctx: MonitorCtx, mut control: mpsc::Receiver<Control>) {
    let name = ctx.spec.name.clone();
    let policy = ctx.spec.restart_policy;
    let stable_window = Duration::from_millis(ctx.config.timings.stable_window_ms);
    let mut attempts: u32 = 0;

    loop {
        let spawn_started = Instant::now();
        let mut handle = match ctx.launcher.spawn(&ctx.spec, ctx.agent_env()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(agent = %name, error = %e, "launch failed");
                if !next_attempt(&ctx, &mut attempts, &name).await {
                    return;
                }
                continue;
            }
        };
        debug!(agent = %name, pid = ?handle.pid(), attempts, "agent process running");

        let mut events = ctx.registry.watch();
        let end = tokio::select! {
            exit = handle.wait() => RunEnd::Exited(exit),
            () = wait_unreachable(&mut events, &name) => RunEnd::Unreachable,
            control_msg = control.recv() => match control_msg {
                Some(Control::Stop) | None => RunEnd::StopRequested,
            },
        };

        match end {
            RunEnd::StopRequested => {
                stop_process(&ctx, &name, handle.as_mut()).await;
                return;
            }
            RunEnd::Unreachable => {
                warn!(agent = %name, "hub marked agent unreachable");
                handle.kill().await;
                if !restart_permitted(policy.policy, None) {
                    terminal_failure(&ctx, &name, "unreachable and restart_policy=never").await;
                    return;
                }
            }
            RunEnd::Exited(exit) => {
                info!(agent = %name, code = ?exit.code, "agent process exited");
                if !restart_permitted(policy.policy, Some(exit)) {
                    if exit.success {
                        let _ = ctx.registry.set_state(name.clone(), AgentState::Stopped).await;
                    } else {
                        terminal_failure(&ctx, &name, "exit with restart_policy=never").await;
                    }
                    return;
                }
            }
        }

        // A long stable run earns a clean slate before the next restart.
        if spawn_started.elapsed() >= stable_window {
            attempts = 0;
        }
        if !next_attempt(&ctx, &mut attempts, &name).await {
            return;
        }
    }
}

/// Applies backoff and the attempt budget; false means terminal failure
async fn next_attempt(ctx: &MonitorCtx, attempts: &mut u32, name: &AgentName) -> bool {
    *attempts += 1;
    let policy = ctx.spec.restart_policy;
    if *attempts >= policy.max_attempts.as_u32() {
        terminal_failure(ctx, name, "restart attempts exhausted").await;
        return false;
    }

    ctx.registry.note_restart(name.clone());
    ctx.sink.emit(
        MetricEvent::new("supervisor.restart", f64::from(*attempts))
            .with_tag("agent", name.as_str()),
    );

    let delay = restart_delay(
        policy.backoff_base.as_duration(),
        policy.backoff_max.as_duration(),
        *attempts,
    );
    debug!(agent = %name, attempts = *attempts, delay_ms = delay.as_millis() as u64, "restart backoff");
    tokio::time::sleep(delay).await;
    true
}

fn restart_permitted(policy: RestartPolicyKind, exit: Option<ExitInfo>) -> bool {
    match policy {
        RestartPolicyKind::Never => false,
        RestartPolicyKind::Always => true,
        // Unreachable (no exit info) counts as failure.
        RestartPolicyKind::OnFailure => exit.is_none_or(|e| !e.success),
    }
}

async fn terminal_failure(ctx: &MonitorCtx, name: &AgentName, reason: &str) {
    error!(agent = %name, reason, "agent terminally failed; fleet continues");
    let _ = ctx.registry.set_state(name.clone(), AgentState::Failed).await;
    ctx.bus.publish(
        ErrorReport::new(ErrorKind::Fatal, Severity::Critical, "supervisor")
            .with_context("agent", name.to_string())
            .with_context("reason", reason.to_string()),
    );
}

async fn stop_process(ctx: &MonitorCtx, name: &AgentName, handle: &mut dyn process::ProcessHandle) {
    let _ = ctx.registry.set_state(name.clone(), AgentState::Stopping).await;

    let signaled = match ctx.registry.lookup(name.clone()).await {
        Ok(Some(record)) => ctx.stop_signal.signal_stop(&record).await,
        _ => false,
    };

    if signaled {
        let drain = ctx.config.timings.drain_timeout.as_duration();
        if tokio::time::timeout(drain, handle.wait()).await.is_ok() {
            debug!(agent = %name, "agent drained and exited");
            let _ = ctx.registry.set_state(name.clone(), AgentState::Stopped).await;
            return;
        }
        warn!(agent = %name, "drain timeout; killing");
    }
    handle.kill().await;
    let _ = ctx.registry.set_state(name.clone(), AgentState::Stopped).await;
}

async fn wait_unreachable(
    events: &mut tokio::sync::broadcast::Receiver<crate::registry::ChangeEvent>,
    name: &AgentName,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if &event.name == name
                    && matches!(
                        event.kind,
                        ChangeKind::StateChanged {
                            to: AgentState::Unreachable,
                            ..
                        }
                    )
                {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                // Registry gone; pend forever and let process exit drive.
                std::future::pending::<()>().await;
            }
        }
    }
}

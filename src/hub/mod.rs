//! Health and observability hub
//!
//! Probes every non-terminal agent on a cadence driven by its state, runs the
//! per-target probe state machine (Starting, Ready, Degraded, Unreachable),
//! maintains the circuit breaker board consulted by the coordinator, and
//! aggregates metrics. State transitions for a single target are totally
//! ordered: one probe loop per agent owns that agent's machine and writes to
//! the registry through the documented state API only.

pub mod alerts;
pub mod http;
pub mod metrics;
pub mod normalize;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BreakerSettings, ProbeSettings};
use crate::domain_types::{AgentName, AgentState, LlmBackend, StartupGraceMs};
use crate::error::{Classified, ErrorKind, ErrorReport, Severity};
use crate::observability::{MetricEvent, MetricSink};
use crate::registry::{AgentRecord, ChangeKind, RegistryHandle};
use crate::resilience::CircuitBreaker;

use self::alerts::ErrorBus;
use self::metrics::{ReportHistory, RollupBoard, StampedReport};
use self::normalize::HealthReport;

/// Ways a probe can fail
#[derive(Debug, Error)]
pub enum ProbeFailure {
    /// No response within the probe budget
    #[error("probe exceeded budget of {budget_ms}ms")]
    Timeout {
        /// Budget that was exceeded
        budget_ms: u64,
    },

    /// Transport-level failure reaching the health endpoint
    #[error("probe transport error: {detail}")]
    Connect {
        /// Underlying failure detail
        detail: String,
    },

    /// The response could not be normalized into a report
    #[error("probe response malformed: {detail}")]
    Malformed {
        /// What was wrong
        detail: String,
    },
}

impl Classified for ProbeFailure {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::HealthTimeout,
            Self::Connect { .. } | Self::Malformed { .. } => ErrorKind::HealthError,
        }
    }
}

/// Liveness prober, behind a trait so tests can script outcomes
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probes the agent's health endpoint within the budget
    async fn probe(
        &self,
        record: &AgentRecord,
        budget: Duration,
    ) -> Result<HealthReport, ProbeFailure>;
}

/// Production prober speaking the unified HTTP health protocol
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    /// Creates a prober with a dedicated client
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        record: &AgentRecord,
        budget: Duration,
    ) -> Result<HealthReport, ProbeFailure> {
        let url = format!("{}/health", record.health_endpoint.base_url());
        let response = self
            .client
            .get(&url)
            .timeout(budget)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeFailure::Timeout {
                        budget_ms: budget.as_millis() as u64,
                    }
                } else {
                    ProbeFailure::Connect {
                        detail: e.to_string(),
                    }
                }
            })?;

        let value: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProbeFailure::Timeout {
                    budget_ms: budget.as_millis() as u64,
                }
            } else {
                ProbeFailure::Malformed {
                    detail: e.to_string(),
                }
            }
        })?;

        normalize::normalize(&value).ok_or_else(|| ProbeFailure::Malformed {
            detail: "no recognizable status field".to_string(),
        })
    }
}

/// Key identifying a circuit breaker target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetKey {
    /// A named agent
    Agent(AgentName),
    /// An LLM backend
    Backend(LlmBackend),
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(name) => write!(f, "agent:{name}"),
            Self::Backend(backend) => write!(f, "backend:{backend}"),
        }
    }
}

/// Board of per-target circuit breakers shared by hub, coordinator, and router
pub struct BreakerBoard {
    settings: BreakerSettings,
    breakers: DashMap<TargetKey, Arc<CircuitBreaker>>,
}

impl BreakerBoard {
    /// Creates a board that mints breakers with the given parameters
    #[must_use]
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for a target, created closed on first use
    #[must_use]
    pub fn breaker(&self, key: &TargetKey) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.settings)))
            .clone()
    }

    /// Current state of a target's breaker
    #[must_use]
    pub fn state(&self, key: &TargetKey) -> crate::resilience::CircuitState {
        self.breakers
            .get(key)
            .map_or(crate::resilience::CircuitState::Closed, |b| b.state())
    }
}

/// Hub configuration derived from global settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Probe cadence and thresholds
    pub probes: ProbeSettings,
    /// Startup grace before a Starting agent is Failed
    pub startup_grace: StartupGraceMs,
}

/// Handle to the running hub
pub struct HubHandle {
    /// Per-agent probe history
    pub history: Arc<ReportHistory>,
    /// Per-capability rollups
    pub rollups: Arc<RollupBoard>,
    /// Shared breaker board
    pub breakers: Arc<BreakerBoard>,
    /// The error bus the hub publishes to
    pub bus: ErrorBus,
    watcher: JoinHandle<()>,
}

impl HubHandle {
    /// Stops the hub's watcher and every probe loop it spawned
    pub fn shutdown(&self) {
        self.watcher.abort();
    }
}

impl Drop for HubHandle {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Spawns the hub: a watcher that starts one probe loop per live agent
#[must_use]
pub fn spawn(
    registry: RegistryHandle,
    config: HubConfig,
    breakers: Arc<BreakerBoard>,
    sink: MetricSink,
    bus: ErrorBus,
    prober: Arc<dyn Prober>,
) -> HubHandle {
    let history = Arc::new(ReportHistory::new(config.probes.ring_capacity));
    let rollups = Arc::new(RollupBoard::new());

    // Subscribe before returning so no registration can slip past the hub.
    let events = registry.watch();
    let watcher = tokio::spawn(watch_registry(
        events,
        registry,
        config,
        Arc::clone(&breakers),
        sink,
        bus.clone(),
        prober,
        Arc::clone(&history),
        Arc::clone(&rollups),
    ));

    HubHandle {
        history,
        rollups,
        breakers,
        bus,
        watcher,
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_registry(
    mut events: tokio::sync::broadcast::Receiver<crate::registry::ChangeEvent>,
    registry: RegistryHandle,
    config: HubConfig,
    breakers: Arc<BreakerBoard>,
    sink: MetricSink,
    bus: ErrorBus,
    prober: Arc<dyn Prober>,
    history: Arc<ReportHistory>,
    rollups: Arc<RollupBoard>,
) {
    let mut loops: HashMap<AgentName, JoinHandle<()>> = HashMap::new();
    info!("health hub watching registry");

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "hub lagged behind registry events");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        match &event.kind {
            ChangeKind::Registered { .. } => {
                // A fresh registration restarts the probe loop from Starting.
                if let Some(existing) = loops.remove(&event.name) {
                    existing.abort();
                }
                let task = tokio::spawn(probe_loop(ProbeLoop {
                    name: event.name.clone(),
                    registry: registry.clone(),
                    config: config.clone(),
                    breakers: Arc::clone(&breakers),
                    sink: sink.clone(),
                    bus: bus.clone(),
                    prober: Arc::clone(&prober),
                    history: Arc::clone(&history),
                    rollups: Arc::clone(&rollups),
                }));
                loops.insert(event.name.clone(), task);
            }
            ChangeKind::Deregistered => {
                if let Some(task) = loops.remove(&event.name) {
                    task.abort();
                }
            }
            ChangeKind::StateChanged { to, .. } if to.is_terminal() => {
                if let Some(task) = loops.remove(&event.name) {
                    task.abort();
                }
            }
            _ => {}
        }
    }

    for (_, task) in loops {
        task.abort();
    }
}

struct ProbeLoop {
    name: AgentName,
    registry: RegistryHandle,
    config: HubConfig,
    breakers: Arc<BreakerBoard>,
    sink: MetricSink,
    bus: ErrorBus,
    prober: Arc<dyn Prober>,
    history: Arc<ReportHistory>,
    rollups: Arc<RollupBoard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Ready,
    Degraded,
    Unreachable,
}

async fn probe_loop(ctx: ProbeLoop) {
    let probes = &ctx.config.probes;
    let key = TargetKey::Agent(ctx.name.clone());
    let started = Instant::now();

    let mut phase = Phase::Starting;
    let mut consecutive_failures: u32 = 0;
    let mut success_run: u32 = 0;

    debug!(agent = %ctx.name, "probe loop started");

    loop {
        let interval = match phase {
            Phase::Starting => probes.start_probe_interval.as_duration(),
            Phase::Ready | Phase::Degraded => probes.steady_interval.as_duration(),
            Phase::Unreachable => probes.backoff_interval.as_duration(),
        };
        tokio::time::sleep(interval).await;

        let Ok(Some(record)) = ctx.registry.lookup(ctx.name.clone()).await else {
            debug!(agent = %ctx.name, "record gone; probe loop exiting");
            return;
        };
        if record.state.is_terminal() || record.state == AgentState::Stopping {
            return;
        }

        let probe_started = Instant::now();
        let outcome = ctx
            .prober
            .probe(&record, probes.probe_budget.as_duration())
            .await;
        let latency_ms = probe_started.elapsed().as_millis() as u64;

        let status = match &outcome {
            Ok(report) => Some(report.status),
            Err(_) => None,
        };
        let healthy = matches!(
            status,
            Some(crate::domain_types::HealthStatus::Ok)
                | Some(crate::domain_types::HealthStatus::Degraded)
        );

        ctx.sink.emit(
            MetricEvent::new("hub.probe_latency_ms", latency_ms as f64)
                .with_tag("agent", ctx.name.as_str()),
        );
        ctx.sink.emit(
            MetricEvent::new("hub.probe_ok", if healthy { 1.0 } else { 0.0 })
                .with_tag("agent", ctx.name.as_str()),
        );
        ctx.history.push(
            &ctx.name,
            StampedReport {
                observed_at: crate::domain_types::epoch_millis(),
                latency_ms,
                report: outcome.as_ref().ok().cloned(),
            },
        );
        ctx.rollups.record(&record.capabilities, status, latency_ms);
        ctx.registry.probe_result(ctx.name.clone(), healthy);

        let next = match phase {
            Phase::Starting => {
                if healthy {
                    consecutive_failures = 0;
                    Phase::Ready
                } else if started.elapsed() >= ctx.config.startup_grace.as_duration() {
                    warn!(agent = %ctx.name, "startup grace exhausted; marking Failed");
                    let _ = ctx
                        .registry
                        .set_state(ctx.name.clone(), AgentState::Failed)
                        .await;
                    ctx.bus.publish(
                        ErrorReport::new(
                            outcome.as_ref().err().map_or(ErrorKind::HealthError, Classified::kind),
                            Severity::Error,
                            ctx.name.as_str(),
                        )
                        .with_context("phase", "starting")
                        .with_context("grace_ms", ctx.config.startup_grace.to_string()),
                    );
                    return;
                } else {
                    Phase::Starting
                }
            }
            Phase::Ready | Phase::Degraded => {
                if healthy {
                    if phase == Phase::Degraded {
                        success_run += 1;
                        if success_run >= probes.recovery_run {
                            consecutive_failures = 0;
                            success_run = 0;
                            Phase::Ready
                        } else {
                            Phase::Degraded
                        }
                    } else {
                        consecutive_failures = 0;
                        // A self-reported degraded status demotes immediately.
                        if status == Some(crate::domain_types::HealthStatus::Degraded) {
                            Phase::Degraded
                        } else {
                            Phase::Ready
                        }
                    }
                } else {
                    success_run = 0;
                    consecutive_failures += 1;
                    if consecutive_failures >= probes.unreachable_threshold {
                        Phase::Unreachable
                    } else if consecutive_failures >= probes.degrade_threshold {
                        Phase::Degraded
                    } else {
                        phase
                    }
                }
            }
            Phase::Unreachable => {
                if healthy {
                    consecutive_failures = 0;
                    success_run = 0;
                    Phase::Ready
                } else {
                    Phase::Unreachable
                }
            }
        };

        if next != phase {
            apply_phase(&ctx, &key, phase, next, &outcome).await;
            phase = next;
        }

        // Keep the record's breaker mirror current for status rendering.
        ctx.registry
            .set_circuit(ctx.name.clone(), ctx.breakers.state(&key));
    }
}

async fn apply_phase(
    ctx: &ProbeLoop,
    key: &TargetKey,
    from: Phase,
    to: Phase,
    outcome: &Result<HealthReport, ProbeFailure>,
) {
    debug!(agent = %ctx.name, ?from, ?to, "health phase transition");
    let state = match to {
        Phase::Starting => AgentState::Starting,
        Phase::Ready => AgentState::Ready,
        Phase::Degraded => AgentState::Degraded,
        Phase::Unreachable => AgentState::Unreachable,
    };
    let _ = ctx.registry.set_state(ctx.name.clone(), state).await;

    if to == Phase::Unreachable {
        // Unreachable targets are cut off immediately; half-open probes
        // follow the breaker's cooldown on the dispatch path.
        ctx.breakers.breaker(key).trip();
        let kind = outcome
            .as_ref()
            .err()
            .map_or(ErrorKind::HealthError, Classified::kind);
        ctx.bus.publish(
            ErrorReport::new(kind, Severity::Error, ctx.name.as_str())
                .with_context("transition", "unreachable"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_str, Manifest};
    use crate::domain_types::{ChannelCapacity, HealthStatus};
    use crate::registry::{Registration, RegistryConfig};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct ScriptedProber {
        healthy: Arc<AtomicBool>,
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(
            &self,
            record: &AgentRecord,
            _budget: Duration,
        ) -> Result<HealthReport, ProbeFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(HealthReport {
                    status: HealthStatus::Ok,
                    name: record.name.to_string(),
                    uptime_seconds: 1,
                    version: "0.1.0".to_string(),
                    capabilities_live: Vec::new(),
                    resource_usage: None,
                    details: Default::default(),
                })
            } else {
                Err(ProbeFailure::Timeout { budget_ms: 10 })
            }
        }
    }

    fn manifest() -> Arc<Manifest> {
        let doc = r#"
agents:
  probe-me:
    host_class: main_pc
    port: 7201
    health_port: 8201
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
profiles:
  core: {}
"#;
        Arc::new(load_str(doc, "core").unwrap())
    }

    fn fast_probes() -> ProbeSettings {
        ProbeSettings {
            start_probe_interval: crate::domain_types::ProbeIntervalMs::try_new(10).unwrap(),
            steady_interval: crate::domain_types::ProbeIntervalMs::try_new(10).unwrap(),
            backoff_interval: crate::domain_types::ProbeIntervalMs::try_new(20).unwrap(),
            probe_budget: crate::domain_types::ProbeBudgetMs::try_new(50).unwrap(),
            degrade_threshold: 2,
            unreachable_threshold: 4,
            recovery_run: 2,
            ring_capacity: crate::domain_types::RingCapacity::default(),
        }
    }

    async fn setup(
        healthy: bool,
    ) -> (
        RegistryHandle,
        HubHandle,
        Arc<AtomicBool>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let registry = crate::registry::spawn(
            manifest(),
            RegistryConfig {
                lease_ttl: Duration::from_secs(60),
                snapshot_interval: Duration::from_secs(3600),
                snapshot_path: dir.path().join("snap.json"),
                bootstrap_window: Duration::from_secs(20),
                channel_capacity: ChannelCapacity::default(),
            },
        );
        let flag = Arc::new(AtomicBool::new(healthy));
        let prober = Arc::new(ScriptedProber {
            healthy: Arc::clone(&flag),
            calls: Arc::new(AtomicU64::new(0)),
        });
        let breakers = Arc::new(BreakerBoard::new(BreakerSettings::default()));
        let hub = spawn(
            registry.clone(),
            HubConfig {
                probes: fast_probes(),
                startup_grace: StartupGraceMs::try_new(500).unwrap(),
            },
            breakers,
            MetricSink::new(256),
            ErrorBus::new(64, Duration::from_millis(1)),
            prober,
        );
        (registry, hub, flag, dir)
    }

    fn registration() -> Registration {
        Registration {
            name: AgentName::try_new("probe-me".to_string()).unwrap(),
            endpoint: crate::domain_types::Endpoint::local(
                crate::domain_types::PortNumber::try_new(7201).unwrap(),
            ),
            health_endpoint: crate::domain_types::Endpoint::local(
                crate::domain_types::PortNumber::try_new(8201).unwrap(),
            ),
            capabilities: vec![crate::domain_types::CapabilityName::try_new("stt".to_string())
                .unwrap()],
            pid: None,
        }
    }

    async fn wait_for_state(
        registry: &RegistryHandle,
        name: &AgentName,
        expected: AgentState,
        deadline: Duration,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if let Ok(Some(record)) = registry.lookup(name.clone()).await {
                if record.state == expected {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn first_ok_probe_promotes_to_ready() {
        let (registry, _hub, _flag, _dir) = setup(true).await;
        registry.register(registration()).await.unwrap();
        let name = AgentName::try_new("probe-me".to_string()).unwrap();
        assert!(wait_for_state(&registry, &name, AgentState::Ready, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn failures_walk_degraded_then_unreachable_and_trip_breaker() {
        let (registry, hub, flag, _dir) = setup(true).await;
        registry.register(registration()).await.unwrap();
        let name = AgentName::try_new("probe-me".to_string()).unwrap();
        assert!(wait_for_state(&registry, &name, AgentState::Ready, Duration::from_secs(2)).await);

        flag.store(false, Ordering::SeqCst);
        assert!(
            wait_for_state(&registry, &name, AgentState::Degraded, Duration::from_secs(2)).await
        );
        assert!(
            wait_for_state(&registry, &name, AgentState::Unreachable, Duration::from_secs(2))
                .await
        );
        let key = TargetKey::Agent(name);
        assert_eq!(
            hub.breakers.state(&key),
            crate::resilience::CircuitState::Open
        );
    }

    #[tokio::test]
    async fn unreachable_recovers_on_ok_probe() {
        let (registry, _hub, flag, _dir) = setup(false).await;
        registry.register(registration()).await.unwrap();
        let name = AgentName::try_new("probe-me".to_string()).unwrap();

        // Never healthy while starting: grace (500ms) expires into Failed,
        // unless we flip to healthy first. Flip after a couple of failures.
        tokio::time::sleep(Duration::from_millis(50)).await;
        flag.store(true, Ordering::SeqCst);
        assert!(wait_for_state(&registry, &name, AgentState::Ready, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn startup_grace_exhaustion_fails_agent() {
        let (registry, _hub, _flag, _dir) = setup(false).await;
        registry.register(registration()).await.unwrap();
        let name = AgentName::try_new("probe-me".to_string()).unwrap();
        assert!(wait_for_state(&registry, &name, AgentState::Failed, Duration::from_secs(3)).await);
    }
}

//! Unified configuration loader and profile resolver
//!
//! Parses the human-authored YAML document into a validated [`Manifest`]:
//! global settings plus the effective set of [`AgentSpec`]s for the selected
//! deployment profile. Unknown fields are rejected, ports are checked against
//! the advisory ranges, and every reference (dependency, profile capability,
//! override target) must resolve at load time so nothing fails at start time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::domain_types::{
    AgentName, AutoloadMode, BackoffBaseMs, BackoffMaxMs, BulkheadWidth, CapabilityName,
    CooldownMs, CpuWeight, DrainTimeoutMs, FailureThreshold, HalfOpenProbes, HostClass,
    LeaseTtlMs, MaxAttempts, PortNumber, ProbeBudgetMs, ProbeIntervalMs, QueueDepth,
    RestartPolicyKind, RingCapacity, StartupGraceMs, StartupPriority, VramMb, WindowMs,
};
use crate::error::{Classified, ErrorKind};

/// Errors raised while loading or resolving the unified configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read
    #[error("failed to read config at {path}: {source}")]
    Io {
        /// Path that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The document is not well-formed YAML or violates the schema
    #[error("malformed config document: {source}")]
    Parse {
        /// Underlying deserialization error
        #[from]
        source: serde_yaml::Error,
    },

    /// A declared field value failed domain validation
    #[error("invalid value for {field} on agent '{agent}': {reason}")]
    InvalidValue {
        /// Agent the field belongs to
        agent: String,
        /// Offending field
        field: &'static str,
        /// Validation failure detail
        reason: String,
    },

    /// Two specs on the same host claim the same port
    #[error("duplicate port {port} on host {host}: declared by '{first}' and '{second}'")]
    DuplicatePort {
        /// Host class with the collision
        host: HostClass,
        /// Colliding port
        port: u16,
        /// First claimant
        first: AgentName,
        /// Second claimant
        second: AgentName,
    },

    /// A dependency names an agent that does not exist in the effective set
    #[error("agent '{agent}' depends on unknown agent '{dependency}'")]
    UnknownDependency {
        /// Dependent agent
        agent: AgentName,
        /// Missing dependency name
        dependency: String,
    },

    /// The requested profile is not declared in the document
    #[error("unknown profile '{profile}' (declared: {declared:?})")]
    UnknownProfile {
        /// Requested selector
        profile: String,
        /// Profiles present in the document
        declared: Vec<String>,
    },

    /// A port falls outside the configured advisory range
    #[error("port {port} of agent '{agent}' outside the {role} range {min}-{max}")]
    PortOutOfRange {
        /// Offending agent
        agent: AgentName,
        /// Declared port
        port: u16,
        /// "agent" or "health"
        role: &'static str,
        /// Range lower bound
        min: u16,
        /// Range upper bound
        max: u16,
    },

    /// A profile lists a capability no agent declares
    #[error("profile '{profile}' lists capability '{capability}' that no agent declares")]
    UndeclaredCapability {
        /// Profile with the dangling reference
        profile: String,
        /// Undeclared capability
        capability: String,
    },

    /// A profile tries to force an on_demand spec to required
    #[error("profile '{profile}' may not override required=true for on_demand agent '{agent}'")]
    OnDemandRequiredOverride {
        /// Offending profile
        profile: String,
        /// Protected agent
        agent: AgentName,
    },

    /// An eager agent depends on an on_demand one
    #[error("eager agent '{agent}' may not depend on on_demand agent '{dependency}'")]
    EagerDependsOnDemand {
        /// Dependent eager agent
        agent: AgentName,
        /// On-demand dependency
        dependency: AgentName,
    },

    /// An author marked a spec both required and on_demand
    #[error("agent '{agent}' cannot be both required and on_demand")]
    RequiredOnDemand {
        /// Contradictory spec
        agent: AgentName,
    },

    /// A dependency of an included agent was filtered out by the profile
    #[error("agent '{agent}' depends on '{dependency}', which profile '{profile}' excludes")]
    DependencyExcluded {
        /// Dependent agent
        agent: AgentName,
        /// Excluded dependency
        dependency: AgentName,
        /// Active profile
        profile: String,
    },
}

impl Classified for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Health probe protocol spoken by an agent
///
/// `unified_v1` is required of new agents; the aliases tolerate legacy
/// spellings during migration, all normalized to the unified protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthProtocol {
    /// Canonical JSON report protocol
    #[default]
    #[serde(alias = "unified", alias = "v1", alias = "legacy_http")]
    UnifiedV1,
}

/// Inclusive port range used for advisory validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRange {
    /// Lower bound, inclusive
    pub min: u16,
    /// Upper bound, inclusive
    pub max: u16,
}

impl PortRange {
    /// Whether the port falls in the range
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

/// Restart policy of a supervised agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// When restarts are permitted
    pub policy: RestartPolicyKind,
    /// Attempts before terminal Failed
    pub max_attempts: MaxAttempts,
    /// First backoff delay
    pub backoff_base: BackoffBaseMs,
    /// Backoff ceiling
    pub backoff_max: BackoffMaxMs,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            policy: RestartPolicyKind::OnFailure,
            max_attempts: MaxAttempts::default(),
            backoff_base: BackoffBaseMs::default(),
            backoff_max: BackoffMaxMs::default(),
        }
    }
}

/// Optional scheduling hints carried by a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceHints {
    /// VRAM the agent expects to hold
    pub vram_mb: Option<VramMb>,
    /// Relative CPU weight
    pub cpu_weight: Option<CpuWeight>,
}

/// Validated, immutable declaration of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique agent name
    pub name: AgentName,
    /// Host affinity class
    pub host_class: HostClass,
    /// Primary request port
    pub port: PortNumber,
    /// Health probe port
    pub health_port: PortNumber,
    /// Executable plus arguments
    pub launch_cmd: Vec<String>,
    /// Whether batch advancement blocks on this agent
    pub required: bool,
    /// Eager or on-demand start
    pub autoload: AutoloadMode,
    /// Names this agent depends on, in declared order
    pub dependencies: Vec<AgentName>,
    /// Capability tags served
    pub capabilities: Vec<CapabilityName>,
    /// Optional resource hints
    pub resource_hints: ResourceHints,
    /// Restart policy
    pub restart_policy: RestartPolicy,
    /// Probe protocol
    pub health_protocol: HealthProtocol,
    /// Batch tie-break priority
    pub startup_priority: StartupPriority,
}

impl AgentSpec {
    /// Whether the spec is started by the supervisor at boot
    #[must_use]
    pub fn is_eager(&self) -> bool {
        self.autoload == AutoloadMode::Eager
    }

    /// Whether the spec declares the given capability
    #[must_use]
    pub fn serves(&self, capability: &CapabilityName) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Probe cadence and threshold settings consumed by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Cadence while an agent is Starting
    pub start_probe_interval: ProbeIntervalMs,
    /// Cadence while Ready or Degraded
    pub steady_interval: ProbeIntervalMs,
    /// Reduced cadence while Unreachable
    pub backoff_interval: ProbeIntervalMs,
    /// Round-trip budget per probe
    pub probe_budget: ProbeBudgetMs,
    /// Consecutive failures before Degraded
    pub degrade_threshold: u32,
    /// Consecutive failures before Unreachable
    pub unreachable_threshold: u32,
    /// Consecutive successes to recover from Degraded
    pub recovery_run: u32,
    /// Ring buffer size for report history
    pub ring_capacity: RingCapacity,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            start_probe_interval: ProbeIntervalMs::try_new(500).unwrap_or_default(),
            steady_interval: ProbeIntervalMs::default(),
            backoff_interval: ProbeIntervalMs::try_new(15_000).unwrap_or_default(),
            probe_budget: ProbeBudgetMs::default(),
            degrade_threshold: 2,
            unreachable_threshold: 5,
            recovery_run: 3,
            ring_capacity: RingCapacity::default(),
        }
    }
}

/// Supervisor timing settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Time for a starting agent to reach Ready
    pub startup_grace: StartupGraceMs,
    /// How long optional eager agents may hold a batch
    pub soft_timeout_ms: u64,
    /// Drain budget on cooperative stop
    pub drain_timeout: DrainTimeoutMs,
    /// Sustained-Ready window that resets restart attempts
    pub stable_window_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_grace: StartupGraceMs::default(),
            soft_timeout_ms: 10_000,
            drain_timeout: DrainTimeoutMs::default(),
            stable_window_ms: 60_000,
        }
    }
}

/// Coordinator admission and dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Token bucket capacity per source
    pub rate_limit_capacity: f64,
    /// Token refill per second per source
    pub rate_limit_refill_per_sec: f64,
    /// Dispatch attempts per request
    pub max_attempts: MaxAttempts,
    /// First retry backoff
    pub base_backoff: BackoffBaseMs,
    /// Retry backoff ceiling
    pub max_backoff: BackoffMaxMs,
    /// Slice of the deadline reserved for response handling
    pub deadline_reserve_ms: u64,
    /// Deadline applied when a request declares none
    pub default_deadline_ms: u64,
    /// How long a routing miss waits for a lazy load
    pub lazy_wait_ms: u64,
    /// Concurrent in-flight limit per target
    pub bulkhead_width: BulkheadWidth,
    /// Queue allowed behind a full bulkhead
    pub queue_depth: QueueDepth,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            rate_limit_capacity: 50.0,
            rate_limit_refill_per_sec: 25.0,
            max_attempts: MaxAttempts::default(),
            base_backoff: BackoffBaseMs::try_new(200).unwrap_or_default(),
            max_backoff: BackoffMaxMs::try_new(2_000).unwrap_or_default(),
            deadline_reserve_ms: 250,
            default_deadline_ms: 10_000,
            lazy_wait_ms: 30_000,
            bulkhead_width: BulkheadWidth::default(),
            queue_depth: QueueDepth::default(),
        }
    }
}

/// Circuit breaker parameters shared by hub, coordinator, and LLM router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BreakerSettings {
    /// Failures within the window that trip the circuit
    pub failure_threshold: FailureThreshold,
    /// Sliding failure-count window
    pub window: WindowMs,
    /// Open-state cooldown before half-open probes
    pub cooldown: CooldownMs,
    /// Concurrent half-open probe budget
    pub half_open_probes: HalfOpenProbes,
}

/// Lazy loader settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazySettings {
    /// End-to-end SLA for bringing a dormant agent to Ready
    pub load_sla_ms: u64,
    /// Start attempts before the name is marked cold
    pub max_lazy_attempts: MaxAttempts,
    /// How long a cold name fails fast
    pub cold_duration_ms: u64,
}

impl Default for LazySettings {
    fn default() -> Self {
        Self {
            load_sla_ms: 30_000,
            max_lazy_attempts: MaxAttempts::default(),
            cold_duration_ms: 60_000,
        }
    }
}

/// Hybrid LLM router settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Complexity score above which remote is preferred
    pub heavy_threshold: f64,
    /// Capability resolving the local backend
    pub local_capability: String,
    /// Capability of the smaller-quantized local variant, if declared
    pub quantized_capability: Option<String>,
    /// Remote API endpoint; absent means no remote backend
    pub remote_endpoint: Option<String>,
    /// VRAM needed to serve a request locally
    pub vram_required_mb: VramMb,
    /// Latency budget before the router falls back
    pub latency_budget_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            heavy_threshold: 0.6,
            local_capability: "llm.local".to_string(),
            quantized_capability: None,
            remote_endpoint: None,
            vram_required_mb: VramMb::try_new(4096).unwrap_or_default(),
            latency_budget_ms: 15_000,
        }
    }
}

/// One keyword classification rule: any keyword hit maps to the capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeywordRule {
    /// Target capability
    pub capability: String,
    /// Case-insensitive keywords
    pub keywords: Vec<String>,
}

/// One declarative alert rule evaluated by the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertRule {
    /// Rule name carried in emitted alerts
    pub name: String,
    /// Restrict to samples carrying this `agent` tag; absent matches all
    #[serde(default)]
    pub target: Option<String>,
    /// Metric name the rule watches
    pub metric: String,
    /// Alert fires when samples stay at or above this value
    pub threshold: f64,
    /// How long the threshold must hold before firing
    pub for_ms: u64,
}

/// Global settings shared by every core component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Advisory range for request ports
    pub agent_port_range: PortRange,
    /// Advisory range for health ports
    pub health_port_range: PortRange,
    /// Registry bind port
    pub registry_port: PortNumber,
    /// Coordinator bind port
    pub coordinator_port: PortNumber,
    /// Hub (observability + error bus) bind port
    pub hub_port: PortNumber,
    /// Supervisor admin surface bind port
    pub admin_port: PortNumber,
    /// Registry lease TTL
    pub lease_ttl: LeaseTtlMs,
    /// Registry snapshot file path
    pub snapshot_path: PathBuf,
    /// Interval between registry snapshots
    pub snapshot_interval_ms: u64,
    /// Re-registration window honored after a registry cold start
    pub bootstrap_window_ms: u64,
    /// Probe cadence and thresholds
    pub probes: ProbeSettings,
    /// Supervisor timings
    pub supervisor: SupervisorSettings,
    /// Coordinator admission and dispatch settings
    pub coordinator: CoordinatorSettings,
    /// Shared circuit breaker parameters
    pub breaker: BreakerSettings,
    /// Lazy loader settings
    pub lazy: LazySettings,
    /// Hybrid LLM router settings
    pub llm: LlmSettings,
    /// External scrape endpoint rollups are forwarded to, if any
    pub observability_endpoint: Option<String>,
    /// Keyword classification rules
    pub classifier_rules: Vec<KeywordRule>,
    /// Declarative alert rules evaluated by the hub
    pub alert_rules: Vec<AlertRule>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            agent_port_range: PortRange {
                min: 7200,
                max: 7999,
            },
            health_port_range: PortRange {
                min: 8200,
                max: 8999,
            },
            registry_port: PortNumber::try_new(7391).expect("default port is valid"),
            coordinator_port: PortNumber::try_new(7392).expect("default port is valid"),
            hub_port: PortNumber::try_new(8391).expect("default port is valid"),
            admin_port: PortNumber::try_new(7393).expect("default port is valid"),
            lease_ttl: LeaseTtlMs::default(),
            snapshot_path: PathBuf::from("flotilla-registry.snapshot.json"),
            snapshot_interval_ms: 10_000,
            bootstrap_window_ms: 20_000,
            probes: ProbeSettings::default(),
            supervisor: SupervisorSettings::default(),
            coordinator: CoordinatorSettings::default(),
            breaker: BreakerSettings::default(),
            lazy: LazySettings::default(),
            llm: LlmSettings::default(),
            observability_endpoint: None,
            classifier_rules: Vec::new(),
            alert_rules: Vec::new(),
        }
    }
}

/// The validated, in-memory form of the unified config
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Profile the manifest was resolved for
    pub profile: String,
    /// Global settings
    pub settings: Arc<GlobalSettings>,
    /// Effective agent specs, keyed by name
    pub agents: BTreeMap<AgentName, Arc<AgentSpec>>,
}

impl Manifest {
    /// Looks up a spec by name
    #[must_use]
    pub fn get(&self, name: &AgentName) -> Option<&Arc<AgentSpec>> {
        self.agents.get(name)
    }

    /// Specs started eagerly by the supervisor
    pub fn eager_specs(&self) -> impl Iterator<Item = &Arc<AgentSpec>> {
        self.agents.values().filter(|s| s.is_eager())
    }

    /// Specs deferred to the lazy loader
    pub fn on_demand_specs(&self) -> impl Iterator<Item = &Arc<AgentSpec>> {
        self.agents.values().filter(|s| !s.is_eager())
    }

    /// Capability tag to serving agents, built from declared capabilities
    ///
    /// Routing is a table lookup against this index; there is no dynamic
    /// dispatch by name anywhere in the core.
    #[must_use]
    pub fn capability_index(&self) -> BTreeMap<CapabilityName, Vec<AgentName>> {
        let mut index: BTreeMap<CapabilityName, Vec<AgentName>> = BTreeMap::new();
        for spec in self.agents.values() {
            for capability in &spec.capabilities {
                index
                    .entry(capability.clone())
                    .or_default()
                    .push(spec.name.clone());
            }
        }
        index
    }

    /// Names of on_demand agents serving the capability
    #[must_use]
    pub fn on_demand_for(&self, capability: &CapabilityName) -> Vec<AgentName> {
        self.agents
            .values()
            .filter(|s| !s.is_eager() && s.serves(capability))
            .map(|s| s.name.clone())
            .collect()
    }
}

/// Hot-swappable handle to the running manifest
///
/// `reload-config` replaces the inner manifest for non-breaking deltas;
/// components read [`SharedManifest::current`] at each operation so new
/// on_demand specs and threshold changes take effect without a restart.
#[derive(Debug, Clone)]
pub struct SharedManifest {
    inner: Arc<std::sync::RwLock<Arc<Manifest>>>,
}

impl SharedManifest {
    /// Wraps a manifest for shared access
    #[must_use]
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self {
            inner: Arc::new(std::sync::RwLock::new(manifest)),
        }
    }

    /// The manifest as of this instant
    #[must_use]
    pub fn current(&self) -> Arc<Manifest> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replaces the manifest after an applicable reload
    pub fn replace(&self, manifest: Arc<Manifest>) {
        *self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = manifest;
    }
}

impl From<Arc<Manifest>> for SharedManifest {
    fn from(manifest: Arc<Manifest>) -> Self {
        Self::new(manifest)
    }
}

impl From<Manifest> for SharedManifest {
    fn from(manifest: Manifest) -> Self {
        Self::new(Arc::new(manifest))
    }
}

/// Severity of a validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// Advisory only
    Warning,
    /// Manifest is unusable
    Error,
}

/// One validation finding from [`validate`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Finding severity
    pub severity: IssueSeverity,
    /// Human-readable description
    pub message: String,
}

impl Issue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw document shapes (exact YAML schema; unknown fields rejected)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    global_settings: RawGlobalSettings,
    agents: BTreeMap<String, RawAgentSpec>,
    #[serde(default)]
    profiles: BTreeMap<String, RawProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGlobalSettings {
    agent_port_range: Option<PortRange>,
    health_port_range: Option<PortRange>,
    registry_port: Option<u16>,
    coordinator_port: Option<u16>,
    hub_port: Option<u16>,
    admin_port: Option<u16>,
    lease_ttl_ms: Option<u64>,
    snapshot_path: Option<PathBuf>,
    snapshot_interval_ms: Option<u64>,
    bootstrap_window_ms: Option<u64>,
    #[serde(default)]
    probes: RawProbeSettings,
    #[serde(default)]
    supervisor: RawSupervisorSettings,
    #[serde(default)]
    coordinator: RawCoordinatorSettings,
    #[serde(default)]
    breaker: RawBreakerSettings,
    #[serde(default)]
    lazy: RawLazySettings,
    #[serde(default)]
    llm: RawLlmSettings,
    observability_endpoint: Option<String>,
    #[serde(default)]
    classifier_rules: Vec<KeywordRule>,
    #[serde(default)]
    alert_rules: Vec<AlertRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProbeSettings {
    start_probe_interval_ms: Option<u64>,
    steady_interval_ms: Option<u64>,
    backoff_interval_ms: Option<u64>,
    probe_budget_ms: Option<u64>,
    degrade_threshold: Option<u32>,
    unreachable_threshold: Option<u32>,
    recovery_run: Option<u32>,
    ring_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSupervisorSettings {
    startup_grace_ms: Option<u64>,
    soft_timeout_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    stable_window_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCoordinatorSettings {
    rate_limit_capacity: Option<f64>,
    rate_limit_refill_per_sec: Option<f64>,
    max_attempts: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    deadline_reserve_ms: Option<u64>,
    default_deadline_ms: Option<u64>,
    lazy_wait_ms: Option<u64>,
    bulkhead_width: Option<usize>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBreakerSettings {
    failure_threshold: Option<u32>,
    window_ms: Option<u64>,
    cooldown_ms: Option<u64>,
    half_open_probes: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLazySettings {
    load_sla_ms: Option<u64>,
    max_lazy_attempts: Option<u32>,
    cold_duration_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLlmSettings {
    heavy_threshold: Option<f64>,
    local_capability: Option<String>,
    quantized_capability: Option<String>,
    remote_endpoint: Option<String>,
    vram_required_mb: Option<u32>,
    latency_budget_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAgentSpec {
    host_class: HostClass,
    port: u16,
    health_port: u16,
    launch_cmd: Vec<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    autoload: AutoloadMode,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    resource_hints: RawResourceHints,
    #[serde(default)]
    restart_policy: RawRestartPolicy,
    #[serde(default)]
    health_protocol: HealthProtocol,
    #[serde(default)]
    startup_priority: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResourceHints {
    vram_mb: Option<u32>,
    cpu_weight: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRestartPolicy {
    policy: Option<RestartPolicyKind>,
    max_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfile {
    #[serde(default)]
    include_capabilities: Vec<String>,
    #[serde(default)]
    include_names: Vec<String>,
    #[serde(default)]
    overrides: BTreeMap<String, RawOverride>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOverride {
    required: Option<bool>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Loads and resolves the unified config for the given profile
///
/// # Errors
/// Returns [`ConfigError`] on unreadable or malformed documents, duplicate
/// names or ports, unknown dependencies or profiles, out-of-range ports, and
/// contradictory autoload/required declarations.
pub fn load(path: &Path, profile: &str) -> Result<Manifest, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&text, profile)
}

/// Resolves a config document already held in memory
///
/// # Errors
/// Same conditions as [`load`].
pub fn load_str(document: &str, profile: &str) -> Result<Manifest, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(document)?;
    resolve(raw, profile)
}

fn resolve(raw: RawConfig, profile: &str) -> Result<Manifest, ConfigError> {
    let Some(raw_profile) = raw.profiles.get(profile) else {
        return Err(ConfigError::UnknownProfile {
            profile: profile.to_string(),
            declared: raw.profiles.keys().cloned().collect(),
        });
    };

    let settings = settings_from_raw(&raw.global_settings)?;

    // Validate and convert every authored spec first; profile filtering and
    // reference checks need the full universe.
    let mut universe: BTreeMap<AgentName, AgentSpec> = BTreeMap::new();
    for (name, raw_spec) in &raw.agents {
        let spec = spec_from_raw(name, raw_spec, &settings)?;
        universe.insert(spec.name.clone(), spec);
    }

    // Dependencies must resolve within the authored universe.
    for spec in universe.values() {
        for dep in &spec.dependencies {
            if !universe.contains_key(dep) {
                return Err(ConfigError::UnknownDependency {
                    agent: spec.name.clone(),
                    dependency: dep.to_string(),
                });
            }
        }
    }

    // Profile capability references must be declared by someone.
    let declared_caps: BTreeSet<&str> = universe
        .values()
        .flat_map(|s| s.capabilities.iter().map(CapabilityName::as_str))
        .collect();
    for capability in &raw_profile.include_capabilities {
        if !declared_caps.contains(capability.as_str()) {
            return Err(ConfigError::UndeclaredCapability {
                profile: profile.to_string(),
                capability: capability.clone(),
            });
        }
    }

    // Apply overrides before filtering so a required=false override can
    // drop an agent out of the effective set.
    for (target, over) in &raw_profile.overrides {
        let target_name =
            AgentName::try_new(target.clone()).map_err(|e| ConfigError::InvalidValue {
                agent: target.clone(),
                field: "overrides",
                reason: e.to_string(),
            })?;
        let Some(spec) = universe.get_mut(&target_name) else {
            return Err(ConfigError::InvalidValue {
                agent: target.clone(),
                field: "overrides",
                reason: "override targets an agent that does not exist".to_string(),
            });
        };
        if let Some(required) = over.required {
            if required && spec.autoload == AutoloadMode::OnDemand {
                return Err(ConfigError::OnDemandRequiredOverride {
                    profile: profile.to_string(),
                    agent: spec.name.clone(),
                });
            }
            spec.required = required;
        }
    }

    // Profile filter: required, explicitly listed, or on_demand.
    let include_names: BTreeSet<&str> = raw_profile
        .include_names
        .iter()
        .map(String::as_str)
        .collect();
    let include_caps: BTreeSet<&str> = raw_profile
        .include_capabilities
        .iter()
        .map(String::as_str)
        .collect();

    let agents: BTreeMap<AgentName, Arc<AgentSpec>> = universe
        .iter()
        .filter(|(name, spec)| {
            spec.required
                || include_names.contains(name.as_str())
                || spec
                    .capabilities
                    .iter()
                    .any(|c| include_caps.contains(c.as_str()))
                || spec.autoload == AutoloadMode::OnDemand
        })
        .map(|(name, spec)| (name.clone(), Arc::new(spec.clone())))
        .collect();

    let manifest = Manifest {
        profile: profile.to_string(),
        settings: Arc::new(settings),
        agents,
    };

    // Dependencies of included agents must themselves be included, and the
    // remaining structural invariants must hold.
    enforce(&manifest)?;
    Ok(manifest)
}

/// Applies the structural invariants that make a manifest usable
fn enforce(manifest: &Manifest) -> Result<(), ConfigError> {
    let settings = &manifest.settings;

    let mut claimed: BTreeMap<(HostClass, u16), AgentName> = BTreeMap::new();
    for spec in manifest.agents.values() {
        for (role, port, range) in [
            ("agent", spec.port, settings.agent_port_range),
            ("health", spec.health_port, settings.health_port_range),
        ] {
            if !range.contains(port.as_u16()) {
                return Err(ConfigError::PortOutOfRange {
                    agent: spec.name.clone(),
                    port: port.as_u16(),
                    role,
                    min: range.min,
                    max: range.max,
                });
            }
            if let Some(first) = claimed.insert((spec.host_class, port.as_u16()), spec.name.clone())
            {
                return Err(ConfigError::DuplicatePort {
                    host: spec.host_class,
                    port: port.as_u16(),
                    first,
                    second: spec.name.clone(),
                });
            }
        }

        if spec.required && spec.autoload == AutoloadMode::OnDemand {
            return Err(ConfigError::RequiredOnDemand {
                agent: spec.name.clone(),
            });
        }

        for dep in &spec.dependencies {
            let Some(dep_spec) = manifest.agents.get(dep) else {
                return Err(ConfigError::DependencyExcluded {
                    agent: spec.name.clone(),
                    dependency: dep.clone(),
                    profile: manifest.profile.clone(),
                });
            };
            if spec.is_eager() && !dep_spec.is_eager() {
                return Err(ConfigError::EagerDependsOnDemand {
                    agent: spec.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    Ok(())
}

/// Pure validation pass over an already-built manifest
///
/// Re-checks the structural invariants without side effects and adds
/// advisory findings. [`load`] has already rejected error-severity
/// conditions; this surfaces them for the `test` CLI and reload diffing.
#[must_use]
pub fn validate(manifest: &Manifest) -> Vec<Issue> {
    let mut issues = Vec::new();

    if let Err(e) = enforce(manifest) {
        issues.push(Issue::error(e.to_string()));
    }

    for spec in manifest.agents.values() {
        if spec.launch_cmd.is_empty() {
            issues.push(Issue::error(format!(
                "agent '{}' has an empty launch_cmd",
                spec.name
            )));
        }
        if spec.capabilities.is_empty() && !spec.required {
            issues.push(Issue::warning(format!(
                "agent '{}' declares no capabilities; it is unreachable by routing",
                spec.name
            )));
        }
        if spec.dependencies.contains(&spec.name) {
            issues.push(Issue::error(format!(
                "agent '{}' depends on itself",
                spec.name
            )));
        }
    }

    issues
}

fn settings_from_raw(raw: &RawGlobalSettings) -> Result<GlobalSettings, ConfigError> {
    let defaults = GlobalSettings::default();

    let port = |value: Option<u16>, field: &'static str, fallback: PortNumber| {
        value.map_or(Ok(fallback), |p| {
            PortNumber::try_new(p).map_err(|e| ConfigError::InvalidValue {
                agent: "global_settings".to_string(),
                field,
                reason: e.to_string(),
            })
        })
    };

    let probes = ProbeSettings {
        start_probe_interval: interval(
            raw.probes.start_probe_interval_ms,
            "probes.start_probe_interval_ms",
            defaults.probes.start_probe_interval,
        )?,
        steady_interval: interval(
            raw.probes.steady_interval_ms,
            "probes.steady_interval_ms",
            defaults.probes.steady_interval,
        )?,
        backoff_interval: interval(
            raw.probes.backoff_interval_ms,
            "probes.backoff_interval_ms",
            defaults.probes.backoff_interval,
        )?,
        probe_budget: raw.probes.probe_budget_ms.map_or(
            Ok(defaults.probes.probe_budget),
            |v| {
                ProbeBudgetMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "probes.probe_budget_ms",
                    reason: e.to_string(),
                })
            },
        )?,
        degrade_threshold: raw
            .probes
            .degrade_threshold
            .unwrap_or(defaults.probes.degrade_threshold)
            .max(1),
        unreachable_threshold: raw
            .probes
            .unreachable_threshold
            .unwrap_or(defaults.probes.unreachable_threshold)
            .max(1),
        recovery_run: raw
            .probes
            .recovery_run
            .unwrap_or(defaults.probes.recovery_run)
            .max(1),
        ring_capacity: raw.probes.ring_capacity.map_or(
            Ok(defaults.probes.ring_capacity),
            |v| {
                RingCapacity::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "probes.ring_capacity",
                    reason: e.to_string(),
                })
            },
        )?,
    };

    let supervisor = SupervisorSettings {
        startup_grace: raw.supervisor.startup_grace_ms.map_or(
            Ok(defaults.supervisor.startup_grace),
            |v| {
                StartupGraceMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "supervisor.startup_grace_ms",
                    reason: e.to_string(),
                })
            },
        )?,
        soft_timeout_ms: raw
            .supervisor
            .soft_timeout_ms
            .unwrap_or(defaults.supervisor.soft_timeout_ms),
        drain_timeout: raw.supervisor.drain_timeout_ms.map_or(
            Ok(defaults.supervisor.drain_timeout),
            |v| {
                DrainTimeoutMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "supervisor.drain_timeout_ms",
                    reason: e.to_string(),
                })
            },
        )?,
        stable_window_ms: raw
            .supervisor
            .stable_window_ms
            .unwrap_or(defaults.supervisor.stable_window_ms),
    };

    let coordinator = CoordinatorSettings {
        rate_limit_capacity: positive_f64(
            raw.coordinator.rate_limit_capacity,
            defaults.coordinator.rate_limit_capacity,
        ),
        rate_limit_refill_per_sec: positive_f64(
            raw.coordinator.rate_limit_refill_per_sec,
            defaults.coordinator.rate_limit_refill_per_sec,
        ),
        max_attempts: attempts(
            raw.coordinator.max_attempts,
            "coordinator.max_attempts",
            defaults.coordinator.max_attempts,
        )?,
        base_backoff: raw.coordinator.base_backoff_ms.map_or(
            Ok(defaults.coordinator.base_backoff),
            |v| {
                BackoffBaseMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "coordinator.base_backoff_ms",
                    reason: e.to_string(),
                })
            },
        )?,
        max_backoff: raw.coordinator.max_backoff_ms.map_or(
            Ok(defaults.coordinator.max_backoff),
            |v| {
                BackoffMaxMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "coordinator.max_backoff_ms",
                    reason: e.to_string(),
                })
            },
        )?,
        deadline_reserve_ms: raw
            .coordinator
            .deadline_reserve_ms
            .unwrap_or(defaults.coordinator.deadline_reserve_ms),
        default_deadline_ms: raw
            .coordinator
            .default_deadline_ms
            .unwrap_or(defaults.coordinator.default_deadline_ms)
            .max(1),
        lazy_wait_ms: raw
            .coordinator
            .lazy_wait_ms
            .unwrap_or(defaults.coordinator.lazy_wait_ms),
        bulkhead_width: raw.coordinator.bulkhead_width.map_or(
            Ok(defaults.coordinator.bulkhead_width),
            |v| {
                BulkheadWidth::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "coordinator.bulkhead_width",
                    reason: e.to_string(),
                })
            },
        )?,
        queue_depth: raw.coordinator.queue_depth.map_or(
            Ok(defaults.coordinator.queue_depth),
            |v| {
                QueueDepth::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "coordinator.queue_depth",
                    reason: e.to_string(),
                })
            },
        )?,
    };

    let breaker = BreakerSettings {
        failure_threshold: raw.breaker.failure_threshold.map_or(
            Ok(defaults.breaker.failure_threshold),
            |v| {
                FailureThreshold::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "breaker.failure_threshold",
                    reason: e.to_string(),
                })
            },
        )?,
        window: raw
            .breaker
            .window_ms
            .map_or(Ok(defaults.breaker.window), |v| {
                WindowMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "breaker.window_ms",
                    reason: e.to_string(),
                })
            })?,
        cooldown: raw
            .breaker
            .cooldown_ms
            .map_or(Ok(defaults.breaker.cooldown), |v| {
                CooldownMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "breaker.cooldown_ms",
                    reason: e.to_string(),
                })
            })?,
        half_open_probes: raw.breaker.half_open_probes.map_or(
            Ok(defaults.breaker.half_open_probes),
            |v| {
                HalfOpenProbes::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "breaker.half_open_probes",
                    reason: e.to_string(),
                })
            },
        )?,
    };

    let lazy = LazySettings {
        load_sla_ms: raw.lazy.load_sla_ms.unwrap_or(defaults.lazy.load_sla_ms),
        max_lazy_attempts: attempts(
            raw.lazy.max_lazy_attempts,
            "lazy.max_lazy_attempts",
            defaults.lazy.max_lazy_attempts,
        )?,
        cold_duration_ms: raw
            .lazy
            .cold_duration_ms
            .unwrap_or(defaults.lazy.cold_duration_ms),
    };

    let llm = LlmSettings {
        heavy_threshold: raw
            .llm
            .heavy_threshold
            .filter(|v| v.is_finite() && (0.0..=1.0).contains(v))
            .unwrap_or(defaults.llm.heavy_threshold),
        local_capability: raw
            .llm
            .local_capability
            .clone()
            .unwrap_or(defaults.llm.local_capability),
        quantized_capability: raw.llm.quantized_capability.clone(),
        remote_endpoint: raw.llm.remote_endpoint.clone(),
        vram_required_mb: raw.llm.vram_required_mb.map_or(
            Ok(defaults.llm.vram_required_mb),
            |v| {
                VramMb::try_new(v).map_err(|e| ConfigError::InvalidValue {
                    agent: "global_settings".to_string(),
                    field: "llm.vram_required_mb",
                    reason: e.to_string(),
                })
            },
        )?,
        latency_budget_ms: raw
            .llm
            .latency_budget_ms
            .unwrap_or(defaults.llm.latency_budget_ms),
    };

    Ok(GlobalSettings {
        agent_port_range: raw.agent_port_range.unwrap_or(defaults.agent_port_range),
        health_port_range: raw.health_port_range.unwrap_or(defaults.health_port_range),
        registry_port: port(raw.registry_port, "registry_port", defaults.registry_port)?,
        coordinator_port: port(
            raw.coordinator_port,
            "coordinator_port",
            defaults.coordinator_port,
        )?,
        hub_port: port(raw.hub_port, "hub_port", defaults.hub_port)?,
        admin_port: port(raw.admin_port, "admin_port", defaults.admin_port)?,
        lease_ttl: raw.lease_ttl_ms.map_or(Ok(defaults.lease_ttl), |v| {
            LeaseTtlMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
                agent: "global_settings".to_string(),
                field: "lease_ttl_ms",
                reason: e.to_string(),
            })
        })?,
        snapshot_path: raw
            .snapshot_path
            .clone()
            .unwrap_or(defaults.snapshot_path),
        snapshot_interval_ms: raw
            .snapshot_interval_ms
            .unwrap_or(defaults.snapshot_interval_ms)
            .max(100),
        bootstrap_window_ms: raw
            .bootstrap_window_ms
            .unwrap_or(defaults.bootstrap_window_ms),
        probes,
        supervisor,
        coordinator,
        breaker,
        lazy,
        llm,
        observability_endpoint: raw.observability_endpoint.clone(),
        classifier_rules: raw.classifier_rules.clone(),
        alert_rules: raw.alert_rules.clone(),
    })
}

fn interval(
    value: Option<u64>,
    field: &'static str,
    fallback: ProbeIntervalMs,
) -> Result<ProbeIntervalMs, ConfigError> {
    value.map_or(Ok(fallback), |v| {
        ProbeIntervalMs::try_new(v).map_err(|e| ConfigError::InvalidValue {
            agent: "global_settings".to_string(),
            field,
            reason: e.to_string(),
        })
    })
}

fn attempts(
    value: Option<u32>,
    field: &'static str,
    fallback: MaxAttempts,
) -> Result<MaxAttempts, ConfigError> {
    value.map_or(Ok(fallback), |v| {
        MaxAttempts::try_new(v).map_err(|e| ConfigError::InvalidValue {
            agent: "global_settings".to_string(),
            field,
            reason: e.to_string(),
        })
    })
}

fn positive_f64(value: Option<f64>, fallback: f64) -> f64 {
    value.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(fallback)
}

fn spec_from_raw(
    name: &str,
    raw: &RawAgentSpec,
    _settings: &GlobalSettings,
) -> Result<AgentSpec, ConfigError> {
    let invalid = |field: &'static str, reason: String| ConfigError::InvalidValue {
        agent: name.to_string(),
        field,
        reason,
    };

    let agent_name =
        AgentName::try_new(name.to_string()).map_err(|e| invalid("name", e.to_string()))?;
    let port = PortNumber::try_new(raw.port).map_err(|e| invalid("port", e.to_string()))?;
    let health_port =
        PortNumber::try_new(raw.health_port).map_err(|e| invalid("health_port", e.to_string()))?;

    let dependencies = raw
        .dependencies
        .iter()
        .map(|d| AgentName::try_new(d.clone()).map_err(|e| invalid("dependencies", e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    let capabilities = raw
        .capabilities
        .iter()
        .map(|c| {
            CapabilityName::try_new(c.clone()).map_err(|e| invalid("capabilities", e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let resource_hints = ResourceHints {
        vram_mb: raw
            .resource_hints
            .vram_mb
            .map(|v| VramMb::try_new(v).map_err(|e| invalid("resource_hints.vram_mb", e.to_string())))
            .transpose()?,
        cpu_weight: raw
            .resource_hints
            .cpu_weight
            .map(|v| {
                CpuWeight::try_new(v)
                    .map_err(|e| invalid("resource_hints.cpu_weight", e.to_string()))
            })
            .transpose()?,
    };

    let policy_defaults = RestartPolicy::default();
    let restart_policy = RestartPolicy {
        policy: raw.restart_policy.policy.unwrap_or(policy_defaults.policy),
        max_attempts: raw
            .restart_policy
            .max_attempts
            .map(|v| {
                MaxAttempts::try_new(v)
                    .map_err(|e| invalid("restart_policy.max_attempts", e.to_string()))
            })
            .transpose()?
            .unwrap_or(policy_defaults.max_attempts),
        backoff_base: raw
            .restart_policy
            .backoff_base_ms
            .map(|v| {
                BackoffBaseMs::try_new(v)
                    .map_err(|e| invalid("restart_policy.backoff_base_ms", e.to_string()))
            })
            .transpose()?
            .unwrap_or(policy_defaults.backoff_base),
        backoff_max: raw
            .restart_policy
            .backoff_max_ms
            .map(|v| {
                BackoffMaxMs::try_new(v)
                    .map_err(|e| invalid("restart_policy.backoff_max_ms", e.to_string()))
            })
            .transpose()?
            .unwrap_or(policy_defaults.backoff_max),
    };

    if raw.launch_cmd.is_empty() {
        return Err(invalid("launch_cmd", "must not be empty".to_string()));
    }

    Ok(AgentSpec {
        name: agent_name,
        host_class: raw.host_class,
        port,
        health_port,
        launch_cmd: raw.launch_cmd.clone(),
        required: raw.required,
        autoload: raw.autoload,
        dependencies,
        capabilities,
        resource_hints,
        restart_policy,
        health_protocol: raw.health_protocol,
        startup_priority: raw
            .startup_priority
            .map(StartupPriority::new)
            .unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Reload diffing
// ---------------------------------------------------------------------------

/// Classification of a config reload against the running manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReloadDelta {
    /// Newly added on_demand specs, safe to apply
    pub added_on_demand: Vec<AgentName>,
    /// Whether global settings thresholds changed (non-breaking)
    pub settings_changed: bool,
    /// Human-readable reasons the reload is rejected; empty means accepted
    pub breaking: Vec<String>,
}

impl ReloadDelta {
    /// Whether the delta can be applied to a running fleet
    #[must_use]
    pub fn is_applicable(&self) -> bool {
        self.breaking.is_empty()
    }
}

/// Diffs a freshly loaded manifest against the running one
///
/// Additions of on_demand specs and global-settings threshold changes are
/// non-breaking; port, name, dependency, or launch edits on existing agents,
/// removals, and new eager agents are breaking.
#[must_use]
pub fn diff(running: &Manifest, fresh: &Manifest) -> ReloadDelta {
    let mut delta = ReloadDelta {
        settings_changed: running.settings.as_ref() != fresh.settings.as_ref(),
        ..ReloadDelta::default()
    };

    for (name, spec) in &fresh.agents {
        match running.agents.get(name) {
            None => {
                if spec.is_eager() {
                    delta
                        .breaking
                        .push(format!("new eager agent '{name}' requires a restart"));
                } else {
                    delta.added_on_demand.push(name.clone());
                }
            }
            Some(existing) if existing.as_ref() != spec.as_ref() => {
                delta
                    .breaking
                    .push(format!("agent '{name}' changed while running"));
            }
            Some(_) => {}
        }
    }

    for name in running.agents.keys() {
        if !fresh.agents.contains_key(name) {
            delta
                .breaking
                .push(format!("agent '{name}' removed while running"));
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> String {
        r#"
global_settings:
  snapshot_path: /tmp/registry.snapshot.json
agents:
  service-registry-shim:
    host_class: main_pc
    port: 7201
    health_port: 8201
    launch_cmd: ["flotilla-agent", "--name", "service-registry-shim"]
    required: true
    capabilities: [stt]
  vision-agent:
    host_class: pc2
    port: 7202
    health_port: 8202
    launch_cmd: ["flotilla-agent", "--name", "vision-agent"]
    autoload: on_demand
    capabilities: [vision]
profiles:
  core:
    include_capabilities: [stt]
  full:
    include_capabilities: [stt, vision]
"#
        .to_string()
    }

    #[test]
    fn loads_minimal_config() {
        let manifest = load_str(&minimal_config(), "core").unwrap();
        assert_eq!(manifest.agents.len(), 2);
        let name = AgentName::try_new("vision-agent".to_string()).unwrap();
        assert_eq!(
            manifest.get(&name).unwrap().autoload,
            AutoloadMode::OnDemand
        );
    }

    #[test]
    fn rejects_unknown_profile() {
        let err = load_str(&minimal_config(), "tutoring").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProfile { .. }));
    }

    #[test]
    fn rejects_unknown_fields() {
        let doc = minimal_config().replace("profiles:", "bogus_field: 1\nprofiles:");
        assert!(matches!(
            load_str(&doc, "core").unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn rejects_duplicate_port_same_host() {
        let doc = minimal_config().replace("port: 7202", "port: 7201");
        let doc = doc.replace("host_class: pc2", "host_class: main_pc");
        assert!(matches!(
            load_str(&doc, "core").unwrap_err(),
            ConfigError::DuplicatePort { .. }
        ));
    }

    #[test]
    fn same_port_on_other_host_is_fine() {
        // pc2 reuses 7201 legitimately
        let doc = minimal_config().replace("port: 7202", "port: 7201");
        assert!(load_str(&doc, "core").is_ok());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let doc = minimal_config().replace(
            "    capabilities: [vision]",
            "    capabilities: [vision]\n    dependencies: [ghost]",
        );
        assert!(matches!(
            load_str(&doc, "core").unwrap_err(),
            ConfigError::UnknownDependency { .. }
        ));
    }

    #[test]
    fn rejects_out_of_range_port() {
        let doc = minimal_config().replace("port: 7201", "port: 6000");
        assert!(matches!(
            load_str(&doc, "core").unwrap_err(),
            ConfigError::PortOutOfRange { .. }
        ));
    }

    #[test]
    fn rejects_eager_depending_on_demand() {
        let doc = minimal_config().replace(
            "    capabilities: [stt]\n",
            "    capabilities: [stt]\n    dependencies: [vision-agent]\n",
        );
        assert!(matches!(
            load_str(&doc, "core").unwrap_err(),
            ConfigError::EagerDependsOnDemand { .. }
        ));
    }

    #[test]
    fn rejects_required_override_on_demand() {
        let doc = minimal_config().replace(
            "  core:\n    include_capabilities: [stt]",
            "  core:\n    include_capabilities: [stt]\n    overrides:\n      vision-agent:\n        required: true",
        );
        assert!(matches!(
            load_str(&doc, "core").unwrap_err(),
            ConfigError::OnDemandRequiredOverride { .. }
        ));
    }

    #[test]
    fn rejects_undeclared_profile_capability() {
        let doc = minimal_config().replace(
            "include_capabilities: [stt]\n",
            "include_capabilities: [telepathy]\n",
        );
        assert!(matches!(
            load_str(&doc, "core").unwrap_err(),
            ConfigError::UndeclaredCapability { .. }
        ));
    }

    #[test]
    fn capability_index_is_table_lookup() {
        let manifest = load_str(&minimal_config(), "full").unwrap();
        let index = manifest.capability_index();
        let vision = CapabilityName::try_new("vision".to_string()).unwrap();
        assert_eq!(index.get(&vision).map(Vec::len), Some(1));
    }

    #[test]
    fn validate_flags_self_dependency() {
        let manifest = load_str(&minimal_config(), "core").unwrap();
        // No self-dependency in the fixture, so only warnings at most.
        assert!(validate(&manifest)
            .iter()
            .all(|i| i.severity == IssueSeverity::Warning));
    }

    #[test]
    fn reload_accepts_new_on_demand() {
        let running = load_str(&minimal_config(), "core").unwrap();
        let doc = minimal_config().replace(
            "profiles:",
            r#"  tts-agent:
    host_class: main_pc
    port: 7203
    health_port: 8203
    launch_cmd: ["flotilla-agent", "--name", "tts-agent"]
    autoload: on_demand
    capabilities: [tts]
profiles:"#,
        );
        let fresh = load_str(&doc, "core").unwrap();
        let delta = diff(&running, &fresh);
        assert!(delta.is_applicable());
        assert_eq!(delta.added_on_demand.len(), 1);
    }

    #[test]
    fn reload_rejects_port_edit() {
        let running = load_str(&minimal_config(), "core").unwrap();
        let doc = minimal_config().replace("port: 7201", "port: 7204");
        let fresh = load_str(&doc, "core").unwrap();
        let delta = diff(&running, &fresh);
        assert!(!delta.is_applicable());
    }
}

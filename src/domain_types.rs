//! Domain types for the Flotilla orchestration platform
//!
//! This module defines strongly-typed domain values to prevent primitive
//! obsession and improve type safety throughout the codebase. Validation
//! ranges live here so that a value which exists is a value which is legal.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Name of an agent, unique within the cluster
#[nutype(
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct AgentName(String);

impl AgentName {
    /// Borrows the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Capability tag declared by agents and consulted by routing (e.g. `stt`, `llm.local`)
#[nutype(
    validate(len_char_min = 1, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct CapabilityName(String);

impl CapabilityName {
    /// Borrows the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Network port bound by an agent socket
///
/// The loader additionally enforces the configured advisory ranges
/// (7200-7999 for request ports, 8200-8999 for health ports); the type
/// only rejects privileged values.
#[nutype(
    validate(greater_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct PortNumber(u16);

impl PortNumber {
    /// Gets the value as u16 for socket binding
    #[must_use]
    pub fn as_u16(&self) -> u16 {
        self.into_inner()
    }
}

/// Startup ordering tie-breaker; lower values sort earlier within a batch
#[nutype(
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        From,
        Into
    ),
    default = 100
)]
pub struct StartupPriority(u16);

/// Lease token returned by the registry on registration
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    /// Creates a new random lease token
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a request handled by the coordinator
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random request ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Trace identifier propagated across component boundaries for causality
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TraceId(Uuid);

impl TraceId {
    /// Creates a new random trace ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Channel capacity for bounded queues
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1024
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum attempts for retried operations (dispatch retries, restarts, lazy loads)
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 20),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxAttempts(u32);

impl MaxAttempts {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Base backoff delay in milliseconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 500
)]
pub struct BackoffBaseMs(u64);

impl BackoffBaseMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Backoff ceiling in milliseconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct BackoffMaxMs(u64);

impl BackoffMaxMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Circuit breaker failure threshold within the sliding window
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct FailureThreshold(u32);

impl FailureThreshold {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Sliding window for circuit breaker failure counting, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct WindowMs(u64);

impl WindowMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Cooldown before an Open circuit admits a half-open probe, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct CooldownMs(u64);

impl CooldownMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Concurrent probe budget while a circuit is half-open
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 16),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1
)]
pub struct HalfOpenProbes(u8);

impl HalfOpenProbes {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        u32::from(self.into_inner())
    }
}

/// Budget for a single health probe round-trip, in milliseconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 60_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct ProbeBudgetMs(u64);

impl ProbeBudgetMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Interval between health probes, in milliseconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5000
)]
pub struct ProbeIntervalMs(u64);

impl ProbeIntervalMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Registry lease time-to-live, in milliseconds
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 15_000
)]
pub struct LeaseTtlMs(u64);

impl LeaseTtlMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Time allowed for an agent to drain in-flight work on Stop, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct DrainTimeoutMs(u64);

impl DrainTimeoutMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Time allowed for a starting agent to reach Ready, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct StartupGraceMs(u64);

impl StartupGraceMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Capacity of the per-agent health report ring buffer
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 4096),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 64
)]
pub struct RingCapacity(usize);

impl RingCapacity {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Queue depth allowed behind a full bulkhead before rejection
#[nutype(
    validate(less_or_equal = 100_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 64
)]
pub struct QueueDepth(usize);

impl QueueDepth {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Concurrent in-flight limit enforced per dispatch target
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 8
)]
pub struct BulkheadWidth(usize);

impl BulkheadWidth {
    /// Gets the value as usize
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }

    /// Width derived from the machine's logical CPU count
    #[must_use]
    pub fn per_cpu_default() -> Self {
        Self::try_new(num_cpus::get().clamp(1, 10_000)).unwrap_or_default()
    }
}

/// VRAM requirement or availability, in megabytes
#[nutype(
    validate(less_or_equal = 1_048_576),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct VramMb(u32);

impl VramMb {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Relative CPU weight hint used by routing affinity
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct CpuWeight(u32);

/// Host affinity class declared by an agent spec
///
/// Affinity only: the supervisor launches everything locally and records the
/// class for routing preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostClass {
    /// GPU-heavy primary host
    MainPc,
    /// Auxiliary host
    Pc2,
}

impl std::fmt::Display for HostClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MainPc => write!(f, "main_pc"),
            Self::Pc2 => write!(f, "pc2"),
        }
    }
}

/// Whether an agent starts at boot or on first demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoloadMode {
    /// Started by the supervisor during batch startup
    #[default]
    Eager,
    /// Started by the lazy loader on first routed request
    OnDemand,
}

/// Restart policy kind for a supervised agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicyKind {
    /// Terminal failure on first exit
    Never,
    /// Restart only on non-zero exit or Unreachable
    #[default]
    OnFailure,
    /// Restart on any exit
    Always,
}

/// Runtime state of an agent record, owned by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Declared but not yet launched
    Pending,
    /// Process launched, not yet observed healthy
    Starting,
    /// Registered and passing probes
    Ready,
    /// Probes failing but below the unreachable threshold
    Degraded,
    /// Probes failing past the unreachable threshold or lease expired
    Unreachable,
    /// Cooperative shutdown in progress
    Stopping,
    /// Cleanly stopped
    Stopped,
    /// Terminal failure
    Failed,
}

impl AgentState {
    /// States in which a record is eligible for routing
    #[must_use]
    pub fn is_routable(self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }

    /// Terminal states that accept no further transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Canonical lowercase health status emitted by probe responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Ok,
    /// Operational with reduced capability
    Degraded,
    /// Failing
    Error,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Task kind carried by a coordinator request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Speech to text
    Stt,
    /// Text to speech
    Tts,
    /// Conversational completion
    Chat,
    /// Image or video understanding
    Vision,
    /// Tool invocation planning
    ToolUse,
    /// Code generation
    CodeGen,
    /// Multi-step reasoning
    Reasoning,
}

impl RequestKind {
    /// Kinds dispatched through the hybrid LLM router rather than a named agent
    #[must_use]
    pub fn is_llm(self) -> bool {
        matches!(
            self,
            Self::Chat | Self::Reasoning | Self::CodeGen | Self::ToolUse
        )
    }

    /// Kinds whose abandoned dispatch may safely complete in the background
    ///
    /// Recognition and generation over an immutable payload are idempotent;
    /// `tool_use` may carry side effects downstream.
    #[must_use]
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Self::ToolUse)
    }

    /// The capability tag this kind routes to by default
    #[must_use]
    pub fn default_capability(self) -> CapabilityName {
        let tag = match self {
            Self::Stt => "stt",
            Self::Tts => "tts",
            Self::Chat => "chat",
            Self::Vision => "vision",
            Self::ToolUse => "tool_use",
            Self::CodeGen => "code_gen",
            Self::Reasoning => "reasoning",
        };
        CapabilityName::try_new(tag.to_string()).expect("kind tags are within capability bounds")
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stt => "stt",
            Self::Tts => "tts",
            Self::Chat => "chat",
            Self::Vision => "vision",
            Self::ToolUse => "tool_use",
            Self::CodeGen => "code_gen",
            Self::Reasoning => "reasoning",
        };
        write!(f, "{s}")
    }
}

/// LLM execution backend selected by the hybrid router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// On-host model
    Local,
    /// Remote API model
    Remote,
}

impl LlmBackend {
    /// The alternative backend used for failover
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl std::fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Resolved network endpoint of an agent socket
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// Bound port
    pub port: PortNumber,
}

impl Endpoint {
    /// Creates an endpoint on the local host
    #[must_use]
    pub fn local(port: PortNumber) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Base URL for HTTP clients talking to this endpoint
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_name_rejects_empty() {
        assert!(AgentName::try_new(String::new()).is_err());
        assert!(AgentName::try_new("service-registry".to_string()).is_ok());
    }

    #[test]
    fn port_number_rejects_privileged() {
        assert!(PortNumber::try_new(80).is_err());
        assert!(PortNumber::try_new(7200).is_ok());
    }

    #[test]
    fn request_kind_llm_partition() {
        assert!(RequestKind::Chat.is_llm());
        assert!(RequestKind::Reasoning.is_llm());
        assert!(!RequestKind::Stt.is_llm());
        assert!(!RequestKind::Vision.is_llm());
    }

    #[test]
    fn tool_use_is_not_idempotent() {
        assert!(!RequestKind::ToolUse.is_idempotent());
        assert!(RequestKind::Chat.is_idempotent());
    }

    #[test]
    fn health_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&HealthStatus::Ok).unwrap(), "\"ok\"");
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn endpoint_display_and_url() {
        let ep = Endpoint::local(PortNumber::try_new(7201).unwrap());
        assert_eq!(ep.to_string(), "127.0.0.1:7201");
        assert_eq!(ep.base_url(), "http://127.0.0.1:7201");
    }

    #[test]
    fn routable_states() {
        assert!(AgentState::Ready.is_routable());
        assert!(AgentState::Degraded.is_routable());
        assert!(!AgentState::Starting.is_routable());
        assert!(!AgentState::Failed.is_routable());
    }
}

//! Hybrid LLM router: choosing between local and remote model backends
//!
//! Selection is deterministic and documented: an explicit backend in the
//! request always wins; otherwise task complexity against `heavy_threshold`
//! decides, with the VRAM gauge able to veto local. Failover walks the
//! fallback chain (the other backend, then a declared quantized local
//! variant) under the same breaker semantics the coordinator uses for named
//! agents, scoped to backends. Every decision emits metrics so thresholds
//! can be tuned offline.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LlmSettings;
use crate::coordinator::dispatch::{DispatchError, Dispatcher};
use crate::coordinator::TaskRequest;
use crate::domain_types::{CapabilityName, Endpoint, LlmBackend, PortNumber};
use crate::error::{Classified, ErrorKind};
use crate::hub::{BreakerBoard, TargetKey};
use crate::observability::{MetricEvent, MetricSink};
use crate::registry::RegistryHandle;
use crate::resilience::Admission;

/// Why the router picked its primary backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// The request named a backend explicitly
    Explicit,
    /// Complexity at or above the heavy threshold
    HeavyComplexity,
    /// Complexity below the heavy threshold
    LightComplexity,
    /// Local lacked VRAM for the task
    VramInsufficient,
}

/// The routing decision, recorded with every dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDecision {
    /// Primary backend
    pub backend: LlmBackend,
    /// Why it was chosen
    pub reason: DecisionReason,
    /// Remaining fallbacks in order
    pub fallbacks: Vec<BackendTarget>,
    /// Complexity estimate that drove the choice
    pub complexity: f64,
}

/// A dispatchable backend variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTarget {
    /// The full local model
    Local,
    /// The remote API model
    Remote,
    /// The smaller-quantized local variant, when declared
    LocalQuantized,
}

impl BackendTarget {
    fn breaker_key(self) -> TargetKey {
        match self {
            // The quantized variant shares the local backend's breaker: it
            // runs on the same engine and fails with it.
            Self::Local | Self::LocalQuantized => TargetKey::Backend(LlmBackend::Local),
            Self::Remote => TargetKey::Backend(LlmBackend::Remote),
        }
    }
}

impl std::fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::LocalQuantized => "local_quantized",
        };
        write!(f, "{s}")
    }
}

/// Errors from the backend routing path
#[derive(Debug, Error)]
pub enum LlmRouteError {
    /// Every backend in the chain was open-circuit or unresolvable
    #[error("no LLM backend available")]
    Unavailable,

    /// The deadline lapsed before any backend answered
    #[error("LLM dispatch deadline exceeded")]
    DeadlineExceeded,

    /// The chosen backend rejected the payload; not retried on a fallback
    #[error("backend rejected request: {message}")]
    Rejected {
        /// Detail from the backend
        message: String,
    },
}

impl Classified for LlmRouteError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable => ErrorKind::Unavailable,
            Self::DeadlineExceeded => ErrorKind::Timeout,
            Self::Rejected { .. } => ErrorKind::Fatal,
        }
    }
}

/// Read-only view of scarce GPU memory
///
/// Owned by the application layer's resource tracker; the core only reads
/// availability when routing and never mutates it.
#[async_trait]
pub trait ResourceGauge: Send + Sync {
    /// Currently available VRAM in megabytes, if known
    async fn available_vram_mb(&self) -> Option<u32>;
}

/// Gauge with a fixed reading, for deployments without a tracker and tests
pub struct StaticGauge(pub Option<u32>);

#[async_trait]
impl ResourceGauge for StaticGauge {
    async fn available_vram_mb(&self) -> Option<u32> {
        self.0
    }
}

/// Successful routed completion
#[derive(Debug, Clone)]
pub struct LlmCompletion {
    /// Backend that answered
    pub served_by: BackendTarget,
    /// The decision that led here
    pub decision: BackendDecision,
    /// Response payload
    pub result: Value,
    /// Fallback edge taken, if any (e.g. `local->remote`)
    pub fallback: Option<String>,
}

#[derive(Debug, Default)]
struct BackendStats {
    latency_ewma_ms: f64,
    total_cost: Decimal,
    decisions: u64,
    failures: u64,
}

/// The hybrid router
pub struct LlmRouter {
    registry: RegistryHandle,
    breakers: Arc<BreakerBoard>,
    dispatcher: Arc<dyn Dispatcher>,
    gauge: Arc<dyn ResourceGauge>,
    settings: LlmSettings,
    sink: MetricSink,
    stats: DashMap<BackendTarget, BackendStats>,
}

impl LlmRouter {
    /// Creates a router over the shared breaker board and dispatch seam
    #[must_use]
    pub fn new(
        registry: RegistryHandle,
        breakers: Arc<BreakerBoard>,
        dispatcher: Arc<dyn Dispatcher>,
        gauge: Arc<dyn ResourceGauge>,
        settings: LlmSettings,
        sink: MetricSink,
    ) -> Self {
        Self {
            registry,
            breakers,
            dispatcher,
            gauge,
            settings,
            sink,
            stats: DashMap::new(),
        }
    }

    /// Estimates task complexity in [0, 1]
    ///
    /// The declared `complexity_hint` wins; otherwise the heuristic buckets
    /// payload length and weights the kind.
    #[must_use]
    pub fn estimate_complexity(&self, request: &TaskRequest) -> f64 {
        if let Some(hint) = request.complexity_hint {
            return hint.clamp(0.0, 1.0);
        }
        let length = request.payload.to_string().len();
        let length_score: f64 = match length {
            0..=512 => 0.2,
            513..=2048 => 0.4,
            2049..=8192 => 0.6,
            _ => 0.8,
        };
        let kind_weight = match request.kind {
            crate::domain_types::RequestKind::Reasoning
            | crate::domain_types::RequestKind::CodeGen => 0.2,
            _ => 0.0,
        };
        (length_score + kind_weight).clamp(0.0, 1.0)
    }

    /// Produces the deterministic backend decision for a request
    pub async fn decide(&self, request: &TaskRequest) -> BackendDecision {
        let complexity = self.estimate_complexity(request);

        if let Some(backend) = request.backend {
            return self.decision_for(backend, DecisionReason::Explicit, complexity);
        }

        let vram_ok = match self.gauge.available_vram_mb().await {
            Some(available) => available >= self.settings.vram_required_mb.as_u32(),
            // An absent gauge never vetoes local.
            None => true,
        };
        if !vram_ok {
            return self.decision_for(LlmBackend::Remote, DecisionReason::VramInsufficient, complexity);
        }

        if complexity >= self.settings.heavy_threshold {
            self.decision_for(LlmBackend::Remote, DecisionReason::HeavyComplexity, complexity)
        } else {
            self.decision_for(LlmBackend::Local, DecisionReason::LightComplexity, complexity)
        }
    }

    fn decision_for(
        &self,
        backend: LlmBackend,
        reason: DecisionReason,
        complexity: f64,
    ) -> BackendDecision {
        let mut fallbacks = match backend {
            LlmBackend::Local => vec![BackendTarget::Remote],
            LlmBackend::Remote => vec![BackendTarget::Local],
        };
        if self.settings.quantized_capability.is_some() {
            fallbacks.push(BackendTarget::LocalQuantized);
        }
        BackendDecision {
            backend,
            reason,
            fallbacks,
            complexity,
        }
    }

    /// Routes the request to a backend, walking fallbacks on failure
    ///
    /// # Errors
    /// [`LlmRouteError::Unavailable`] when the whole chain is open-circuit or
    /// unresolvable, [`LlmRouteError::DeadlineExceeded`] when the deadline
    /// lapses, [`LlmRouteError::Rejected`] for payload-level refusals (never
    /// retried on another backend).
    pub async fn route(
        &self,
        request: &TaskRequest,
        deadline: Instant,
    ) -> Result<LlmCompletion, LlmRouteError> {
        let decision = self.decide(request).await;
        let primary = match decision.backend {
            LlmBackend::Local => BackendTarget::Local,
            LlmBackend::Remote => BackendTarget::Remote,
        };

        let mut chain = vec![primary];
        chain.extend(decision.fallbacks.iter().copied());
        chain.dedup();

        let mut fallback_edge: Option<String> = None;
        let mut saw_timeout = false;

        for target in chain {
            let now = Instant::now();
            if now >= deadline {
                return Err(LlmRouteError::DeadlineExceeded);
            }

            let breaker = self.breakers.breaker(&target.breaker_key());
            if breaker.admit() == Admission::Rejected {
                debug!(backend = %target, "backend circuit open; trying fallback");
                self.note_fallback(&mut fallback_edge, primary, target);
                continue;
            }

            let Some(endpoint) = self.resolve(target).await else {
                // Admission was granted but never exercised.
                breaker.release_unused();
                self.note_fallback(&mut fallback_edge, primary, target);
                continue;
            };

            let budget = deadline
                .saturating_duration_since(now)
                .min(Duration::from_millis(self.settings.latency_budget_ms));

            let attempt_started = Instant::now();
            match self.dispatcher.dispatch(&endpoint, request, budget).await {
                Ok(result) => {
                    breaker.record_success();
                    let latency_ms = attempt_started.elapsed().as_millis() as f64;
                    self.record_outcome(target, latency_ms, &result, true);
                    self.emit_decision(&decision, target, fallback_edge.as_deref(), latency_ms);
                    return Ok(LlmCompletion {
                        served_by: target,
                        decision,
                        result,
                        fallback: fallback_edge,
                    });
                }
                Err(DispatchError::Rejected { kind, message })
                    if !kind.is_retryable() =>
                {
                    // Payload-level refusal: another backend would refuse too.
                    breaker.record_failure();
                    self.record_outcome(target, 0.0, &Value::Null, false);
                    return Err(LlmRouteError::Rejected { message });
                }
                Err(e) => {
                    warn!(backend = %target, error = %e, "backend dispatch failed");
                    saw_timeout |= matches!(e, DispatchError::Timeout { .. });
                    breaker.record_failure();
                    self.record_outcome(target, 0.0, &Value::Null, false);
                    self.note_fallback(&mut fallback_edge, primary, target);
                }
            }
        }

        if saw_timeout && Instant::now() >= deadline {
            Err(LlmRouteError::DeadlineExceeded)
        } else {
            Err(LlmRouteError::Unavailable)
        }
    }

    fn note_fallback(
        &self,
        edge: &mut Option<String>,
        primary: BackendTarget,
        failed: BackendTarget,
    ) {
        if edge.is_none() && failed == primary {
            let next = if primary == BackendTarget::Remote {
                BackendTarget::Local
            } else {
                BackendTarget::Remote
            };
            *edge = Some(format!("{primary}->{next}"));
        }
    }

    async fn resolve(&self, target: BackendTarget) -> Option<Endpoint> {
        match target {
            BackendTarget::Local => self.resolve_capability(&self.settings.local_capability).await,
            BackendTarget::LocalQuantized => {
                let capability = self.settings.quantized_capability.as_ref()?;
                self.resolve_capability(capability).await
            }
            BackendTarget::Remote => self
                .settings
                .remote_endpoint
                .as_deref()
                .and_then(parse_endpoint),
        }
    }

    async fn resolve_capability(&self, capability: &str) -> Option<Endpoint> {
        let capability = CapabilityName::try_new(capability.to_string()).ok()?;
        let records = self.registry.query(capability).await.ok()?;
        records.first().map(|r| r.endpoint.clone())
    }

    fn record_outcome(&self, target: BackendTarget, latency_ms: f64, result: &Value, ok: bool) {
        let mut stats = self.stats.entry(target).or_default();
        stats.decisions += 1;
        if ok {
            // EWMA with alpha 0.2; cold start takes the first sample whole.
            stats.latency_ewma_ms = if stats.latency_ewma_ms == 0.0 {
                latency_ms
            } else {
                0.8 * stats.latency_ewma_ms + 0.2 * latency_ms
            };
            if let Some(cost) = result.get("cost_usd").and_then(Value::as_str) {
                if let Ok(cost) = Decimal::from_str(cost) {
                    stats.total_cost += cost;
                }
            }
        } else {
            stats.failures += 1;
        }
    }

    fn emit_decision(
        &self,
        decision: &BackendDecision,
        served_by: BackendTarget,
        fallback: Option<&str>,
        latency_ms: f64,
    ) {
        let mut event = MetricEvent::new("llm.dispatch_latency_ms", latency_ms)
            .with_tag("backend", served_by.to_string())
            .with_tag("reason", format!("{:?}", decision.reason))
            .with_tag("complexity", format!("{:.2}", decision.complexity));
        if let Some(edge) = fallback {
            event = event.with_tag("fallback", edge);
        }
        self.sink.emit(event);
    }

    /// Observed latency EWMA for a backend, for offline threshold tuning
    #[must_use]
    pub fn latency_ewma_ms(&self, target: BackendTarget) -> Option<f64> {
        self.stats.get(&target).map(|s| s.latency_ewma_ms)
    }

    /// Accumulated declared cost for a backend
    #[must_use]
    pub fn total_cost(&self, target: BackendTarget) -> Decimal {
        self.stats
            .get(&target)
            .map(|s| s.total_cost)
            .unwrap_or_default()
    }
}

fn parse_endpoint(url: &str) -> Option<Endpoint> {
    let stripped = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let authority = stripped.split('/').next()?;
    let (host, port) = authority.rsplit_once(':')?;
    let port = PortNumber::try_new(port.parse().ok()?).ok()?;
    Some(Endpoint {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_str, BreakerSettings};
    use crate::domain_types::{AgentName, AgentState, ChannelCapacity, RequestKind, VramMb};
    use crate::registry::{Registration, RegistryConfig};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedDispatcher {
        local_ok: AtomicBool,
        remote_ok: AtomicBool,
    }

    #[async_trait]
    impl Dispatcher for ScriptedDispatcher {
        async fn dispatch(
            &self,
            endpoint: &Endpoint,
            _request: &TaskRequest,
            _timeout: Duration,
        ) -> Result<Value, DispatchError> {
            // Remote is the configured 9xxx endpoint; local is a registry agent.
            let remote = endpoint.port.as_u16() >= 9000;
            let ok = if remote {
                self.remote_ok.load(Ordering::SeqCst)
            } else {
                self.local_ok.load(Ordering::SeqCst)
            };
            if ok {
                Ok(serde_json::json!({
                    "completion": "done",
                    "served_from": if remote { "remote" } else { "local" },
                    "cost_usd": "0.003"
                }))
            } else {
                Err(DispatchError::Unreachable {
                    detail: "scripted".to_string(),
                })
            }
        }
    }

    async fn fixture(
        local_ok: bool,
        remote_ok: bool,
    ) -> (LlmRouter, Arc<BreakerBoard>, tempfile::TempDir) {
        let doc = r#"
agents:
  local-llm:
    host_class: main_pc
    port: 7221
    health_port: 8221
    launch_cmd: [agent]
    required: true
    capabilities: [llm.local]
profiles:
  core: {}
"#;
        let manifest = Arc::new(load_str(doc, "core").unwrap());
        let dir = tempfile::tempdir().unwrap();
        let registry = crate::registry::spawn(
            Arc::clone(&manifest),
            RegistryConfig {
                lease_ttl: Duration::from_secs(60),
                snapshot_interval: Duration::from_secs(3600),
                snapshot_path: dir.path().join("snap.json"),
                bootstrap_window: Duration::from_secs(20),
                channel_capacity: ChannelCapacity::default(),
            },
        );
        let name = AgentName::try_new("local-llm".to_string()).unwrap();
        registry
            .register(Registration {
                name: name.clone(),
                endpoint: Endpoint::local(PortNumber::try_new(7221).unwrap()),
                health_endpoint: Endpoint::local(PortNumber::try_new(8221).unwrap()),
                capabilities: vec![CapabilityName::try_new("llm.local".to_string()).unwrap()],
                pid: None,
            })
            .await
            .unwrap();
        registry.set_state(name, AgentState::Ready).await.unwrap();

        let breakers = Arc::new(BreakerBoard::new(BreakerSettings::default()));
        let router = LlmRouter::new(
            registry,
            Arc::clone(&breakers),
            Arc::new(ScriptedDispatcher {
                local_ok: AtomicBool::new(local_ok),
                remote_ok: AtomicBool::new(remote_ok),
            }),
            Arc::new(StaticGauge(Some(8192))),
            LlmSettings {
                remote_endpoint: Some("http://127.0.0.1:9001".to_string()),
                vram_required_mb: VramMb::try_new(4096).unwrap(),
                ..LlmSettings::default()
            },
            MetricSink::new(64),
        );
        (router, breakers, dir)
    }

    fn request(complexity: f64) -> TaskRequest {
        TaskRequest {
            id: None,
            kind: RequestKind::Chat,
            payload: serde_json::json!({"text": "hello"}),
            priority: None,
            deadline_ms: None,
            trace_id: None,
            target_agent: None,
            backend: None,
            complexity_hint: Some(complexity),
            source: None,
            affinity: None,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn light_tasks_prefer_local() {
        let (router, _breakers, _dir) = fixture(true, true).await;
        let completion = router.route(&request(0.2), deadline()).await.unwrap();
        assert_eq!(completion.served_by, BackendTarget::Local);
        assert_eq!(completion.decision.reason, DecisionReason::LightComplexity);
        assert!(completion.fallback.is_none());
    }

    #[tokio::test]
    async fn heavy_tasks_prefer_remote() {
        let (router, _breakers, _dir) = fixture(true, true).await;
        let completion = router.route(&request(0.9), deadline()).await.unwrap();
        assert_eq!(completion.served_by, BackendTarget::Remote);
        assert_eq!(completion.decision.reason, DecisionReason::HeavyComplexity);
    }

    #[tokio::test]
    async fn explicit_backend_overrides_complexity() {
        let (router, _breakers, _dir) = fixture(true, true).await;
        let mut req = request(0.1);
        req.backend = Some(LlmBackend::Remote);
        let completion = router.route(&req, deadline()).await.unwrap();
        assert_eq!(completion.served_by, BackendTarget::Remote);
        assert_eq!(completion.decision.reason, DecisionReason::Explicit);
    }

    #[tokio::test]
    async fn open_local_circuit_falls_back_to_remote() {
        let (router, breakers, _dir) = fixture(true, true).await;
        breakers
            .breaker(&TargetKey::Backend(LlmBackend::Local))
            .trip();
        let completion = router.route(&request(0.2), deadline()).await.unwrap();
        assert_eq!(completion.served_by, BackendTarget::Remote);
        assert_eq!(completion.fallback.as_deref(), Some("local->remote"));
    }

    #[tokio::test]
    async fn insufficient_vram_routes_remote() {
        let (mut_router, _breakers, _dir) = fixture(true, true).await;
        // Rebuild with a gauge below the requirement.
        let router = LlmRouter {
            gauge: Arc::new(StaticGauge(Some(512))),
            ..mut_router
        };
        let completion = router.route(&request(0.2), deadline()).await.unwrap();
        assert_eq!(completion.served_by, BackendTarget::Remote);
        assert_eq!(completion.decision.reason, DecisionReason::VramInsufficient);
    }

    #[tokio::test]
    async fn everything_down_is_unavailable() {
        let (router, _breakers, _dir) = fixture(false, false).await;
        let err = router.route(&request(0.2), deadline()).await.unwrap_err();
        assert!(matches!(err, LlmRouteError::Unavailable));
    }

    #[tokio::test]
    async fn cost_feedback_accumulates_exactly() {
        let (router, _breakers, _dir) = fixture(true, true).await;
        router.route(&request(0.2), deadline()).await.unwrap();
        router.route(&request(0.2), deadline()).await.unwrap();
        assert_eq!(
            router.total_cost(BackendTarget::Local),
            Decimal::from_str("0.006").unwrap()
        );
    }
}

//! End-to-end coordinator pipeline tests against scripted dispatch
//!
//! Exercises the admission, classification, resolution, circuit-check, and
//! retry stages with an in-process registry and a dispatcher whose outcomes
//! are scripted per target port.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flotilla::config::{load_str, Manifest};
use flotilla::coordinator::classify::Classifier;
use flotilla::coordinator::dispatch::{DispatchError, Dispatcher};
use flotilla::coordinator::{Coordinator, Outcome, TaskRequest};
use flotilla::domain_types::{
    AgentName, AgentState, CapabilityName, ChannelCapacity, Endpoint, PortNumber, RequestKind,
};
use flotilla::error::ErrorKind;
use flotilla::hub::alerts::ErrorBus;
use flotilla::hub::{BreakerBoard, TargetKey};
use flotilla::lazy::{AgentStarter, LazyLoader, StartError};
use flotilla::llm_router::{LlmRouter, StaticGauge};
use flotilla::observability::MetricSink;
use flotilla::registry::{Registration, RegistryConfig, RegistryHandle};
use flotilla::resilience::CircuitState;

/// Dispatcher with per-port scripted outcomes and call counting
struct ScriptedDispatcher {
    failing: DashMap<u16, bool>,
    calls: DashMap<u16, u64>,
}

impl ScriptedDispatcher {
    fn new() -> Self {
        Self {
            failing: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    fn set_failing(&self, port: u16, failing: bool) {
        self.failing.insert(port, failing);
    }

    fn calls_to(&self, port: u16) -> u64 {
        self.calls.get(&port).map_or(0, |c| *c)
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        request: &TaskRequest,
        _timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let port = endpoint.port.as_u16();
        *self.calls.entry(port).or_insert(0) += 1;
        if self.failing.get(&port).is_some_and(|f| *f) {
            Err(DispatchError::Unreachable {
                detail: "scripted failure".to_string(),
            })
        } else {
            Ok(json!({ "served_port": port, "kind": request.kind.to_string() }))
        }
    }
}

/// Starter that brings an agent to Ready the way supervisor + hub would
struct RegisteringStarter {
    manifest: Arc<Manifest>,
    registry: RegistryHandle,
    starts: Arc<AtomicU64>,
}

#[async_trait]
impl AgentStarter for RegisteringStarter {
    async fn start_agent(&self, name: &AgentName) -> Result<(), StartError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let spec = self.manifest.get(name).ok_or_else(|| StartError::Rejected {
            detail: "unknown".to_string(),
        })?;
        self.registry
            .register(Registration {
                name: name.clone(),
                endpoint: Endpoint::local(spec.port),
                health_endpoint: Endpoint::local(spec.health_port),
                capabilities: spec.capabilities.clone(),
                pid: None,
            })
            .await
            .map_err(|e| StartError::Spawn {
                detail: e.to_string(),
            })?;
        self.registry
            .set_state(name.clone(), AgentState::Ready)
            .await
            .map_err(|e| StartError::Spawn {
                detail: e.to_string(),
            })?;
        Ok(())
    }
}

struct Stack {
    coordinator: Coordinator,
    registry: RegistryHandle,
    breakers: Arc<BreakerBoard>,
    dispatcher: Arc<ScriptedDispatcher>,
    starts: Arc<AtomicU64>,
    manifest: Arc<Manifest>,
    _dir: tempfile::TempDir,
}

async fn stack(doc: &str) -> Stack {
    let manifest = Arc::new(load_str(doc, "core").unwrap());
    let dir = tempfile::tempdir().unwrap();
    let registry = flotilla::registry::spawn(
        Arc::clone(&manifest),
        RegistryConfig {
            lease_ttl: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(3600),
            snapshot_path: dir.path().join("snap.json"),
            bootstrap_window: Duration::from_secs(20),
            channel_capacity: ChannelCapacity::default(),
        },
    );
    let breakers = Arc::new(BreakerBoard::new(manifest.settings.breaker));
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    let sink = MetricSink::new(512);
    let bus = ErrorBus::new(128, Duration::from_millis(1));
    let starts = Arc::new(AtomicU64::new(0));

    let lazy = LazyLoader::new(
        Arc::clone(&manifest),
        registry.clone(),
        Arc::new(RegisteringStarter {
            manifest: Arc::clone(&manifest),
            registry: registry.clone(),
            starts: Arc::clone(&starts),
        }),
        manifest.settings.lazy,
        sink.clone(),
        bus,
    );
    let llm = Arc::new(LlmRouter::new(
        registry.clone(),
        Arc::clone(&breakers),
        Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
        Arc::new(StaticGauge(Some(16_384))),
        manifest.settings.llm.clone(),
        sink.clone(),
    ));
    let coordinator = Coordinator::new(
        Arc::clone(&manifest),
        registry.clone(),
        Arc::clone(&breakers),
        Classifier::new(&manifest.settings.classifier_rules, None),
        Arc::clone(&dispatcher) as Arc<dyn Dispatcher>,
        lazy,
        llm,
        sink,
    );

    Stack {
        coordinator,
        registry,
        breakers,
        dispatcher,
        starts,
        manifest,
        _dir: dir,
    }
}

async fn register_ready(stack: &Stack, name: &str) {
    let name = AgentName::try_new(name.to_string()).unwrap();
    let spec = stack.manifest.get(&name).unwrap();
    stack
        .registry
        .register(Registration {
            name: name.clone(),
            endpoint: Endpoint::local(spec.port),
            health_endpoint: Endpoint::local(spec.health_port),
            capabilities: spec.capabilities.clone(),
            pid: None,
        })
        .await
        .unwrap();
    stack
        .registry
        .set_state(name, AgentState::Ready)
        .await
        .unwrap();
}

fn request(kind: RequestKind) -> TaskRequest {
    TaskRequest {
        id: None,
        kind,
        payload: json!({ "audio_ref": "clip" }),
        priority: None,
        deadline_ms: Some(5_000),
        trace_id: None,
        target_agent: None,
        backend: None,
        complexity_hint: Some(0.1),
        source: Some("test-suite".to_string()),
        affinity: None,
    }
}

const TWO_STT: &str = r#"
global_settings:
  coordinator:
    max_attempts: 3
    base_backoff_ms: 10
    max_backoff_ms: 30
agents:
  stt-alpha:
    host_class: main_pc
    port: 7501
    health_port: 8501
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
  stt-beta:
    host_class: main_pc
    port: 7502
    health_port: 8502
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
profiles:
  core: {}
"#;

#[test_log::test(tokio::test)]
async fn completed_request_reaches_a_ready_target() {
    let stack = stack(TWO_STT).await;
    register_ready(&stack, "stt-alpha").await;
    register_ready(&stack, "stt-beta").await;

    let response = stack.coordinator.handle(request(RequestKind::Stt)).await;
    assert_eq!(response.outcome, Outcome::Completed);
    assert_eq!(response.attempts, 1);
    let target = response.target.unwrap();
    assert!(target.starts_with("stt-"), "unexpected target {target}");
}

#[test_log::test(tokio::test)]
async fn failing_target_fails_over_within_retry_budget() {
    let stack = stack(TWO_STT).await;
    register_ready(&stack, "stt-alpha").await;
    register_ready(&stack, "stt-beta").await;
    stack.dispatcher.set_failing(7501, true);

    // Several requests: every one must complete via the healthy target.
    for _ in 0..4 {
        let response = stack.coordinator.handle(request(RequestKind::Stt)).await;
        assert_eq!(response.outcome, Outcome::Completed, "{:?}", response.error);
        assert_eq!(response.target.as_deref(), Some("stt-beta"));
    }
    assert!(stack.dispatcher.calls_to(7502) >= 4);
}

const ONE_STT_FAST_BREAKER: &str = r#"
global_settings:
  breaker:
    failure_threshold: 5
    window_ms: 10000
    cooldown_ms: 300
    half_open_probes: 1
  coordinator:
    max_attempts: 1
    base_backoff_ms: 10
    max_backoff_ms: 20
agents:
  stt-solo:
    host_class: main_pc
    port: 7511
    health_port: 8511
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
profiles:
  core: {}
"#;

#[test_log::test(tokio::test)]
async fn circuit_opens_after_threshold_and_recovers_via_half_open() {
    let stack = stack(ONE_STT_FAST_BREAKER).await;
    register_ready(&stack, "stt-solo").await;
    stack.dispatcher.set_failing(7511, true);

    // Five consecutive failures trip the breaker.
    for _ in 0..5 {
        let response = stack.coordinator.handle(request(RequestKind::Stt)).await;
        assert_eq!(response.outcome, Outcome::Failed);
    }
    let key = TargetKey::Agent(AgentName::try_new("stt-solo".to_string()).unwrap());
    assert_eq!(stack.breakers.state(&key), CircuitState::Open);
    let calls_when_open = stack.dispatcher.calls_to(7511);
    assert_eq!(calls_when_open, 5);

    // The sixth request is rejected without touching the target.
    let response = stack.coordinator.handle(request(RequestKind::Stt)).await;
    assert_eq!(
        response.error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Unavailable)
    );
    assert_eq!(stack.dispatcher.calls_to(7511), calls_when_open);

    // After cooldown one half-open probe is admitted; success closes.
    tokio::time::sleep(Duration::from_millis(400)).await;
    stack.dispatcher.set_failing(7511, false);
    let response = stack.coordinator.handle(request(RequestKind::Stt)).await;
    assert_eq!(response.outcome, Outcome::Completed);
    assert_eq!(stack.breakers.state(&key), CircuitState::Closed);
}

const RATE_LIMITED: &str = r#"
global_settings:
  coordinator:
    rate_limit_capacity: 2
    rate_limit_refill_per_sec: 0.01
agents:
  stt-solo:
    host_class: main_pc
    port: 7521
    health_port: 8521
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
profiles:
  core: {}
"#;

#[test_log::test(tokio::test)]
async fn per_source_quota_rejects_with_rate_limited() {
    let stack = stack(RATE_LIMITED).await;
    register_ready(&stack, "stt-solo").await;

    for _ in 0..2 {
        let response = stack.coordinator.handle(request(RequestKind::Stt)).await;
        assert_eq!(response.outcome, Outcome::Completed);
    }
    let response = stack.coordinator.handle(request(RequestKind::Stt)).await;
    assert_eq!(
        response.error.map(|e| e.kind),
        Some(ErrorKind::RateLimited)
    );

    // A different source still has a full bucket.
    let mut other = request(RequestKind::Stt);
    other.source = Some("other-caller".to_string());
    let response = stack.coordinator.handle(other).await;
    assert_eq!(response.outcome, Outcome::Completed);
}

const LAZY_VISION: &str = r#"
global_settings:
  coordinator:
    lazy_wait_ms: 10000
agents:
  stt-solo:
    host_class: main_pc
    port: 7531
    health_port: 8531
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
  vision-agent:
    host_class: pc2
    port: 7532
    health_port: 8532
    launch_cmd: [agent]
    autoload: on_demand
    capabilities: [vision]
profiles:
  core: {}
"#;

#[test_log::test(tokio::test)]
async fn routing_miss_triggers_lazy_load_then_bypasses_it() {
    let stack = stack(LAZY_VISION).await;
    register_ready(&stack, "stt-solo").await;

    let response = stack.coordinator.handle(request(RequestKind::Vision)).await;
    assert_eq!(response.outcome, Outcome::Completed, "{:?}", response.error);
    assert_eq!(response.target.as_deref(), Some("vision-agent"));
    assert_eq!(stack.starts.load(Ordering::SeqCst), 1);

    // Subsequent requests bypass the load path entirely.
    let response = stack.coordinator.handle(request(RequestKind::Vision)).await;
    assert_eq!(response.outcome, Outcome::Completed);
    assert_eq!(stack.starts.load(Ordering::SeqCst), 1);
}

const LLM_STACK: &str = r#"
global_settings:
  llm:
    heavy_threshold: 0.6
    remote_endpoint: "http://127.0.0.1:9101"
agents:
  local-llm:
    host_class: main_pc
    port: 7541
    health_port: 8541
    launch_cmd: [agent]
    required: true
    capabilities: [llm.local]
profiles:
  core: {}
"#;

#[test_log::test(tokio::test)]
async fn llm_kind_routes_through_hybrid_router_with_failover() {
    let stack = stack(LLM_STACK).await;
    register_ready(&stack, "local-llm").await;

    // Light task prefers local.
    let mut chat = request(RequestKind::Chat);
    chat.complexity_hint = Some(0.2);
    let response = stack.coordinator.handle(chat.clone()).await;
    assert_eq!(response.outcome, Outcome::Completed);
    assert_eq!(response.target.as_deref(), Some("local"));

    // Force the local backend open: the same light task fails over to remote.
    stack
        .breakers
        .breaker(&TargetKey::Backend(
            flotilla::domain_types::LlmBackend::Local,
        ))
        .trip();
    let response = stack.coordinator.handle(chat).await;
    assert_eq!(response.outcome, Outcome::Completed, "{:?}", response.error);
    assert_eq!(response.target.as_deref(), Some("remote"));
}

#[test_log::test(tokio::test)]
async fn no_target_for_capability_is_unavailable() {
    let stack = stack(TWO_STT).await;
    // Nobody registered: no live target, no on_demand fallback for stt.
    let response = stack.coordinator.handle(request(RequestKind::Stt)).await;
    assert_eq!(
        response.error.map(|e| e.kind),
        Some(ErrorKind::Unavailable)
    );
}

#[test_log::test(tokio::test)]
async fn explicit_target_bypasses_classification() {
    let stack = stack(TWO_STT).await;
    register_ready(&stack, "stt-alpha").await;
    register_ready(&stack, "stt-beta").await;

    let mut req = request(RequestKind::Stt);
    req.target_agent = Some(AgentName::try_new("stt-beta".to_string()).unwrap());
    let response = stack.coordinator.handle(req).await;
    assert_eq!(response.outcome, Outcome::Completed);
    assert_eq!(response.target.as_deref(), Some("stt-beta"));
    assert!(response.classification.is_none());
}

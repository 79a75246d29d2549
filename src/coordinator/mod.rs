//! Request coordinator: admission, classification, routing, and dispatch
//!
//! Stateless across requests except for the rate-limit counters, round-robin
//! cursors, bulkheads, and the read-through routing cache it maintains. The
//! pipeline per request: admit, classify, resolve, circuit check, dispatch
//! with deadline-derived per-attempt timeouts, complete with metrics. LLM
//! kinds are delegated to the hybrid router unless the request names a
//! target agent explicitly.

pub mod classify;
pub mod dispatch;
pub mod rate_limit;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{CoordinatorSettings, SharedManifest};
use crate::domain_types::{
    AgentName, HostClass, LlmBackend, RequestId, RequestKind, TraceId,
};
use crate::error::{Classified, ErrorKind};
use crate::hub::{BreakerBoard, TargetKey};
use crate::lazy::LazyLoader;
use crate::llm_router::LlmRouter;
use crate::observability::{MetricEvent, MetricSink};
use crate::registry::{AgentRecord, RegistryHandle};
use crate::resilience::{backoff_delay, Admission, Bulkhead, BulkheadError, RetryPolicy};

use self::classify::{Classification, Classifier};
use self::dispatch::Dispatcher;
use self::rate_limit::RateLimiter;

/// A task submitted to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Request id; assigned when absent
    #[serde(default)]
    pub id: Option<RequestId>,
    /// Task kind
    pub kind: RequestKind,
    /// Opaque payload forwarded to the target
    #[serde(default)]
    pub payload: Value,
    /// Priority hint; higher is sooner (advisory)
    #[serde(default)]
    pub priority: Option<u8>,
    /// Wall-clock budget for the whole request
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Trace id; assigned when absent
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    /// Explicit target agent, bypassing classification
    #[serde(default)]
    pub target_agent: Option<AgentName>,
    /// Explicit LLM backend override
    #[serde(default)]
    pub backend: Option<LlmBackend>,
    /// Declared complexity for the LLM router
    #[serde(default)]
    pub complexity_hint: Option<f64>,
    /// Source identity for rate limiting
    #[serde(default)]
    pub source: Option<String>,
    /// Host-class affinity for target selection, when declared
    #[serde(default)]
    pub affinity: Option<HostClass>,
}

/// Terminal outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A target answered
    Completed,
    /// The request terminated with an error
    Failed,
}

/// Error detail embedded in a response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// Taxonomy kind
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

/// The coordinator's answer for a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Request id (assigned if the caller sent none)
    pub id: RequestId,
    /// Trace id (assigned if the caller sent none)
    pub trace_id: TraceId,
    /// Terminal outcome
    pub outcome: Outcome,
    /// Target payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error detail on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    /// Agent name or backend that served (or last failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Dispatch attempts performed
    pub attempts: u32,
    /// Classification recorded for the request, if it was classified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

/// The request coordinator
pub struct Coordinator {
    manifest: SharedManifest,
    registry: RegistryHandle,
    breakers: Arc<BreakerBoard>,
    classifier: Classifier,
    dispatcher: Arc<dyn Dispatcher>,
    lazy: LazyLoader,
    llm: Arc<LlmRouter>,
    limiter: RateLimiter,
    bulkheads: DashMap<AgentName, Bulkhead>,
    cursors: DashMap<String, AtomicUsize>,
    cache: DashMap<String, Vec<AgentRecord>>,
    settings: CoordinatorSettings,
    sink: MetricSink,
}

impl Coordinator {
    /// Wires the coordinator over its collaborators
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        manifest: impl Into<SharedManifest>,
        registry: RegistryHandle,
        breakers: Arc<BreakerBoard>,
        classifier: Classifier,
        dispatcher: Arc<dyn Dispatcher>,
        lazy: LazyLoader,
        llm: Arc<LlmRouter>,
        sink: MetricSink,
    ) -> Self {
        let manifest = manifest.into();
        let settings = manifest.current().settings.coordinator.clone();
        Self {
            manifest,
            registry,
            breakers,
            classifier,
            dispatcher,
            lazy,
            llm,
            limiter: RateLimiter::new(
                settings.rate_limit_capacity,
                settings.rate_limit_refill_per_sec,
            ),
            bulkheads: DashMap::new(),
            cursors: DashMap::new(),
            cache: DashMap::new(),
            settings,
            sink,
        }
    }

    /// Runs the full pipeline for one request
    pub async fn handle(&self, mut request: TaskRequest) -> TaskResponse {
        let id = request.id.unwrap_or_else(RequestId::generate);
        let trace_id = request.trace_id.unwrap_or_else(TraceId::generate);
        request.id = Some(id);
        request.trace_id = Some(trace_id);

        // Admit.
        let source = request.source.clone().unwrap_or_else(|| "anonymous".to_string());
        if !self.limiter.try_admit(&source) {
            debug!(%id, source, "request rate limited");
            return self.failed(
                id,
                trace_id,
                ErrorKind::RateLimited,
                format!("source '{source}' exceeded its quota"),
                None,
                0,
                None,
            );
        }

        let deadline = Instant::now()
            + Duration::from_millis(
                request
                    .deadline_ms
                    .filter(|d| *d > 0)
                    .unwrap_or(self.settings.default_deadline_ms),
            );

        // Explicit target bypasses both classification and the LLM router.
        if let Some(target) = request.target_agent.clone() {
            return self.dispatch_to_named(&request, id, trace_id, target, deadline).await;
        }

        if request.kind.is_llm() {
            return self.dispatch_llm(&request, id, trace_id, deadline).await;
        }

        // Classify.
        let classify_started = Instant::now();
        let classification = self.classifier.classify(&request).await;
        self.sink.emit(
            MetricEvent::new(
                "coordinator.classification_latency_ms",
                classify_started.elapsed().as_millis() as f64,
            )
            .with_tag("kind", request.kind.to_string())
            .with_tag("strategy", format!("{:?}", classification.strategy)),
        );

        // Resolve.
        let capability = classification.capability.clone();
        let candidates = self.resolve(&capability, deadline).await;
        if candidates.is_empty() {
            return self.failed(
                id,
                trace_id,
                ErrorKind::Unavailable,
                format!("no live target serves capability '{capability}'"),
                None,
                0,
                Some(classification),
            );
        }

        let ordered = self.order_candidates(candidates, request.affinity, capability.as_str());
        self.dispatch_with_retries(&request, id, trace_id, ordered, deadline, Some(classification))
            .await
    }

    async fn dispatch_to_named(
        &self,
        request: &TaskRequest,
        id: RequestId,
        trace_id: TraceId,
        target: AgentName,
        deadline: Instant,
    ) -> TaskResponse {
        let record = match self.registry.lookup(target.clone()).await {
            Ok(Some(record)) if record.state.is_routable() => Some(record),
            _ => {
                // A dormant on_demand target is loaded on first use.
                if crate::plan::is_on_demand(&self.manifest.current(), &target) {
                    let wait = Duration::from_millis(self.settings.lazy_wait_ms);
                    match tokio::time::timeout(wait, self.lazy.ensure_ready(&target)).await {
                        Ok(Ok(())) => self
                            .registry
                            .lookup(target.clone())
                            .await
                            .ok()
                            .flatten()
                            .filter(|r| r.state.is_routable()),
                        _ => None,
                    }
                } else {
                    None
                }
            }
        };

        let Some(record) = record else {
            return self.failed(
                id,
                trace_id,
                ErrorKind::Unavailable,
                format!("target agent '{target}' is not routable"),
                Some(target.to_string()),
                0,
                None,
            );
        };

        self.dispatch_with_retries(request, id, trace_id, vec![record], deadline, None)
            .await
    }

    async fn dispatch_llm(
        &self,
        request: &TaskRequest,
        id: RequestId,
        trace_id: TraceId,
        deadline: Instant,
    ) -> TaskResponse {
        match self.llm.route(request, deadline).await {
            Ok(completion) => {
                self.emit_outcome(request.kind, "completed", 1);
                TaskResponse {
                    id,
                    trace_id,
                    outcome: Outcome::Completed,
                    result: Some(completion.result),
                    error: None,
                    target: Some(completion.served_by.to_string()),
                    attempts: 1,
                    classification: None,
                }
            }
            Err(e) => self.failed(id, trace_id, e.kind(), e.to_string(), None, 1, None),
        }
    }

    /// Queries the registry with a read-through cache for outage degradation
    async fn resolve(&self, capability: &crate::domain_types::CapabilityName, deadline: Instant) -> Vec<AgentRecord> {
        let mut candidates = match self.registry.query(capability.clone()).await {
            Ok(records) => {
                if records.is_empty() {
                    Vec::new()
                } else {
                    self.cache.insert(capability.to_string(), records.clone());
                    records
                }
            }
            Err(e) => {
                warn!(capability = %capability, error = %e, "registry outage; using last-known routing");
                self.cache
                    .get(capability.as_str())
                    .map(|c| c.clone())
                    .unwrap_or_default()
            }
        };

        // A capability served only by dormant on_demand agents triggers the
        // lazy load path, bounded by lazy_wait and the request deadline.
        if candidates.is_empty() {
            let dormant = self.manifest.current().on_demand_for(capability);
            if let Some(name) = dormant.first() {
                let wait = Duration::from_millis(self.settings.lazy_wait_ms)
                    .min(deadline.saturating_duration_since(Instant::now()));
                if wait > Duration::ZERO {
                    match tokio::time::timeout(wait, self.lazy.ensure_ready(name)).await {
                        Ok(Ok(())) => {
                            if let Ok(records) = self.registry.query(capability.clone()).await {
                                candidates = records;
                            }
                        }
                        Ok(Err(e)) => {
                            debug!(agent = %name, error = %e, "lazy load failed for routing miss");
                        }
                        Err(_) => {
                            debug!(agent = %name, "lazy load did not finish within lazy_wait");
                        }
                    }
                }
            }
        }

        candidates
    }

    /// Selection policy: Ready before Degraded, affinity first, round-robin
    /// within the preferred tier
    fn order_candidates(
        &self,
        candidates: Vec<AgentRecord>,
        affinity: Option<HostClass>,
        capability: &str,
    ) -> Vec<AgentRecord> {
        let (mut ready, mut degraded): (Vec<AgentRecord>, Vec<AgentRecord>) = candidates
            .into_iter()
            .partition(|r| r.state == crate::domain_types::AgentState::Ready);

        let manifest = self.manifest.current();
        let affinity_rank = |record: &AgentRecord| -> u8 {
            match (affinity, manifest.get(&record.name)) {
                (Some(class), Some(spec)) if spec.host_class == class => 0,
                _ => 1,
            }
        };
        ready.sort_by_key(|r| (affinity_rank(r), r.name.clone()));
        degraded.sort_by_key(|r| (affinity_rank(r), r.name.clone()));

        if !ready.is_empty() {
            let cursor = self
                .cursors
                .entry(capability.to_string())
                .or_insert_with(|| AtomicUsize::new(0));
            let offset = cursor.fetch_add(1, Ordering::Relaxed) % ready.len();
            ready.rotate_left(offset);
        }

        ready.extend(degraded);
        ready
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch_with_retries(
        &self,
        request: &TaskRequest,
        id: RequestId,
        trace_id: TraceId,
        candidates: Vec<AgentRecord>,
        deadline: Instant,
        classification: Option<Classification>,
    ) -> TaskResponse {
        let policy = RetryPolicy::standard(
            self.settings.max_attempts.as_u32(),
            self.settings.base_backoff.as_duration(),
            self.settings.max_backoff.as_duration(),
        );
        let reserve = Duration::from_millis(self.settings.deadline_reserve_ms);

        let mut attempts: u32 = 0;
        let mut previous_delay: Option<Duration> = None;
        // Candidates that already failed this request are skipped on the
        // next attempt so retries walk the fallback list.
        let mut tried: std::collections::HashSet<AgentName> = std::collections::HashSet::new();
        let mut last_error = (
            ErrorKind::Unavailable,
            "no dispatch attempted".to_string(),
            None::<String>,
        );

        for attempt in 1..=policy.max_attempts {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .saturating_sub(reserve);
            if remaining.is_zero() {
                self.emit_outcome(request.kind, "timeout", attempts);
                return self.failed(
                    id,
                    trace_id,
                    ErrorKind::Timeout,
                    "deadline exceeded before dispatch".to_string(),
                    last_error.2,
                    attempts,
                    classification,
                );
            }

            // Circuit check: first candidate whose breaker admits. If every
            // fallback is Open this returns Unavailable without any network
            // I/O toward the targets.
            if tried.len() == candidates.len() {
                tried.clear();
            }
            let mut admitted: Option<(&AgentRecord, Arc<crate::resilience::CircuitBreaker>)> =
                None;
            for record in candidates.iter().filter(|r| !tried.contains(&r.name)) {
                let breaker = self.breakers.breaker(&TargetKey::Agent(record.name.clone()));
                if breaker.admit() == Admission::Allowed {
                    admitted = Some((record, breaker));
                    break;
                }
            }
            let Some((record, breaker)) = admitted else {
                self.emit_outcome(request.kind, "unavailable", attempts);
                return self.failed(
                    id,
                    trace_id,
                    ErrorKind::Unavailable,
                    "all targets open-circuit".to_string(),
                    None,
                    attempts,
                    classification,
                );
            };

            // Bulkhead: full queues reject with Overloaded, never retried.
            let bulkhead = self
                .bulkheads
                .entry(record.name.clone())
                .or_insert_with(|| {
                    Bulkhead::new(
                        self.settings.bulkhead_width.as_usize(),
                        self.settings.queue_depth.as_usize(),
                    )
                })
                .clone();
            let permit = match bulkhead.acquire().await {
                Ok(permit) => permit,
                Err(BulkheadError::Overloaded { .. }) => {
                    breaker.release_unused();
                    self.emit_outcome(request.kind, "overloaded", attempts);
                    return self.failed(
                        id,
                        trace_id,
                        ErrorKind::Overloaded,
                        format!("bulkhead full for '{}'", record.name),
                        Some(record.name.to_string()),
                        attempts,
                        classification,
                    );
                }
            };

            attempts += 1;
            let attempt_started = Instant::now();
            let budget = deadline
                .saturating_duration_since(attempt_started)
                .saturating_sub(reserve);

            let outcome = {
                // Spawned so an abandoned idempotent attempt may finish in
                // the background; non-idempotent kinds are aborted with a
                // best-effort cancel signal.
                let dispatcher = Arc::clone(&self.dispatcher);
                let endpoint = record.endpoint.clone();
                let request_clone = request.clone();
                let mut task = tokio::spawn(async move {
                    dispatcher.dispatch(&endpoint, &request_clone, budget).await
                });

                match tokio::time::timeout(budget, &mut task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Err(dispatch::DispatchError::Unreachable {
                        detail: format!("dispatch task failed: {join_error}"),
                    }),
                    Err(_elapsed) => {
                        if request.kind.is_idempotent() {
                            // Detached: the attempt may complete in the
                            // background; its result is discarded.
                            drop(task);
                        } else {
                            task.abort();
                            self.sink.emit(
                                MetricEvent::new("coordinator.cancel_signal", 1.0)
                                    .with_tag("agent", record.name.as_str())
                                    .with_tag("kind", request.kind.to_string()),
                            );
                        }
                        Err(dispatch::DispatchError::Timeout {
                            timeout_ms: budget.as_millis() as u64,
                        })
                    }
                }
            };
            drop(permit);

            self.sink.emit(
                MetricEvent::new(
                    "coordinator.dispatch_latency_ms",
                    attempt_started.elapsed().as_millis() as f64,
                )
                .with_tag("agent", record.name.as_str())
                .with_tag("kind", request.kind.to_string()),
            );

            match outcome {
                Ok(result) => {
                    breaker.record_success();
                    self.emit_outcome(request.kind, "completed", attempts);
                    return TaskResponse {
                        id,
                        trace_id,
                        outcome: Outcome::Completed,
                        result: Some(result),
                        error: None,
                        target: Some(record.name.to_string()),
                        attempts,
                        classification,
                    };
                }
                Err(e) => {
                    breaker.record_failure();
                    tried.insert(record.name.clone());
                    let kind = e.kind();
                    debug!(agent = %record.name, %kind, attempt, "dispatch attempt failed");
                    last_error = (kind, e.to_string(), Some(record.name.to_string()));

                    // Timeouts retry only for idempotent kinds; payload
                    // validation and the rest of the non-retryable kinds
                    // return immediately.
                    let retryable = policy.retries(kind)
                        && (kind != ErrorKind::Timeout || request.kind.is_idempotent());
                    if !retryable || attempt == policy.max_attempts {
                        break;
                    }

                    let delay = backoff_delay(&policy, attempt + 1, previous_delay)
                        .min(deadline.saturating_duration_since(Instant::now()));
                    previous_delay = Some(delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        let (kind, message, target) = last_error;
        self.emit_outcome(request.kind, "failed", attempts);
        self.failed(id, trace_id, kind, message, target, attempts, classification)
    }

    #[allow(clippy::too_many_arguments)]
    fn failed(
        &self,
        id: RequestId,
        trace_id: TraceId,
        kind: ErrorKind,
        message: String,
        target: Option<String>,
        attempts: u32,
        classification: Option<Classification>,
    ) -> TaskResponse {
        TaskResponse {
            id,
            trace_id,
            outcome: Outcome::Failed,
            result: None,
            error: Some(ResponseError { kind, message }),
            target,
            attempts,
            classification,
        }
    }

    fn emit_outcome(&self, kind: RequestKind, outcome: &str, attempts: u32) {
        self.sink.emit(
            MetricEvent::new("coordinator.attempts", f64::from(attempts))
                .with_tag("kind", kind.to_string())
                .with_tag("outcome", outcome),
        );
    }
}

/// Builds the coordinator's HTTP surface
#[must_use]
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/task", post(submit_task))
        .with_state(coordinator)
}

async fn submit_task(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<TaskRequest>,
) -> Response {
    let response = coordinator.handle(request).await;
    let status = match &response.error {
        None => StatusCode::OK,
        Some(e) => match e.kind {
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Overloaded | ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Config | ErrorKind::Plan => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    (status, Json(response)).into_response()
}

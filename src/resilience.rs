//! Resilience primitives: circuit breaker, retry, bulkhead, graceful shutdown
//!
//! Shared by the hub, coordinator, LLM router, and supervisor. The breaker is
//! per target; the bulkhead is per dispatch target; the shutdown helper runs
//! registered cleanups in LIFO order so resources release in reverse order of
//! acquisition.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::BreakerSettings;
use crate::error::ErrorKind;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Pass-through; failures counted in a sliding window
    Closed,
    /// Rejecting immediately until cooldown elapses
    Open,
    /// Admitting a bounded number of probes
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Outcome of asking a breaker for admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed; the caller must report the outcome
    Allowed,
    /// Rejected without touching the target
    Rejected,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

/// Per-target failure-isolating state machine
///
/// All transitions for one target are serialized behind the mutex, so the
/// traversal Closed -> Open -> HalfOpen -> {Closed, Open} is total-ordered.
/// The critical section is O(1) plus window pruning and never awaits.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker with the given parameters
    #[must_use]
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Asks for admission; Open rejects immediately without I/O
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|t| t.elapsed() >= self.settings.cooldown.as_duration());
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    inner.half_open_successes = 0;
                    debug!(state = %inner.state, "circuit admitted first half-open probe");
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.settings.half_open_probes.as_u32() {
                    inner.half_open_in_flight += 1;
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Records a successful attempt
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.half_open_probes.as_u32() {
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                    debug!("circuit closed after successful half-open probes");
                }
            }
            // A success against an Open circuit can only be a stale in-flight
            // attempt from before the trip; it does not reopen admission.
            CircuitState::Open => {}
        }
    }

    /// Records a failed attempt
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                let window = self.settings.window.as_duration();
                while inner
                    .failures
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > window)
                {
                    inner.failures.pop_front();
                }
                if inner.failures.len() >= self.settings.failure_threshold.as_u32() as usize {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                    warn!("circuit opened after failure threshold");
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                warn!("half-open probe failed; circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Returns an admission that was never exercised
    ///
    /// Undoes half-open bookkeeping without counting a success or failure,
    /// for callers that were admitted but never touched the target.
    pub fn release_unused(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Forces the circuit Open, as when the hub marks a target Unreachable
    pub fn trip(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.failures.clear();
        inner.half_open_in_flight = 0;
        inner.half_open_successes = 0;
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // The breaker holds no user code behind the mutex; poisoning can only
        // come from a panic in this module, which is an invariant violation.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Jitter strategy applied to retry backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Deterministic exponential backoff
    None,
    /// Uniform in [0, exponential delay]
    Full,
    /// Decorrelated: uniform in [base, 3 * previous]
    #[default]
    Decorrelated,
}

/// Retry policy supplied by callers of [`backoff_delay`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up (including the first)
    pub max_attempts: u32,
    /// First delay
    pub base_backoff: Duration,
    /// Delay ceiling
    pub max_backoff: Duration,
    /// Jitter strategy
    pub jitter: Jitter,
    /// Error kinds worth retrying
    pub retryable_kinds: HashSet<ErrorKind>,
}

impl RetryPolicy {
    /// Policy retrying only the taxonomy's retryable kinds
    #[must_use]
    pub fn standard(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff,
            jitter: Jitter::Decorrelated,
            retryable_kinds: [ErrorKind::Unavailable, ErrorKind::Timeout, ErrorKind::Retryable]
                .into_iter()
                .collect(),
        }
    }

    /// Whether the policy retries this error kind
    #[must_use]
    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }
}

/// Computes the delay before the given attempt (1-based; attempt 1 has none)
#[must_use]
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, previous: Option<Duration>) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exp = policy
        .base_backoff
        .saturating_mul(1_u32 << (attempt - 2).min(16))
        .min(policy.max_backoff);
    let mut rng = rand::thread_rng();
    match policy.jitter {
        Jitter::None => exp,
        Jitter::Full => {
            let upper = exp.as_millis().max(1) as u64;
            Duration::from_millis(rng.gen_range(0..=upper))
        }
        Jitter::Decorrelated => {
            let base = policy.base_backoff.as_millis().max(1) as u64;
            let prev = previous.unwrap_or(policy.base_backoff).as_millis().max(1) as u64;
            let upper = prev.saturating_mul(3).max(base + 1);
            let delay = rng.gen_range(base..=upper);
            Duration::from_millis(delay).min(policy.max_backoff)
        }
    }
}

/// Full-jitter exponential backoff for supervisor restarts
///
/// `backoff_base * 2^attempts` with uniform jitter in [0, delay], capped at
/// `backoff_max`.
#[must_use]
pub fn restart_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exp = base.saturating_mul(1_u32 << attempts.min(16)).min(max);
    let upper = exp.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=upper))
}

/// Errors raised by the bulkhead
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BulkheadError {
    /// In-flight limit and queue are both full
    #[error("bulkhead full: {in_flight} in flight, queue depth {queue_depth} exhausted")]
    Overloaded {
        /// Configured in-flight width
        in_flight: usize,
        /// Configured queue depth
        queue_depth: usize,
    },
}

/// Concurrent-in-flight limiter with a bounded wait queue
///
/// Excess requests queue up to `queue_depth` waiters, then are rejected with
/// [`BulkheadError::Overloaded`] rather than buffering unboundedly.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    permits: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    width: usize,
    queue_depth: usize,
}

impl Bulkhead {
    /// Creates a bulkhead with the given width and queue depth
    #[must_use]
    pub fn new(width: usize, queue_depth: usize) -> Self {
        let width = width.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            queue: Arc::new(Semaphore::new(queue_depth)),
            width,
            queue_depth,
        }
    }

    /// Acquires an in-flight slot, waiting in the bounded queue if necessary
    ///
    /// # Errors
    /// Returns [`BulkheadError::Overloaded`] when both the in-flight permits
    /// and the wait queue are exhausted.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadError> {
        // Fast path: an in-flight slot is free.
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }
        // Slow path: hold one of the bounded queue slots while waiting.
        let Ok(queue_slot) = self.queue.clone().try_acquire_owned() else {
            return Err(BulkheadError::Overloaded {
                in_flight: self.width,
                queue_depth: self.queue_depth,
            });
        };
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_closed| BulkheadError::Overloaded {
                in_flight: self.width,
                queue_depth: self.queue_depth,
            })?;
        drop(queue_slot);
        Ok(permit)
    }
}

/// One failure from the shutdown sequence
#[derive(Debug)]
pub struct CleanupFailure {
    /// Registered cleanup name
    pub name: String,
    /// What went wrong
    pub reason: String,
}

/// Error aggregating every cleanup failure without swallowing any
#[derive(Debug, Error)]
#[error("{} cleanup step(s) failed: {}", failures.len(), failures.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", "))]
pub struct ShutdownError {
    /// Failures in execution order
    pub failures: Vec<CleanupFailure>,
}

type CleanupFn =
    Box<dyn FnOnce() -> futures::future::BoxFuture<'static, Result<(), String>> + Send>;

struct Cleanup {
    name: String,
    timeout: Duration,
    run: CleanupFn,
}

/// Runs registered cleanup callbacks in LIFO order, each with its own timeout
///
/// Every acquired resource pairs with a registered release; a boot-stop cycle
/// must leave nothing behind.
#[derive(Default)]
pub struct GracefulShutdown {
    cleanups: Mutex<Vec<Cleanup>>,
}

impl GracefulShutdown {
    /// Creates an empty shutdown sequence
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup; later registrations run earlier
    pub fn register<F, Fut>(&self, name: impl Into<String>, timeout: Duration, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        let cleanup = Cleanup {
            name: name.into(),
            timeout,
            run: Box::new(move || Box::pin(cleanup())),
        };
        self.cleanups
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(cleanup);
    }

    /// Runs all cleanups LIFO, aggregating failures
    ///
    /// # Errors
    /// Returns [`ShutdownError`] listing each step that failed or timed out;
    /// remaining steps still run.
    pub async fn run(&self) -> Result<(), ShutdownError> {
        let mut cleanups = {
            let mut guard = self
                .cleanups
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        let mut failures = Vec::new();
        while let Some(cleanup) = cleanups.pop() {
            let name = cleanup.name;
            debug!(cleanup = %name, "running shutdown step");
            match tokio::time::timeout(cleanup.timeout, (cleanup.run)()).await {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => failures.push(CleanupFailure { name, reason }),
                Err(_) => failures.push(CleanupFailure {
                    name,
                    reason: "timed out".to_string(),
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::{CooldownMs, FailureThreshold, HalfOpenProbes, WindowMs};

    fn fast_breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerSettings {
            failure_threshold: FailureThreshold::try_new(threshold).unwrap(),
            window: WindowMs::try_new(10_000).unwrap(),
            cooldown: CooldownMs::try_new(cooldown_ms).unwrap(),
            half_open_probes: HalfOpenProbes::try_new(1).unwrap(),
        })
    }

    #[test]
    fn breaker_trips_at_threshold() {
        let breaker = fast_breaker(5, 30_000);
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[tokio::test]
    async fn breaker_half_opens_after_cooldown_and_closes_on_success() {
        let breaker = fast_breaker(1, 50);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.admit(), Admission::Allowed);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one concurrent probe with the default budget.
        assert_eq!(breaker.admit(), Admission::Rejected);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = fast_breaker(1, 50);
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.admit(), Admission::Allowed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.admit(), Admission::Rejected);
    }

    #[test]
    fn open_rejects_quickly() {
        let breaker = fast_breaker(1, 60_000);
        breaker.record_failure();
        let start = Instant::now();
        for _ in 0..1000 {
            assert_eq!(breaker.admit(), Admission::Rejected);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn backoff_respects_ceiling() {
        let policy = RetryPolicy::standard(
            5,
            Duration::from_millis(100),
            Duration::from_millis(400),
        );
        for attempt in 2..=5 {
            let delay = backoff_delay(&policy, attempt, Some(Duration::from_millis(300)));
            assert!(delay <= Duration::from_millis(400), "attempt {attempt}: {delay:?}");
        }
    }

    #[test]
    fn first_attempt_has_no_delay() {
        let policy =
            RetryPolicy::standard(3, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 1, None), Duration::ZERO);
    }

    #[test]
    fn retry_policy_matches_taxonomy() {
        let policy =
            RetryPolicy::standard(3, Duration::from_millis(10), Duration::from_millis(100));
        assert!(policy.retries(ErrorKind::Unavailable));
        assert!(policy.retries(ErrorKind::Timeout));
        assert!(!policy.retries(ErrorKind::RateLimited));
        assert!(!policy.retries(ErrorKind::Overloaded));
    }

    #[test]
    fn restart_delay_capped() {
        for attempts in 0..12 {
            let delay = restart_delay(
                Duration::from_millis(100),
                Duration::from_secs(5),
                attempts,
            );
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn bulkhead_rejects_past_queue_depth() {
        let bulkhead = Bulkhead::new(1, 1);
        let first = bulkhead.acquire().await.unwrap();

        // Second occupies the single queue slot.
        let second = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Width 1 + queue 1 exhausted: third is rejected immediately.
        let third = bulkhead.acquire().await;
        assert!(matches!(third, Err(BulkheadError::Overloaded { .. })));

        drop(first);
        let second = second.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn shutdown_runs_lifo_and_aggregates() {
        let shutdown = GracefulShutdown::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for step in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            shutdown.register(step, Duration::from_secs(1), move || async move {
                order.lock().unwrap().push(step);
                if step == "second" {
                    Err("boom".to_string())
                } else {
                    Ok(())
                }
            });
        }

        let err = shutdown.run().await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].name, "second");
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn shutdown_times_out_slow_steps() {
        let shutdown = GracefulShutdown::new();
        shutdown.register("slow", Duration::from_millis(30), || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        let err = shutdown.run().await.unwrap_err();
        assert_eq!(err.failures[0].reason, "timed out");
    }
}

//! Error bus and declarative alerting
//!
//! The error bus fans structured [`ErrorReport`]s out to in-process
//! subscribers and coalesces floods: repeated reports from the same source
//! and kind within the coalescing window are suppressed so a mass outage
//! cannot drown the bus. The alert engine evaluates declarative rules over
//! the metric stream and publishes hits to the bus.

use dashmap::DashMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AlertRule;
use crate::error::{ErrorKind, ErrorReport, Severity};
use crate::observability::{MetricEvent, MetricSink};

/// In-process error bus with flood coalescing
#[derive(Clone)]
pub struct ErrorBus {
    tx: broadcast::Sender<ErrorReport>,
    coalesce_window: Duration,
    recent: std::sync::Arc<DashMap<(String, ErrorKind), Instant>>,
}

impl ErrorBus {
    /// Creates a bus with the given fan-out capacity and coalescing window
    #[must_use]
    pub fn new(capacity: usize, coalesce_window: Duration) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            coalesce_window,
            recent: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Publishes a report; duplicates within the window are coalesced
    ///
    /// Returns whether the report was actually forwarded.
    pub fn publish(&self, report: ErrorReport) -> bool {
        let key = (report.source.clone(), report.kind);
        let now = Instant::now();

        if let Some(last) = self.recent.get(&key) {
            if now.duration_since(*last) < self.coalesce_window {
                debug!(source = %report.source, kind = %report.kind, "error report coalesced");
                return false;
            }
        }
        self.recent.insert(key, now);

        if report.severity >= Severity::Error {
            warn!(source = %report.source, kind = %report.kind, "error bus report");
        }
        let _ = self.tx.send(report);
        true
    }

    /// Subscribes to the report stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorReport> {
        self.tx.subscribe()
    }
}

impl Default for ErrorBus {
    fn default() -> Self {
        Self::new(1024, Duration::from_secs(5))
    }
}

#[derive(Debug, Default)]
struct RuleState {
    exceeded_since: Option<Instant>,
    last_fired: Option<Instant>,
}

/// Spawns the alert engine over the metric stream
///
/// Each rule watches one metric, optionally restricted to a target `agent`
/// tag. When samples stay at or above the threshold for the rule's duration,
/// an alert is published to the error bus; re-fires are spaced by the
/// duration so a stuck metric does not repeat every sample.
pub fn spawn_alert_engine(
    rules: Vec<AlertRule>,
    metrics: &MetricSink,
    bus: ErrorBus,
) -> JoinHandle<()> {
    let mut rx = metrics.subscribe();
    tokio::spawn(async move {
        if rules.is_empty() {
            // Still drain the channel so lagging never warns.
            while rx.recv().await.is_ok() {}
            return;
        }
        info!(rules = rules.len(), "alert engine running");
        let mut states: HashMap<(usize, String), RuleState> = HashMap::new();

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "alert engine lagged behind metric stream");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            for (index, rule) in rules.iter().enumerate() {
                evaluate(rule, index, &event, &mut states, &bus);
            }
        }
    })
}

fn evaluate(
    rule: &AlertRule,
    index: usize,
    event: &MetricEvent,
    states: &mut HashMap<(usize, String), RuleState>,
    bus: &ErrorBus,
) {
    if event.name != rule.metric {
        return;
    }
    let agent_tag = event.tags.get("agent").cloned().unwrap_or_default();
    if let Some(target) = &rule.target {
        if target != &agent_tag {
            return;
        }
    }

    let state = states.entry((index, agent_tag.clone())).or_default();
    let now = Instant::now();

    if event.value >= rule.threshold {
        let since = *state.exceeded_since.get_or_insert(now);
        let held = now.duration_since(since);
        let spaced = state
            .last_fired
            .is_none_or(|last| now.duration_since(last) >= Duration::from_millis(rule.for_ms));
        if held >= Duration::from_millis(rule.for_ms) && spaced {
            state.last_fired = Some(now);
            let report = ErrorReport::new(ErrorKind::HealthError, Severity::Warning, "hub.alerts")
                .with_context("rule", rule.name.clone())
                .with_context("metric", rule.metric.clone())
                .with_context("agent", agent_tag.clone())
                .with_context("value", format!("{}", event.value))
                .with_context("threshold", format!("{}", rule.threshold));
            bus.publish(report);
        }
    } else {
        state.exceeded_since = None;
    }
}

//! Observability plumbing: tracing initialization and metric events
//!
//! Metric events are fire-and-forget values aggregated by the health hub;
//! long-term retention is an external scrape concern, not the core's.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain_types::epoch_millis;

/// Fire-and-forget metric sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    /// Metric name, dot-separated (e.g. `coordinator.dispatch_latency_ms`)
    pub name: String,
    /// Sample value
    pub value: f64,
    /// Dimension tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Epoch milliseconds at emission
    pub emitted_at: u64,
}

impl MetricEvent {
    /// Creates a sample stamped with the current time
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            tags: BTreeMap::new(),
            emitted_at: epoch_millis(),
        }
    }

    /// Attaches a dimension tag
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Shared metric fan-out used by every component
///
/// Built on a broadcast channel so emission never blocks the producer; a
/// saturated subscriber drops the oldest samples rather than exerting
/// backpressure on the hot path.
#[derive(Debug, Clone)]
pub struct MetricSink {
    tx: broadcast::Sender<MetricEvent>,
}

impl MetricSink {
    /// Creates a sink with the given channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emits a sample; fire-and-forget
    pub fn emit(&self, event: MetricEvent) {
        // send only fails with zero subscribers, which is fine
        let _ = self.tx.send(event);
    }

    /// Subscribes to the sample stream
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MetricEvent> {
        self.tx.subscribe()
    }
}

impl Default for MetricSink {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// Initializes the global tracing subscriber for a binary entry point
///
/// `LOG_LEVEL` (INFO default) and `RUST_LOG` are both honored; `RUST_LOG`
/// wins when set. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(default_directive: &str) {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!(
                "{level},{default_directive}"
            ))
        });

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        warn!("tracing subscriber already initialized");
    }
}

//! Hub-side metric aggregation: report history and capability rollups
//!
//! History is a bounded ring buffer per agent (in-memory only); rollups are
//! per-capability counters suitable for forwarding to an external scrape
//! endpoint. Nothing here persists across restarts.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use super::normalize::HealthReport;
use crate::domain_types::{epoch_millis, AgentName, CapabilityName, HealthStatus, RingCapacity};

/// One probe observation retained in history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampedReport {
    /// Epoch millis when the probe completed
    pub observed_at: u64,
    /// Probe round-trip in milliseconds
    pub latency_ms: u64,
    /// The normalized report, absent when the probe failed outright
    pub report: Option<HealthReport>,
}

/// Bounded per-agent probe history
#[derive(Debug)]
pub struct ReportHistory {
    capacity: usize,
    rings: DashMap<AgentName, Mutex<VecDeque<StampedReport>>>,
}

impl ReportHistory {
    /// Creates history with the given per-agent capacity
    #[must_use]
    pub fn new(capacity: RingCapacity) -> Self {
        Self {
            capacity: capacity.as_usize(),
            rings: DashMap::new(),
        }
    }

    /// Appends an observation, evicting the oldest past capacity
    pub fn push(&self, name: &AgentName, stamped: StampedReport) {
        let ring = self
            .rings
            .entry(name.clone())
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.capacity)));
        let mut ring = ring
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(stamped);
    }

    /// Last N observations for an agent, newest last
    #[must_use]
    pub fn recent(&self, name: &AgentName) -> Vec<StampedReport> {
        self.rings
            .get(name)
            .map(|ring| {
                ring.lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops an agent's history on final stop
    pub fn forget(&self, name: &AgentName) {
        self.rings.remove(name);
    }
}

#[derive(Debug, Default)]
struct RollupInner {
    ok: u64,
    degraded: u64,
    error: u64,
    failed_probes: u64,
    latency_sum_ms: u64,
    samples: u64,
}

/// Per-capability rollup snapshot for the observability surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRollup {
    /// Capability the rollup covers
    pub capability: CapabilityName,
    /// Probes answering ok
    pub ok: u64,
    /// Probes answering degraded
    pub degraded: u64,
    /// Probes answering error
    pub error: u64,
    /// Probes that produced no report at all
    pub failed_probes: u64,
    /// Mean probe latency over all samples
    pub mean_latency_ms: f64,
    /// Epoch millis at snapshot time
    pub snapshot_at: u64,
}

/// Aggregates probe outcomes by capability
#[derive(Debug, Default)]
pub struct RollupBoard {
    rollups: DashMap<CapabilityName, Mutex<RollupInner>>,
}

impl RollupBoard {
    /// Creates an empty board
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one probe outcome against every capability the agent serves
    pub fn record(
        &self,
        capabilities: &[CapabilityName],
        status: Option<HealthStatus>,
        latency_ms: u64,
    ) {
        for capability in capabilities {
            let entry = self
                .rollups
                .entry(capability.clone())
                .or_insert_with(|| Mutex::new(RollupInner::default()));
            let mut inner = entry
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match status {
                Some(HealthStatus::Ok) => inner.ok += 1,
                Some(HealthStatus::Degraded) => inner.degraded += 1,
                Some(HealthStatus::Error) => inner.error += 1,
                None => inner.failed_probes += 1,
            }
            inner.latency_sum_ms += latency_ms;
            inner.samples += 1;
        }
    }

    /// Snapshot of every capability rollup
    #[must_use]
    pub fn snapshot(&self) -> Vec<CapabilityRollup> {
        let now = epoch_millis();
        let mut out: Vec<CapabilityRollup> = self
            .rollups
            .iter()
            .map(|entry| {
                let inner = entry
                    .value()
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                CapabilityRollup {
                    capability: entry.key().clone(),
                    ok: inner.ok,
                    degraded: inner.degraded,
                    error: inner.error,
                    failed_probes: inner.failed_probes,
                    mean_latency_ms: if inner.samples == 0 {
                        0.0
                    } else {
                        inner.latency_sum_ms as f64 / inner.samples as f64
                    },
                    snapshot_at: now,
                }
            })
            .collect();
        out.sort_by(|a, b| a.capability.cmp(&b.capability));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> AgentName {
        AgentName::try_new(s.to_string()).unwrap()
    }

    fn cap(s: &str) -> CapabilityName {
        CapabilityName::try_new(s.to_string()).unwrap()
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let history = ReportHistory::new(RingCapacity::try_new(3).unwrap());
        let agent = name("stt-agent");
        for i in 0..10 {
            history.push(
                &agent,
                StampedReport {
                    observed_at: i,
                    latency_ms: 1,
                    report: None,
                },
            );
        }
        let recent = history.recent(&agent);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].observed_at, 7);
        assert_eq!(recent[2].observed_at, 9);
    }

    #[test]
    fn forget_drops_history() {
        let history = ReportHistory::new(RingCapacity::default());
        let agent = name("stt-agent");
        history.push(
            &agent,
            StampedReport {
                observed_at: 1,
                latency_ms: 1,
                report: None,
            },
        );
        history.forget(&agent);
        assert!(history.recent(&agent).is_empty());
    }

    #[test]
    fn rollups_track_status_counts_and_latency() {
        let board = RollupBoard::new();
        let caps = vec![cap("stt")];
        board.record(&caps, Some(HealthStatus::Ok), 10);
        board.record(&caps, Some(HealthStatus::Ok), 30);
        board.record(&caps, Some(HealthStatus::Degraded), 50);
        board.record(&caps, None, 110);

        let snapshot = board.snapshot();
        assert_eq!(snapshot.len(), 1);
        let rollup = &snapshot[0];
        assert_eq!(rollup.ok, 2);
        assert_eq!(rollup.degraded, 1);
        assert_eq!(rollup.failed_probes, 1);
        assert!((rollup.mean_latency_ms - 50.0).abs() < f64::EPSILON);
    }
}

//! Lazy loader: bringing on_demand agents up on first use
//!
//! Watches for load requests from the coordinator, coalesces duplicates so at
//! most one start is in flight per name, loads dormant dependencies first in
//! plan order, and fails fast for names that have recently refused to start.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{LazySettings, SharedManifest};
use crate::domain_types::{AgentName, AgentState};
use crate::error::{Classified, ErrorKind, ErrorReport, Severity};
use crate::hub::alerts::ErrorBus;
use crate::observability::{MetricEvent, MetricSink};
use crate::plan::load_order;
use crate::registry::RegistryHandle;

/// Errors surfaced to waiters of a lazy load
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The name is not in the manifest
    #[error("agent '{name}' is unknown to the manifest")]
    Unknown {
        /// Requested name
        name: AgentName,
    },

    /// The name failed recently and is cold; callers should fail fast
    #[error("agent '{name}' is cold for another {remaining_ms}ms")]
    Cold {
        /// Cold name
        name: AgentName,
        /// Time left in the cold window
        remaining_ms: u64,
    },

    /// The start path failed after every permitted attempt
    #[error("agent '{name}' failed to start: {detail}")]
    StartFailed {
        /// Failing name
        name: AgentName,
        /// Last failure detail
        detail: String,
    },

    /// The load did not complete within the SLA
    #[error("agent '{name}' did not reach Ready within {sla_ms}ms")]
    SlaExceeded {
        /// Loading name
        name: AgentName,
        /// Configured SLA
        sla_ms: u64,
    },
}

impl Classified for LoadError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unknown { .. } => ErrorKind::Config,
            Self::Cold { .. } | Self::StartFailed { .. } => ErrorKind::Unavailable,
            Self::SlaExceeded { .. } => ErrorKind::Timeout,
        }
    }
}

/// Errors from one supervisor start attempt
#[derive(Debug, Error)]
pub enum StartError {
    /// The process could not be spawned
    #[error("spawn failed: {detail}")]
    Spawn {
        /// Failure detail
        detail: String,
    },

    /// The supervisor refused the start (unknown name, already terminal)
    #[error("start rejected: {detail}")]
    Rejected {
        /// Refusal detail
        detail: String,
    },
}

/// Start path into the supervisor, behind a trait for testability
#[async_trait]
pub trait AgentStarter: Send + Sync {
    /// Launches the named agent if it is not already running
    ///
    /// Idempotent: starting a running agent is a no-op success.
    async fn start_agent(&self, name: &AgentName) -> Result<(), StartError>;
}

#[derive(Debug, Clone)]
enum LoadOutcome {
    Ready,
    Failed(String),
}

/// The lazy loader; cloneable, all clones share coalescing state
#[derive(Clone)]
pub struct LazyLoader {
    manifest: SharedManifest,
    registry: RegistryHandle,
    starter: Arc<dyn AgentStarter>,
    settings: LazySettings,
    inflight: Arc<Mutex<HashMap<AgentName, broadcast::Sender<LoadOutcome>>>>,
    cold: Arc<DashMap<AgentName, Instant>>,
    sink: MetricSink,
    bus: ErrorBus,
}

impl LazyLoader {
    /// Creates a loader over the supervisor's start path
    #[must_use]
    pub fn new(
        manifest: impl Into<SharedManifest>,
        registry: RegistryHandle,
        starter: Arc<dyn AgentStarter>,
        settings: LazySettings,
        sink: MetricSink,
        bus: ErrorBus,
    ) -> Self {
        Self {
            manifest: manifest.into(),
            registry,
            starter,
            settings,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            cold: Arc::new(DashMap::new()),
            sink,
            bus,
        }
    }

    /// Ensures the named agent is Ready, loading it (and dormant
    /// dependencies) if necessary
    ///
    /// Duplicate concurrent requests for one name coalesce onto a single
    /// in-flight load; every waiter observes the same outcome.
    ///
    /// # Errors
    /// [`LoadError::Cold`] fails fast after repeated start failures;
    /// [`LoadError::StartFailed`] and [`LoadError::SlaExceeded`] report this
    /// load's failure.
    pub async fn ensure_ready(&self, name: &AgentName) -> Result<(), LoadError> {
        if self.manifest.current().get(name).is_none() {
            return Err(LoadError::Unknown { name: name.clone() });
        }

        if let Some(entry) = self.cold.get(name) {
            let elapsed = entry.value().elapsed();
            let cold_for = Duration::from_millis(self.settings.cold_duration_ms);
            if elapsed < cold_for {
                let remaining_ms = (cold_for - elapsed).as_millis() as u64;
                debug!(agent = %name, remaining_ms, "load request hit cold agent");
                return Err(LoadError::Cold {
                    name: name.clone(),
                    remaining_ms,
                });
            }
            self.cold.remove(name);
        }

        // Already running? Nothing to do.
        if self.is_ready(name).await {
            return Ok(());
        }

        let mut rx = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(tx) = inflight.get(name) {
                // Coalesce onto the in-flight load.
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(4);
                inflight.insert(name.clone(), tx);
                let loader = self.clone();
                let name = name.clone();
                tokio::spawn(async move { loader.run_load(name).await });
                rx
            }
        };

        match rx.recv().await {
            Ok(LoadOutcome::Ready) => Ok(()),
            Ok(LoadOutcome::Failed(detail)) => Err(LoadError::StartFailed {
                name: name.clone(),
                detail,
            }),
            Err(_) => Err(LoadError::StartFailed {
                name: name.clone(),
                detail: "load task dropped".to_string(),
            }),
        }
    }

    async fn run_load(&self, name: AgentName) {
        let started = Instant::now();
        let outcome = self.load_with_dependencies(&name, started).await;

        let result = match outcome {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_millis() as f64;
                info!(agent = %name, elapsed_ms, "lazy load complete");
                self.sink.emit(
                    MetricEvent::new("lazy.load_ms", elapsed_ms).with_tag("agent", name.as_str()),
                );
                LoadOutcome::Ready
            }
            Err(e) => {
                warn!(agent = %name, error = %e, "lazy load failed; marking cold");
                self.cold.insert(name.clone(), Instant::now());
                self.bus.publish(
                    ErrorReport::new(e.kind(), Severity::Error, "lazy_loader")
                        .with_context("agent", name.to_string())
                        .with_context("detail", e.to_string()),
                );
                LoadOutcome::Failed(e.to_string())
            }
        };

        let tx = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inflight.remove(&name)
        };
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }

    async fn load_with_dependencies(
        &self,
        name: &AgentName,
        started: Instant,
    ) -> Result<(), LoadError> {
        let sla = Duration::from_millis(self.settings.load_sla_ms);
        let manifest = self.manifest.current();
        let order = load_order(&manifest, name).map_err(|_| LoadError::Unknown {
            name: name.clone(),
        })?;

        for agent in order {
            if self.is_ready(&agent).await {
                continue;
            }
            self.start_one(&agent, started, sla).await?;
        }
        Ok(())
    }

    async fn start_one(
        &self,
        name: &AgentName,
        started: Instant,
        sla: Duration,
    ) -> Result<(), LoadError> {
        let mut last_detail = String::new();
        for attempt in 1..=self.settings.max_lazy_attempts.as_u32() {
            if started.elapsed() >= sla {
                return Err(LoadError::SlaExceeded {
                    name: name.clone(),
                    sla_ms: self.settings.load_sla_ms,
                });
            }

            debug!(agent = %name, attempt, "lazy start attempt");
            match self.starter.start_agent(name).await {
                Ok(()) => {
                    if self.await_ready(name, started, sla).await {
                        return Ok(());
                    }
                    last_detail = "started but never reached Ready".to_string();
                }
                Err(e) => {
                    last_detail = e.to_string();
                }
            }
        }

        Err(LoadError::StartFailed {
            name: name.clone(),
            detail: last_detail,
        })
    }

    async fn await_ready(&self, name: &AgentName, started: Instant, sla: Duration) -> bool {
        while started.elapsed() < sla {
            if self.is_ready(name).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    async fn is_ready(&self, name: &AgentName) -> bool {
        matches!(
            self.registry.lookup(name.clone()).await,
            Ok(Some(record)) if record.state == AgentState::Ready
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_str, Manifest};
    use crate::domain_types::{CapabilityName, ChannelCapacity, Endpoint, PortNumber};
    use crate::registry::{Registration, RegistryConfig};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn manifest() -> Arc<Manifest> {
        let doc = r#"
agents:
  dep-agent:
    host_class: main_pc
    port: 7211
    health_port: 8211
    launch_cmd: [agent]
    autoload: on_demand
    capabilities: [stt]
  vision-agent:
    host_class: pc2
    port: 7212
    health_port: 8212
    launch_cmd: [agent]
    autoload: on_demand
    dependencies: [dep-agent]
    capabilities: [vision]
profiles:
  core: {}
"#;
        Arc::new(load_str(doc, "core").unwrap())
    }

    /// Starter that registers the agent and marks it Ready, like a real
    /// supervisor + hub would.
    struct FakeStarter {
        registry: RegistryHandle,
        succeed: Arc<AtomicBool>,
        starts: Arc<AtomicU64>,
        delay: Duration,
    }

    #[async_trait]
    impl AgentStarter for FakeStarter {
        async fn start_agent(&self, name: &AgentName) -> Result<(), StartError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if !self.succeed.load(Ordering::SeqCst) {
                return Err(StartError::Spawn {
                    detail: "scripted failure".to_string(),
                });
            }
            tokio::time::sleep(self.delay).await;
            let port = if name.as_str() == "dep-agent" { 7211 } else { 7212 };
            self.registry
                .register(Registration {
                    name: name.clone(),
                    endpoint: Endpoint::local(PortNumber::try_new(port).unwrap()),
                    health_endpoint: Endpoint::local(PortNumber::try_new(port + 1000).unwrap()),
                    capabilities: vec![CapabilityName::try_new("vision".to_string()).unwrap()],
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

    struct Fixture {
        loader: LazyLoader,
        starts: Arc<AtomicU64>,
        succeed: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    fn fixture(settings: LazySettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest();
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
        let succeed = Arc::new(AtomicBool::new(true));
        let starts = Arc::new(AtomicU64::new(0));
        let starter = Arc::new(FakeStarter {
            registry: registry.clone(),
            succeed: Arc::clone(&succeed),
            starts: Arc::clone(&starts),
            delay: Duration::from_millis(20),
        });
        let loader = LazyLoader::new(
            manifest,
            registry,
            starter,
            settings,
            MetricSink::new(64),
            ErrorBus::new(64, Duration::from_millis(1)),
        );
        Fixture {
            loader,
            starts,
            succeed,
            _dir: dir,
        }
    }

    fn name(s: &str) -> AgentName {
        AgentName::try_new(s.to_string()).unwrap()
    }

    #[tokio::test]
    async fn loads_dependencies_before_target() {
        let fx = fixture(LazySettings::default());
        fx.loader.ensure_ready(&name("vision-agent")).await.unwrap();
        // dep-agent and vision-agent each started once.
        assert_eq!(fx.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce_to_one_start() {
        let fx = fixture(LazySettings::default());
        let target = name("dep-agent");
        let loads: Vec<_> = (0..8)
            .map(|_| {
                let loader = fx.loader.clone();
                let target = target.clone();
                tokio::spawn(async move { loader.ensure_ready(&target).await })
            })
            .collect();
        for load in loads {
            load.await.unwrap().unwrap();
        }
        assert_eq!(fx.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_request_bypasses_load_path() {
        let fx = fixture(LazySettings::default());
        let target = name("dep-agent");
        fx.loader.ensure_ready(&target).await.unwrap();
        fx.loader.ensure_ready(&target).await.unwrap();
        assert_eq!(fx.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_failure_marks_cold_and_fails_fast() {
        let fx = fixture(LazySettings {
            load_sla_ms: 5_000,
            max_lazy_attempts: crate::domain_types::MaxAttempts::try_new(2).unwrap(),
            cold_duration_ms: 60_000,
        });
        fx.succeed.store(false, Ordering::SeqCst);
        let target = name("dep-agent");

        let err = fx.loader.ensure_ready(&target).await.unwrap_err();
        assert!(matches!(err, LoadError::StartFailed { .. }));
        assert_eq!(fx.starts.load(Ordering::SeqCst), 2);

        // Cold: no further start attempts.
        let err = fx.loader.ensure_ready(&target).await.unwrap_err();
        assert!(matches!(err, LoadError::Cold { .. }));
        assert_eq!(fx.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_name_is_rejected() {
        let fx = fixture(LazySettings::default());
        let err = fx.loader.ensure_ready(&name("ghost")).await.unwrap_err();
        assert!(matches!(err, LoadError::Unknown { .. }));
    }
}

//! Service registry: the authoritative map of agent name to endpoint and state
//!
//! Single-writer by construction: every mutation flows through one actor task
//! that owns the record map, so transitions are linearizable and change events
//! for a given name are delivered in the order they occurred. Reads are served
//! by the same actor; critical sections are O(1).
//!
//! Durability is a periodic single-file snapshot (see [`snapshot`]) plus a
//! bootstrap window after a cold start during which existing agents
//! re-register. Writes during an outage are rejected, never buffered.

pub mod http;
pub mod snapshot;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Manifest, SharedManifest};
use crate::domain_types::{
    epoch_millis, AgentName, AgentState, CapabilityName, ChannelCapacity, Endpoint, LeaseToken,
};
use crate::error::{Classified, ErrorKind};
use crate::resilience::CircuitState;

/// Errors surfaced by registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The name is not part of the manifest
    #[error("agent '{name}' is unknown to the manifest")]
    UnknownAgent {
        /// Rejected name
        name: AgentName,
    },

    /// The lease token does not match any active lease
    #[error("lease token {token} is not active")]
    UnknownLease {
        /// Rejected token
        token: LeaseToken,
    },

    /// Another live registration holds the name
    ///
    /// Last-writer-wins applies only after the previous lease expires.
    #[error("agent '{name}' already holds an active lease from {endpoint}")]
    LeaseHeld {
        /// Contested name
        name: AgentName,
        /// Endpoint of the active holder
        endpoint: Endpoint,
    },

    /// The registry actor is not running; writes are rejected, not buffered
    #[error("registry unavailable")]
    Unavailable,

    /// Snapshot persistence failed
    #[error("snapshot error: {source}")]
    Snapshot {
        /// Underlying I/O or serialization failure
        #[source]
        source: anyhow::Error,
    },
}

impl Classified for RegistryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable => ErrorKind::Unavailable,
            Self::Snapshot { .. } => ErrorKind::Retryable,
            _ => ErrorKind::Registration,
        }
    }
}

/// Runtime record for one agent, owned exclusively by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent name
    pub name: AgentName,
    /// Resolved request endpoint
    pub endpoint: Endpoint,
    /// Resolved health endpoint
    pub health_endpoint: Endpoint,
    /// Capabilities reported at registration
    pub capabilities: Vec<CapabilityName>,
    /// Current lifecycle state
    pub state: AgentState,
    /// OS process id when launched by the supervisor
    pub pid: Option<u32>,
    /// Epoch millis at registration
    pub started_at: u64,
    /// Epoch millis of the last successful probe
    pub last_health_ts: Option<u64>,
    /// Consecutive probe failures observed by the hub
    pub consecutive_failures: u32,
    /// Restarts performed by the supervisor
    pub restart_count: u32,
    /// Mirror of the hub's breaker state for status rendering
    pub circuit_state: CircuitState,
}

/// Outcome of a lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewOutcome {
    /// Lease extended
    Ok,
    /// Lease had already expired; the agent must re-register
    Expired,
}

/// What changed, carried by [`ChangeEvent`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "change")]
pub enum ChangeKind {
    /// A registration was accepted
    Registered {
        /// Registered request endpoint
        endpoint: Endpoint,
    },
    /// The state moved
    StateChanged {
        /// Previous state
        from: AgentState,
        /// New state
        to: AgentState,
    },
    /// A re-registration moved the endpoint
    EndpointChanged {
        /// New request endpoint
        endpoint: Endpoint,
    },
    /// The agent released its lease
    Deregistered,
    /// The lease expired without renewal
    LeaseExpired,
}

/// Change-data event emitted for every transition and endpoint change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Monotonic sequence, total per registry
    pub seq: u64,
    /// Affected agent
    pub name: AgentName,
    /// The change
    pub kind: ChangeKind,
    /// Epoch millis at emission
    pub at: u64,
}

/// Registration request accepted by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Agent name; must exist in the manifest
    pub name: AgentName,
    /// Request endpoint the agent bound
    pub endpoint: Endpoint,
    /// Health endpoint the agent bound
    pub health_endpoint: Endpoint,
    /// Live capabilities
    pub capabilities: Vec<CapabilityName>,
    /// OS pid if known
    pub pid: Option<u32>,
}

struct Lease {
    token: LeaseToken,
    expires_at: Instant,
}

struct Stored {
    record: AgentRecord,
    lease: Option<Lease>,
}

enum Command {
    Register {
        registration: Registration,
        reply: oneshot::Sender<Result<LeaseToken, RegistryError>>,
    },
    Renew {
        token: LeaseToken,
        reply: oneshot::Sender<Result<RenewOutcome, RegistryError>>,
    },
    Deregister {
        token: LeaseToken,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Lookup {
        name: AgentName,
        reply: oneshot::Sender<Option<AgentRecord>>,
    },
    Query {
        capability: CapabilityName,
        reply: oneshot::Sender<Vec<AgentRecord>>,
    },
    List {
        reply: oneshot::Sender<Vec<AgentRecord>>,
    },
    SetState {
        name: AgentName,
        state: AgentState,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    SetCircuit {
        name: AgentName,
        circuit: CircuitState,
    },
    ProbeResult {
        name: AgentName,
        healthy: bool,
        at: u64,
    },
    NoteRestart {
        name: AgentName,
    },
    SnapshotNow {
        reply: oneshot::Sender<Result<u64, RegistryError>>,
    },
}

/// Cloneable handle to the registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<ChangeEvent>,
}

impl RegistryHandle {
    /// Registers an agent and returns its lease token
    ///
    /// Idempotent per name for the same endpoint; a different endpoint is
    /// rejected until the previous lease expires (last writer wins only
    /// after expiry).
    ///
    /// # Errors
    /// [`RegistryError::UnknownAgent`], [`RegistryError::LeaseHeld`], or
    /// [`RegistryError::Unavailable`] during an outage.
    pub async fn register(&self, registration: Registration) -> Result<LeaseToken, RegistryError> {
        self.call(|reply| Command::Register {
            registration,
            reply,
        })
        .await?
    }

    /// Renews a lease
    ///
    /// # Errors
    /// [`RegistryError::UnknownLease`] or [`RegistryError::Unavailable`].
    pub async fn renew(&self, token: LeaseToken) -> Result<RenewOutcome, RegistryError> {
        self.call(|reply| Command::Renew { token, reply }).await?
    }

    /// Releases a lease and marks the record Stopped
    ///
    /// # Errors
    /// [`RegistryError::UnknownLease`] or [`RegistryError::Unavailable`].
    pub async fn deregister(&self, token: LeaseToken) -> Result<(), RegistryError> {
        self.call(|reply| Command::Deregister { token, reply })
            .await?
    }

    /// O(1) lookup by name
    ///
    /// # Errors
    /// [`RegistryError::Unavailable`] during an outage.
    pub async fn lookup(&self, name: AgentName) -> Result<Option<AgentRecord>, RegistryError> {
        self.call(|reply| Command::Lookup { name, reply }).await
    }

    /// Records in Ready or Degraded serving the capability
    ///
    /// # Errors
    /// [`RegistryError::Unavailable`] during an outage.
    pub async fn query(
        &self,
        capability: CapabilityName,
    ) -> Result<Vec<AgentRecord>, RegistryError> {
        self.call(|reply| Command::Query { capability, reply }).await
    }

    /// Every record, for status rendering
    ///
    /// # Errors
    /// [`RegistryError::Unavailable`] during an outage.
    pub async fn list(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        self.call(|reply| Command::List { reply }).await
    }

    /// Documented state API used by the hub and supervisor
    ///
    /// # Errors
    /// [`RegistryError::UnknownAgent`] or [`RegistryError::Unavailable`].
    pub async fn set_state(
        &self,
        name: AgentName,
        state: AgentState,
    ) -> Result<(), RegistryError> {
        self.call(|reply| Command::SetState { name, state, reply })
            .await?
    }

    /// Mirrors the hub's breaker state onto the record; fire-and-forget
    pub fn set_circuit(&self, name: AgentName, circuit: CircuitState) {
        let _ = self.tx.try_send(Command::SetCircuit { name, circuit });
    }

    /// Records a probe outcome on the record; fire-and-forget
    pub fn probe_result(&self, name: AgentName, healthy: bool) {
        let _ = self.tx.try_send(Command::ProbeResult {
            name,
            healthy,
            at: epoch_millis(),
        });
    }

    /// Increments the restart counter; fire-and-forget
    pub fn note_restart(&self, name: AgentName) {
        let _ = self.tx.try_send(Command::NoteRestart { name });
    }

    /// Forces a snapshot and returns the new generation
    ///
    /// # Errors
    /// [`RegistryError::Snapshot`] or [`RegistryError::Unavailable`].
    pub async fn snapshot_now(&self) -> Result<u64, RegistryError> {
        self.call(|reply| Command::SnapshotNow { reply }).await?
    }

    /// Subscribes to the change-data stream
    ///
    /// Events for a given name arrive in the order they occurred.
    #[must_use]
    pub fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RegistryError::Unavailable)?;
        reply_rx.await.map_err(|_| RegistryError::Unavailable)
    }
}

/// Configuration for the registry actor
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Lease time-to-live
    pub lease_ttl: Duration,
    /// Snapshot cadence
    pub snapshot_interval: Duration,
    /// Snapshot file path
    pub snapshot_path: PathBuf,
    /// How long restored records wait for re-registration after a cold start
    pub bootstrap_window: Duration,
    /// Command channel capacity
    pub channel_capacity: ChannelCapacity,
}

impl RegistryConfig {
    /// Builds registry config from the manifest's global settings
    #[must_use]
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            lease_ttl: manifest.settings.lease_ttl.as_duration(),
            snapshot_interval: Duration::from_millis(manifest.settings.snapshot_interval_ms),
            snapshot_path: manifest.settings.snapshot_path.clone(),
            bootstrap_window: Duration::from_millis(manifest.settings.bootstrap_window_ms),
            channel_capacity: ChannelCapacity::default(),
        }
    }
}

/// Spawns the registry actor and returns its handle
///
/// If a snapshot exists at the configured path, records are reconstructed in
/// Unreachable state; agents re-register during the bootstrap window and the
/// coordinator can route to last-known endpoints in the meantime.
#[must_use]
pub fn spawn(manifest: impl Into<SharedManifest>, config: RegistryConfig) -> RegistryHandle {
    let (tx, rx) = mpsc::channel(config.channel_capacity.as_usize());
    let (events, _) = broadcast::channel(config.channel_capacity.as_usize());

    let mut actor = Actor {
        manifest: manifest.into(),
        config,
        records: HashMap::new(),
        events: events.clone(),
        seq: 0,
        generation: 0,
        bootstrap_deadline: None,
        restored: Vec::new(),
    };

    if let Some(file) = snapshot::load(&actor.config.snapshot_path) {
        actor.generation = file.generation;
        info!(
            generation = file.generation,
            records = file.records.len(),
            "restored registry snapshot"
        );
        actor.bootstrap_deadline = Some(Instant::now() + actor.config.bootstrap_window);
        for mut record in file.records {
            record.state = AgentState::Unreachable;
            actor.restored.push(record.name.clone());
            actor.records.insert(
                record.name.clone(),
                Stored {
                    record,
                    lease: None,
                },
            );
        }
    }

    tokio::spawn(actor.run(rx));
    RegistryHandle { tx, events }
}

struct Actor {
    manifest: SharedManifest,
    config: RegistryConfig,
    records: HashMap<AgentName, Stored>,
    events: broadcast::Sender<ChangeEvent>,
    seq: u64,
    generation: u64,
    bootstrap_deadline: Option<Instant>,
    restored: Vec<AgentName>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        // interval_at: the first tick must not fire immediately, or every
        // cold start would burn a snapshot generation before any change.
        let sweep_every = self.config.lease_ttl / 2;
        let mut sweep =
            tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);
        let mut snap = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.snapshot_interval,
            self.config.snapshot_interval,
        );
        snap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else {
                        debug!("registry command channel closed; actor exiting");
                        break;
                    };
                    self.handle(command);
                }
                _ = sweep.tick() => self.sweep_leases(),
                _ = snap.tick() => {
                    if let Err(e) = self.persist() {
                        warn!(error = %e, "registry snapshot failed");
                    }
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                registration,
                reply,
            } => {
                let _ = reply.send(self.register(registration));
            }
            Command::Renew { token, reply } => {
                let _ = reply.send(self.renew(token));
            }
            Command::Deregister { token, reply } => {
                let _ = reply.send(self.deregister(token));
            }
            Command::Lookup { name, reply } => {
                let _ = reply.send(self.records.get(&name).map(|s| s.record.clone()));
            }
            Command::Query { capability, reply } => {
                let records = self
                    .records
                    .values()
                    .filter(|s| {
                        s.record.state.is_routable() && s.record.capabilities.contains(&capability)
                    })
                    .map(|s| s.record.clone())
                    .collect();
                let _ = reply.send(records);
            }
            Command::List { reply } => {
                let mut records: Vec<AgentRecord> =
                    self.records.values().map(|s| s.record.clone()).collect();
                records.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(records);
            }
            Command::SetState { name, state, reply } => {
                let _ = reply.send(self.set_state(&name, state));
            }
            Command::SetCircuit { name, circuit } => {
                if let Some(stored) = self.records.get_mut(&name) {
                    stored.record.circuit_state = circuit;
                }
            }
            Command::ProbeResult { name, healthy, at } => {
                if let Some(stored) = self.records.get_mut(&name) {
                    if healthy {
                        stored.record.last_health_ts = Some(at);
                        stored.record.consecutive_failures = 0;
                    } else {
                        stored.record.consecutive_failures =
                            stored.record.consecutive_failures.saturating_add(1);
                    }
                }
            }
            Command::NoteRestart { name } => {
                if let Some(stored) = self.records.get_mut(&name) {
                    stored.record.restart_count = stored.record.restart_count.saturating_add(1);
                }
            }
            Command::SnapshotNow { reply } => {
                let result = self.persist().map(|()| self.generation).map_err(|source| {
                    RegistryError::Snapshot {
                        source: anyhow::Error::new(source),
                    }
                });
                let _ = reply.send(result);
            }
        }
    }

    fn register(&mut self, registration: Registration) -> Result<LeaseToken, RegistryError> {
        if self.manifest.current().get(&registration.name).is_none() {
            return Err(RegistryError::UnknownAgent {
                name: registration.name,
            });
        }

        let now = Instant::now();
        if let Some(stored) = self.records.get(&registration.name) {
            if let Some(lease) = &stored.lease {
                let live = lease.expires_at > now;
                if live && stored.record.endpoint != registration.endpoint {
                    return Err(RegistryError::LeaseHeld {
                        name: registration.name,
                        endpoint: stored.record.endpoint.clone(),
                    });
                }
            }
        }

        let token = LeaseToken::generate();
        let endpoint_changed = self
            .records
            .get(&registration.name)
            .is_some_and(|s| s.record.endpoint != registration.endpoint);
        let previous_state = self.records.get(&registration.name).map(|s| s.record.state);

        let record = AgentRecord {
            name: registration.name.clone(),
            endpoint: registration.endpoint.clone(),
            health_endpoint: registration.health_endpoint.clone(),
            capabilities: registration.capabilities.clone(),
            state: AgentState::Starting,
            pid: registration.pid,
            started_at: epoch_millis(),
            last_health_ts: None,
            consecutive_failures: 0,
            restart_count: self
                .records
                .get(&registration.name)
                .map_or(0, |s| s.record.restart_count),
            circuit_state: CircuitState::Closed,
        };

        self.records.insert(
            registration.name.clone(),
            Stored {
                record,
                lease: Some(Lease {
                    token,
                    expires_at: now + self.config.lease_ttl,
                }),
            },
        );

        self.emit(
            registration.name.clone(),
            ChangeKind::Registered {
                endpoint: registration.endpoint.clone(),
            },
        );
        if endpoint_changed {
            self.emit(
                registration.name.clone(),
                ChangeKind::EndpointChanged {
                    endpoint: registration.endpoint,
                },
            );
        }
        if previous_state != Some(AgentState::Starting) {
            self.emit(
                registration.name,
                ChangeKind::StateChanged {
                    from: previous_state.unwrap_or(AgentState::Pending),
                    to: AgentState::Starting,
                },
            );
        }

        Ok(token)
    }

    fn renew(&mut self, token: LeaseToken) -> Result<RenewOutcome, RegistryError> {
        let now = Instant::now();
        for stored in self.records.values_mut() {
            if let Some(lease) = &mut stored.lease {
                if lease.token == token {
                    if lease.expires_at <= now {
                        return Ok(RenewOutcome::Expired);
                    }
                    lease.expires_at = now + self.config.lease_ttl;
                    return Ok(RenewOutcome::Ok);
                }
            }
        }
        Err(RegistryError::UnknownLease { token })
    }

    fn deregister(&mut self, token: LeaseToken) -> Result<(), RegistryError> {
        let name = self
            .records
            .iter()
            .find(|(_, s)| s.lease.as_ref().is_some_and(|l| l.token == token))
            .map(|(name, _)| name.clone())
            .ok_or(RegistryError::UnknownLease { token })?;

        if let Some(stored) = self.records.get_mut(&name) {
            stored.lease = None;
            let from = stored.record.state;
            stored.record.state = AgentState::Stopped;
            self.emit(name.clone(), ChangeKind::Deregistered);
            if from != AgentState::Stopped {
                self.emit(
                    name,
                    ChangeKind::StateChanged {
                        from,
                        to: AgentState::Stopped,
                    },
                );
            }
        }
        Ok(())
    }

    fn set_state(&mut self, name: &AgentName, state: AgentState) -> Result<(), RegistryError> {
        let stored = self
            .records
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownAgent { name: name.clone() })?;
        let from = stored.record.state;
        if from == state {
            return Ok(());
        }
        stored.record.state = state;
        self.emit(name.clone(), ChangeKind::StateChanged { from, to: state });
        Ok(())
    }

    fn sweep_leases(&mut self) {
        let now = Instant::now();

        // After the bootstrap window, restored endpoints that never
        // re-registered are stale; drop them rather than route to ghosts.
        if self.bootstrap_deadline.is_some_and(|deadline| now >= deadline) {
            self.bootstrap_deadline = None;
            for name in std::mem::take(&mut self.restored) {
                let never_returned = self
                    .records
                    .get(&name)
                    .is_some_and(|s| s.lease.is_none() && s.record.state == AgentState::Unreachable);
                if never_returned {
                    warn!(agent = %name, "bootstrap window closed without re-registration");
                    self.records.remove(&name);
                    self.emit(name, ChangeKind::Deregistered);
                }
            }
        }
        let expired: Vec<AgentName> = self
            .records
            .iter()
            .filter(|(_, s)| {
                s.lease.as_ref().is_some_and(|l| l.expires_at <= now)
                    && !s.record.state.is_terminal()
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            if let Some(stored) = self.records.get_mut(&name) {
                stored.lease = None;
                let from = stored.record.state;
                stored.record.state = AgentState::Unreachable;
                warn!(agent = %name, "lease expired without renewal");
                self.emit(name.clone(), ChangeKind::LeaseExpired);
                if from != AgentState::Unreachable {
                    self.emit(
                        name,
                        ChangeKind::StateChanged {
                            from,
                            to: AgentState::Unreachable,
                        },
                    );
                }
            }
        }
    }

    fn persist(&mut self) -> Result<(), snapshot::SnapshotError> {
        self.generation += 1;
        let file = snapshot::SnapshotFile {
            generation: self.generation,
            saved_at: epoch_millis(),
            records: self.records.values().map(|s| s.record.clone()).collect(),
        };
        snapshot::write(&self.config.snapshot_path, &file)
    }

    fn emit(&mut self, name: AgentName, kind: ChangeKind) {
        self.seq += 1;
        let _ = self.events.send(ChangeEvent {
            seq: self.seq,
            name,
            kind,
            at: epoch_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_str;
    use crate::domain_types::PortNumber;

    fn manifest() -> Arc<Manifest> {
        let doc = r#"
agents:
  echo-agent:
    host_class: main_pc
    port: 7201
    health_port: 8201
    launch_cmd: [agent]
    required: true
    capabilities: [stt]
profiles:
  core: {}
"#;
        Arc::new(load_str(doc, "core").unwrap())
    }

    fn test_config(dir: &tempfile::TempDir) -> RegistryConfig {
        RegistryConfig {
            lease_ttl: Duration::from_millis(200),
            snapshot_interval: Duration::from_secs(3600),
            snapshot_path: dir.path().join("registry.snapshot.json"),
            bootstrap_window: Duration::from_secs(20),
            channel_capacity: ChannelCapacity::default(),
        }
    }

    fn registration(name: &str, port: u16) -> Registration {
        Registration {
            name: AgentName::try_new(name.to_string()).unwrap(),
            endpoint: Endpoint::local(PortNumber::try_new(port).unwrap()),
            health_endpoint: Endpoint::local(PortNumber::try_new(port + 1000).unwrap()),
            capabilities: vec![CapabilityName::try_new("stt".to_string()).unwrap()],
            pid: Some(4242),
        }
    }

    #[tokio::test]
    async fn register_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(manifest(), test_config(&dir));
        let token = handle.register(registration("echo-agent", 7201)).await.unwrap();

        let name = AgentName::try_new("echo-agent".to_string()).unwrap();
        let record = handle.lookup(name).await.unwrap().unwrap();
        assert_eq!(record.state, AgentState::Starting);
        assert_eq!(record.pid, Some(4242));

        assert_eq!(handle.renew(token).await.unwrap(), RenewOutcome::Ok);
    }

    #[tokio::test]
    async fn rejects_names_outside_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(manifest(), test_config(&dir));
        // Build a registration for a name the manifest does not declare.
        let mut reg = registration("echo-agent", 7201);
        reg.name = AgentName::try_new("intruder".to_string()).unwrap();
        assert!(matches!(
            handle.register(reg).await.unwrap_err(),
            RegistryError::UnknownAgent { .. }
        ));
    }

    #[tokio::test]
    async fn same_endpoint_reregistration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(manifest(), test_config(&dir));
        let first = handle.register(registration("echo-agent", 7201)).await.unwrap();
        let second = handle.register(registration("echo-agent", 7201)).await.unwrap();
        assert_ne!(first, second);
        // Only the latest token renews.
        assert!(matches!(
            handle.renew(first).await.unwrap_err(),
            RegistryError::UnknownLease { .. }
        ));
        assert_eq!(handle.renew(second).await.unwrap(), RenewOutcome::Ok);
    }

    #[tokio::test]
    async fn conflicting_endpoint_rejected_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(manifest(), test_config(&dir));
        handle.register(registration("echo-agent", 7201)).await.unwrap();

        let err = handle
            .register(registration("echo-agent", 7205))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::LeaseHeld { .. }));

        // After the 200ms lease lapses, last writer wins.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.register(registration("echo-agent", 7205)).await.is_ok());
    }

    #[tokio::test]
    async fn expiry_transitions_to_unreachable_and_emits() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(manifest(), test_config(&dir));
        let mut watch = handle.watch();
        handle.register(registration("echo-agent", 7201)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        let name = AgentName::try_new("echo-agent".to_string()).unwrap();
        let record = handle.lookup(name.clone()).await.unwrap().unwrap();
        assert_eq!(record.state, AgentState::Unreachable);

        let mut saw_expiry = false;
        while let Ok(event) = watch.try_recv() {
            if matches!(event.kind, ChangeKind::LeaseExpired) {
                saw_expiry = true;
            }
        }
        assert!(saw_expiry);
    }

    #[tokio::test]
    async fn query_returns_only_routable_records() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(manifest(), test_config(&dir));
        handle.register(registration("echo-agent", 7201)).await.unwrap();
        let cap = CapabilityName::try_new("stt".to_string()).unwrap();

        // Starting is not routable.
        assert!(handle.query(cap.clone()).await.unwrap().is_empty());

        let name = AgentName::try_new("echo-agent".to_string()).unwrap();
        handle.set_state(name, AgentState::Ready).await.unwrap();
        assert_eq!(handle.query(cap).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_for_one_name_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(manifest(), test_config(&dir));
        let mut watch = handle.watch();
        handle.register(registration("echo-agent", 7201)).await.unwrap();
        let name = AgentName::try_new("echo-agent".to_string()).unwrap();
        handle.set_state(name.clone(), AgentState::Ready).await.unwrap();
        handle
            .set_state(name, AgentState::Degraded)
            .await
            .unwrap();

        let mut seqs = Vec::new();
        while let Ok(event) = watch.try_recv() {
            seqs.push(event.seq);
        }
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
        assert!(seqs.len() >= 3);
    }

    #[tokio::test]
    async fn snapshot_restores_unreachable_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        {
            let handle = spawn(manifest(), config.clone());
            handle.register(registration("echo-agent", 7201)).await.unwrap();
            let name = AgentName::try_new("echo-agent".to_string()).unwrap();
            handle.set_state(name, AgentState::Ready).await.unwrap();
            let generation = handle.snapshot_now().await.unwrap();
            assert_eq!(generation, 1);
        }

        let handle = spawn(manifest(), config);
        let name = AgentName::try_new("echo-agent".to_string()).unwrap();
        let record = handle.lookup(name).await.unwrap().unwrap();
        // Restored endpoints are last-known; state is conservative.
        assert_eq!(record.state, AgentState::Unreachable);
        assert_eq!(record.endpoint.port.as_u16(), 7201);

        // Generation keeps rising across restarts.
        assert_eq!(handle.snapshot_now().await.unwrap(), 2);
    }
}

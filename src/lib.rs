//! # Flotilla - Distributed Agent Orchestration Platform
//!
//! Flotilla coordinates a fleet of long-lived agent processes across a pair
//! of hosts: declarative startup from a unified YAML config, a single-writer
//! service registry with lease-based liveness, a health hub with per-target
//! circuit breakers, a request coordinator with hybrid LLM routing, a lazy
//! loader for on-demand agents, and a supervisor that restarts what falls
//! over and drains what must stop.
//!
//! ## Architecture
//!
//! ```text
//! config -> plan -> supervisor -> agent processes (runtime harness)
//!                        |              |
//!                        v              v registers
//!  coordinator <----- registry <---- health hub (probes, breakers, alerts)
//!       |  \
//!       |   -> lazy loader -> supervisor.start
//!       -> hybrid LLM router (local | remote)
//! ```
//!
//! The supervisor binary (`flotilla`) hosts the core services; fleet agents
//! link the [`runtime`] harness (see the `flotilla-agent` binary for the
//! generic echo agent used by smoke tests and examples).

pub mod config;
pub mod coordinator;
pub mod domain_types;
pub mod error;
pub mod hub;
pub mod lazy;
pub mod llm_router;
pub mod observability;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod resilience;
pub mod runtime;
pub mod server;
pub mod supervisor;

pub use crate::config::{load, load_str, validate, AgentSpec, GlobalSettings, Manifest};
pub use crate::domain_types::{AgentName, AgentState, CapabilityName, Endpoint, RequestKind};
pub use crate::error::{Classified, ErrorKind, ErrorReport, Severity};
pub use crate::orchestrator::{Orchestrator, OrchestratorError};
pub use crate::plan::{plan, StartupPlan};
pub use crate::resilience::{Bulkhead, CircuitBreaker, CircuitState, GracefulShutdown};

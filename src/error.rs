//! Error taxonomy shared across the orchestration substrate
//!
//! Every component wraps its underlying I/O failures into one of the kinds
//! defined here, preserving the cause. Kinds travel on the wire (error bus,
//! task responses) and drive retry policy; the typed error enums of each
//! subsystem map into a kind via [`Classified::kind`].

use crate::domain_types::{epoch_millis, TraceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire-level error classification
///
/// Kinds, not types: each subsystem keeps its own `thiserror` enum and maps
/// it here for routing, retry decisions, and the error bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed config, duplicates, bad references; fatal at load time
    Config,
    /// Cycles or cross-tier dependencies; fatal at plan time
    Plan,
    /// Port unavailable; recoverable by supervisor retry
    Bind,
    /// Registry unreachable during boot
    Registration,
    /// Probe did not answer within budget
    HealthTimeout,
    /// Probe answered with an error status
    HealthError,
    /// Target not routable or circuit open
    Unavailable,
    /// Deadline exceeded
    Timeout,
    /// Bulkhead full
    Overloaded,
    /// Per-source quota exceeded
    RateLimited,
    /// Explicitly retryable by downstream, carries a cause
    Retryable,
    /// Non-recoverable; propagated as-is
    Fatal,
}

impl ErrorKind {
    /// Whether the coordinator retry policy may re-attempt this kind
    ///
    /// `Timeout` is additionally gated on the request kind being idempotent;
    /// that check lives at the dispatch site.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable | Self::Timeout | Self::Retryable)
    }

    /// Whether this kind terminates the producing process
    #[must_use]
    pub fn is_process_fatal(self) -> bool {
        matches!(self, Self::Config | Self::Plan | Self::Fatal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Plan => "plan",
            Self::Bind => "bind",
            Self::Registration => "registration",
            Self::HealthTimeout => "health_timeout",
            Self::HealthError => "health_error",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Overloaded => "overloaded",
            Self::RateLimited => "rate_limited",
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Severity attached to error bus reports
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Info,
    /// Degradation worth attention
    #[default]
    Warning,
    /// Operation failed
    Error,
    /// Fleet-level failure
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// Structured report published to the error bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Taxonomy kind
    pub kind: ErrorKind,
    /// Severity of the event
    pub severity: Severity,
    /// Component or agent that produced the report
    pub source: String,
    /// Free-form key/value context
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Trace the report belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Epoch milliseconds at emission
    pub emitted_at: u64,
}

impl ErrorReport {
    /// Creates a report stamped with the current time
    #[must_use]
    pub fn new(kind: ErrorKind, severity: Severity, source: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            source: source.into(),
            context: BTreeMap::new(),
            trace_id: None,
            emitted_at: epoch_millis(),
        }
    }

    /// Attaches a context entry
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attaches a trace ID
    #[must_use]
    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
}

/// Errors that can state which taxonomy kind they belong to
pub trait Classified {
    /// The wire-level kind this error maps to
    fn kind(&self) -> ErrorKind;
}

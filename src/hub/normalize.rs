//! Ingress normalizer for health probe responses
//!
//! The core mandates the canonical lowercase [`HealthReport`]; this module
//! tolerates the legacy variants still seen during migration ("HEALTHY",
//! "OK", "UP", reports nested under a `health` or `status` object) and maps
//! them to canonical form. Producers must emit canonical reports; tolerance
//! is strictly an ingress concern.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain_types::HealthStatus;

/// Canonical health report returned by every probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Canonical lowercase status
    pub status: HealthStatus,
    /// Reporting agent's name
    #[serde(default)]
    pub name: String,
    /// Seconds since the agent started
    #[serde(default)]
    pub uptime_seconds: u64,
    /// Agent build version
    #[serde(default)]
    pub version: String,
    /// Live subset of declared capabilities
    #[serde(default)]
    pub capabilities_live: Vec<String>,
    /// Optional resource gauges
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<BTreeMap<String, f64>>,
    /// Opaque details map
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

/// Maps an arbitrary probe response body to a canonical report
///
/// Returns `None` when no status can be extracted at all; the probe is then
/// counted as a health error.
#[must_use]
pub fn normalize(value: &Value) -> Option<HealthReport> {
    // Fast path: already canonical.
    if let Ok(report) = serde_json::from_value::<HealthReport>(value.clone()) {
        return Some(report);
    }

    let object = unwrap_legacy_nesting(value)?;

    let status = object
        .get("status")
        .or_else(|| object.get("state"))
        .or_else(|| object.get("health"))
        .and_then(Value::as_str)
        .and_then(normalize_status)?;

    let name = object
        .get("name")
        .or_else(|| object.get("agent"))
        .or_else(|| object.get("service"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let uptime_seconds = object
        .get("uptime_seconds")
        .or_else(|| object.get("uptime"))
        .and_then(coerce_u64)
        .unwrap_or(0);

    let version = object
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let capabilities_live = object
        .get("capabilities_live")
        .or_else(|| object.get("capabilities"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let details = object
        .get("details")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Some(HealthReport {
        status,
        name,
        uptime_seconds,
        version,
        capabilities_live,
        resource_usage: None,
        details,
    })
}

/// Legacy agents sometimes wrap the report: `{"status": {"status": "OK"}}`
/// or `{"health": {...}}`.
fn unwrap_legacy_nesting(value: &Value) -> Option<&serde_json::Map<String, Value>> {
    let object = value.as_object()?;
    for key in ["health", "status"] {
        if let Some(inner) = object.get(key).and_then(Value::as_object) {
            if inner.contains_key("status") || inner.contains_key("state") {
                return Some(inner);
            }
        }
    }
    Some(object)
}

fn normalize_status(raw: &str) -> Option<HealthStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "ok" | "healthy" | "up" | "ready" | "success" | "running" => Some(HealthStatus::Ok),
        "degraded" | "warning" | "partial" => Some(HealthStatus::Degraded),
        "error" | "unhealthy" | "down" | "failed" | "failure" => Some(HealthStatus::Error),
        _ => None,
    }
}

fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

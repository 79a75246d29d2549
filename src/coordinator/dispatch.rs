//! Dispatch client: delivering a task to an agent endpoint
//!
//! Behind a trait so the coordinator, LLM router, and tests can share retry
//! and breaker logic against scripted outcomes. The production implementation
//! speaks JSON over HTTP with a per-attempt timeout.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::domain_types::Endpoint;
use crate::error::{Classified, ErrorKind};

use super::TaskRequest;

/// Failures from a single dispatch attempt
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The attempt exceeded its timeout
    #[error("dispatch timed out after {timeout_ms}ms")]
    Timeout {
        /// The per-attempt timeout that elapsed
        timeout_ms: u64,
    },

    /// The target could not be reached
    #[error("target unreachable: {detail}")]
    Unreachable {
        /// Transport-level detail
        detail: String,
    },

    /// The target answered with a structured error
    #[error("target rejected request ({kind}): {message}")]
    Rejected {
        /// Taxonomy kind from the response body
        kind: ErrorKind,
        /// Error message from the target
        message: String,
    },

    /// The target answered with an unparsable body
    #[error("target response malformed: {detail}")]
    Malformed {
        /// What was wrong
        detail: String,
    },
}

impl Classified for DispatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Unreachable { .. } => ErrorKind::Unavailable,
            Self::Rejected { kind, .. } => *kind,
            Self::Malformed { .. } => ErrorKind::Fatal,
        }
    }
}

/// Delivery seam between routing and the wire
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Sends the task to the endpoint, bounded by the attempt timeout
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        request: &TaskRequest,
        timeout: Duration,
    ) -> Result<Value, DispatchError>;
}

/// Production dispatcher: JSON over HTTP to the agent's request socket
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    /// Creates a dispatcher with a dedicated client
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        request: &TaskRequest,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let url = format!("{}/task", endpoint.base_url());
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    DispatchError::Unreachable {
                        detail: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                DispatchError::Malformed {
                    detail: e.to_string(),
                }
            }
        })?;

        if status.is_success() {
            return Ok(body);
        }

        // Non-2xx carries the shared error body when the target is one of
        // ours; degrade gracefully when it is not.
        let kind = body
            .get("kind")
            .cloned()
            .and_then(|k| serde_json::from_value::<ErrorKind>(k).ok())
            .unwrap_or(ErrorKind::Unavailable);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified error")
            .to_string();
        Err(DispatchError::Rejected { kind, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_classify_into_the_taxonomy() {
        assert_eq!(
            DispatchError::Timeout { timeout_ms: 10 }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            DispatchError::Unreachable {
                detail: "refused".to_string()
            }
            .kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            DispatchError::Rejected {
                kind: ErrorKind::RateLimited,
                message: "slow down".to_string()
            }
            .kind(),
            ErrorKind::RateLimited
        );
    }
}

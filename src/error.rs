//! The closed error taxonomy shared by every component.
//!
//! Every fallible operation in the engine returns `Result<T, EngineError>`. The
//! variants mirror the spec-level error kinds one-to-one so the HTTP mapping in
//! [`EngineError::status_code`] (behind the `server` feature, see `crate::http`)
//! never needs to guess.

use std::fmt;
use std::time::Duration;

/// Closed error enumeration for the orchestration engine.
///
/// Transient variants (`Timeout`, `Throttled`, `ProviderError`, `Network`) are
/// retried internally by `ModelClient`, `Researcher`, and `WorkerPool` per their
/// own ladders; by the time one escapes to a caller, retries are exhausted.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Malformed input (missing required field, invalid agent id shape, etc.).
    BadRequest(String),
    /// Webhook signature or internal bearer token failed verification.
    Unauthorized(String),
    /// Task id, conversation id, or other referenced entity does not exist.
    NotFound(String),
    /// Idempotency key collided with a live task whose inputs differ.
    Conflict(String),
    /// A limiter gate rejected the call after the caller's deadline elapsed.
    Throttled { retry_after: Duration },
    /// The overall deadline for the operation elapsed.
    Timeout,
    /// The upstream model or search provider returned a server-side error.
    ProviderError(String),
    /// The model response failed a required shape check.
    BadResponse(String),
    /// A transient network failure (connection reset, DNS failure, etc.).
    Network(String),
    /// `agent_id` is not present in the `AgentRegistry`.
    UnknownAgent(String),
    /// A delegation directive named a callee already on the current call stack.
    CycleDetected { callee: String },
    /// A delegation directive arrived at or beyond `MAX_DEPTH`.
    CycleExceeded { depth: u32, max_depth: u32 },
    /// Every source in a research run failed to fetch or summarise.
    NoSources,
    /// The task's cancellation signal fired before completion.
    Cancelled,
    /// Anything else — a bug, an invariant violation, a dependency panic boundary.
    Internal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            EngineError::NotFound(msg) => write!(f, "not found: {}", msg),
            EngineError::Conflict(msg) => write!(f, "conflict: {}", msg),
            EngineError::Throttled { retry_after } => {
                write!(f, "throttled, retry after {:?}", retry_after)
            }
            EngineError::Timeout => write!(f, "timeout"),
            EngineError::ProviderError(msg) => write!(f, "provider error: {}", msg),
            EngineError::BadResponse(msg) => write!(f, "bad response: {}", msg),
            EngineError::Network(msg) => write!(f, "network error: {}", msg),
            EngineError::UnknownAgent(id) => write!(f, "unknown agent: {}", id),
            EngineError::CycleDetected { callee } => {
                write!(f, "delegation cycle detected at {}", callee)
            }
            EngineError::CycleExceeded { depth, max_depth } => write!(
                f,
                "delegation depth {} exceeds max depth {}",
                depth, max_depth
            ),
            EngineError::NoSources => write!(f, "no sources"),
            EngineError::Cancelled => write!(f, "cancelled"),
            EngineError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Is this error one the caller may profitably retry (transient per §7)?
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout
                | EngineError::Throttled { .. }
                | EngineError::Network(_)
                | EngineError::ProviderError(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout
        } else {
            EngineError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_matches_retry_ladders() {
        assert!(EngineError::Timeout.is_transient());
        assert!(EngineError::Throttled {
            retry_after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(EngineError::Network("reset".into()).is_transient());
        assert!(EngineError::ProviderError("5xx".into()).is_transient());
        assert!(!EngineError::BadResponse("shape".into()).is_transient());
        assert!(!EngineError::UnknownAgent("ghost".into()).is_transient());
        assert!(!EngineError::CycleExceeded {
            depth: 4,
            max_depth: 3
        }
        .is_transient());
    }
}

use thiserror::Error;

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, MeshError>;

/// Error types for the agent mesh collaboration server.
///
/// Every error maps to a stable wire code so that clients can react
/// programmatically, and carries an optional structured `data` payload
/// (for example `retry_after` or the conflicting field list).
///
/// # Examples
///
/// ```rust
/// use mesh_core::error::MeshError;
///
/// let err = MeshError::not_found("task", "t-42");
/// assert_eq!(err.code(), 404);
/// assert!(!err.is_retryable());
///
/// let err = MeshError::TooManyRequests { retry_after_secs: 2 };
/// assert_eq!(err.code(), 429);
/// assert!(err.is_retryable());
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// Malformed or semantically invalid request parameters
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Missing or unusable credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated principal lacks a required capability or crosses a tenant boundary
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Entity not found within the caller's tenant
    #[error("Not found: {0}")]
    NotFound(String),

    /// State changed underneath the caller; safe to re-read and retry
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Conditional update lost the version race
    #[error("Optimistic lock failure: expected version {expected}, found {actual}")]
    OptimisticLock { expected: u64, actual: u64 },

    /// Two transactions wrote the same key
    #[error("Write-write conflict on key '{0}'")]
    WriteWriteConflict(String),

    /// Serializable validation failed for a committed transaction
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// Transaction was already committed or rolled back
    #[error("Transaction is closed")]
    TransactionClosed,

    /// Rate limit exceeded for the session's bucket
    #[error("Too many requests, retry after {retry_after_secs}s")]
    TooManyRequests { retry_after_secs: u64 },

    /// Handler or I/O deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Downstream dependency temporarily unavailable
    #[error("Service unavailable, retry after {retry_after_secs}s")]
    ServiceUnavailable { retry_after_secs: u64 },

    /// Per-session circuit breaker is open
    #[error("Circuit open, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    /// Global connection cap reached
    #[error("Connection pool is full")]
    PoolFull,

    /// Per-tenant connection cap reached
    #[error("Tenant connection limit reached for '{0}'")]
    TenantLimit(String),

    /// Per-agent connection cap reached
    #[error("Agent connection limit reached for '{0}'")]
    AgentLimit(String),

    /// Remote clock is ahead of the configured drift bound
    #[error("Clock drift of {drift_ms}ms exceeds the {max_drift_ms}ms bound")]
    ClockDrift { drift_ms: i64, max_drift_ms: i64 },

    /// Validation error with details
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Create a not found error for an entity kind and id
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} '{id}' not found"))
    }

    /// Create a forbidden error naming the missing capability
    pub fn missing_capability(capability: &str) -> Self {
        Self::Forbidden(format!("missing required capability '{capability}'"))
    }

    /// Create a forbidden error for a cross-tenant access attempt
    pub fn tenant_mismatch() -> Self {
        Self::Forbidden("entity belongs to another tenant".to_string())
    }

    /// Create a conflict error for a stale workspace or document version
    pub fn stale_version(observed: u64, current: u64) -> Self {
        Self::Conflict(format!(
            "observed version {observed} is stale, current version is {current}"
        ))
    }

    /// Check if this error indicates a not found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, MeshError::NotFound(_))
    }

    /// Check if this error indicates a conflict the caller can retry after re-reading
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            MeshError::Conflict(_)
                | MeshError::OptimisticLock { .. }
                | MeshError::WriteWriteConflict(_)
                | MeshError::SerializationFailure(_)
        )
    }

    /// Whether a retry (possibly after a delay) can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Conflict(_)
                | MeshError::OptimisticLock { .. }
                | MeshError::WriteWriteConflict(_)
                | MeshError::SerializationFailure(_)
                | MeshError::TooManyRequests { .. }
                | MeshError::Timeout(_)
                | MeshError::ServiceUnavailable { .. }
                | MeshError::CircuitOpen { .. }
        )
    }

    /// Stable wire code for error responses
    pub fn code(&self) -> i32 {
        match self {
            MeshError::InvalidParams(_) | MeshError::Validation(_) => 400,
            MeshError::Unauthorized(_) => 401,
            MeshError::Forbidden(_) => 403,
            MeshError::NotFound(_) => 404,
            MeshError::Timeout(_) => 408,
            MeshError::Conflict(_)
            | MeshError::OptimisticLock { .. }
            | MeshError::WriteWriteConflict(_)
            | MeshError::SerializationFailure(_)
            | MeshError::TransactionClosed => 409,
            MeshError::TooManyRequests { .. } => 429,
            MeshError::PoolFull | MeshError::TenantLimit(_) | MeshError::AgentLimit(_) => 429,
            MeshError::ServiceUnavailable { .. } | MeshError::CircuitOpen { .. } => 503,
            MeshError::ClockDrift { .. } => 500,
            MeshError::Internal(_) => 500,
        }
    }

    /// Structured payload attached to error responses, when the kind carries one
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            MeshError::TooManyRequests { retry_after_secs }
            | MeshError::ServiceUnavailable { retry_after_secs }
            | MeshError::CircuitOpen { retry_after_secs } => {
                Some(serde_json::json!({ "retry_after": retry_after_secs }))
            }
            MeshError::OptimisticLock { expected, actual } => {
                Some(serde_json::json!({ "expected_version": expected, "actual_version": actual }))
            }
            MeshError::ClockDrift {
                drift_ms,
                max_drift_ms,
            } => Some(serde_json::json!({ "drift_ms": drift_ms, "max_drift_ms": max_drift_ms })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(MeshError::InvalidParams("x".into()).code(), 400);
        assert_eq!(MeshError::Unauthorized("x".into()).code(), 401);
        assert_eq!(MeshError::not_found("task", "t-1").code(), 404);
        assert_eq!(
            MeshError::OptimisticLock {
                expected: 1,
                actual: 2
            }
            .code(),
            409
        );
        assert_eq!(
            MeshError::TooManyRequests {
                retry_after_secs: 1
            }
            .code(),
            429
        );
        assert_eq!(
            MeshError::ServiceUnavailable {
                retry_after_secs: 1
            }
            .code(),
            503
        );
        assert_eq!(MeshError::Internal("boom".into()).code(), 500);
    }

    #[test]
    fn test_retryability() {
        assert!(MeshError::Conflict("c".into()).is_retryable());
        assert!(MeshError::SerializationFailure("s".into()).is_retryable());
        assert!(MeshError::Timeout("t".into()).is_retryable());
        assert!(!MeshError::Forbidden("f".into()).is_retryable());
        assert!(!MeshError::InvalidParams("i".into()).is_retryable());
        assert!(!MeshError::Internal("i".into()).is_retryable());
    }

    #[test]
    fn test_error_data_payloads() {
        let err = MeshError::TooManyRequests {
            retry_after_secs: 3,
        };
        assert_eq!(err.data().unwrap()["retry_after"], 3);

        let err = MeshError::OptimisticLock {
            expected: 7,
            actual: 8,
        };
        let data = err.data().unwrap();
        assert_eq!(data["expected_version"], 7);
        assert_eq!(data["actual_version"], 8);

        assert!(MeshError::NotFound("x".into()).data().is_none());
    }

    #[test]
    fn test_error_display() {
        let err = MeshError::stale_version(7, 8);
        assert_eq!(
            format!("{err}"),
            "Conflict: observed version 7 is stale, current version is 8"
        );
    }
}

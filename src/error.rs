//! Crate-wide error type.

use thiserror::Error;

use crate::detect::incident::IncidentStatus;

pub type Result<T, E = SentinelError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SentinelError {
    /// Malformed input such as a bad decision record. Rejected, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Transient store failure; the caller skips this cycle and retries on the next.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store error: {0}")]
    Store(rusqlite::Error),

    /// An active incident already exists for the algorithm.
    #[error("algorithm '{algorithm}' already has an active incident")]
    DuplicateIncident { algorithm: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("incident {incident_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        incident_id: String,
        from: IncidentStatus,
        to: IncidentStatus,
    },

    #[error("channel '{channel}' failed: {reason}")]
    ExternalChannel { channel: String, reason: String },

    #[error("verification failed for {incident_id}: {reason}")]
    VerificationFailed { incident_id: String, reason: String },

    #[error("diagnostic agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SentinelError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Whether retrying on the next cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::AgentUnavailable(_))
    }
}

impl From<rusqlite::Error> for SentinelError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::StoreUnavailable(err.to_string())
            }
            _ => Self::Store(err),
        }
    }
}

impl From<r2d2::Error> for SentinelError {
    fn from(err: r2d2::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SentinelError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::StoreUnavailable(format!("store task aborted: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let mapped = SentinelError::from(err);
        assert!(matches!(mapped, SentinelError::StoreUnavailable(_)));
        assert!(mapped.is_transient());
    }

    #[test]
    fn test_constraint_is_not_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        let mapped = SentinelError::from(err);
        assert!(matches!(mapped, SentinelError::Store(_)));
        assert!(!mapped.is_transient());
    }
}

//! Error types for the tunnel supervision engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by registry, supervisor and store operations
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid connection: {0}")]
    Validation(String),

    #[error("Connection '{0}' already exists")]
    DuplicateName(String),

    #[error("Connection '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Connection '{0}' not found")]
    NotFound(String),

    #[error("Failed to spawn ssh for '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to terminate ssh for '{name}': {source}")]
    Terminate {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist connections to {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse error category relayed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Process,
    Persistence,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Validation => "validation error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not found",
            ErrorKind::Process => "process error",
            ErrorKind::Persistence => "persistence error",
        };
        f.write_str(label)
    }
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::Validation(_) => ErrorKind::Validation,
            TunnelError::DuplicateName(_) | TunnelError::AlreadyRunning(_) => ErrorKind::Conflict,
            TunnelError::NotFound(_) => ErrorKind::NotFound,
            TunnelError::Spawn { .. } | TunnelError::Terminate { .. } => ErrorKind::Process,
            TunnelError::Persistence { .. } => ErrorKind::Persistence,
        }
    }
}

/// Serializable failure for callers outside the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TunnelError> for ErrorPayload {
    fn from(err: &TunnelError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<TunnelError> for ErrorPayload {
    fn from(err: TunnelError) -> Self {
        Self::from(&err)
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TunnelError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            TunnelError::DuplicateName("web".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            TunnelError::AlreadyRunning("web".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            TunnelError::NotFound("web".into()).kind(),
            ErrorKind::NotFound
        );
        let spawn = TunnelError::Spawn {
            name: "web".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(spawn.kind(), ErrorKind::Process);
    }

    #[test]
    fn test_error_payload_serialization() {
        let payload = ErrorPayload::from(TunnelError::NotFound("web".into()));
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"not_found","message":"Connection 'web' not found"}"#
        );
    }
}

//! Error types for yurt-vm.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors returned by the external tool adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The tool could not be launched at all
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool exited with a nonzero status
    #[error("{program} {args} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        args: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The named resource does not exist on the tool's side
    #[error("not found: {0}")]
    NotFound(String),

    /// The tool succeeded but printed something we could not interpret
    #[error("malformed output: {0}")]
    Malformed(String),

    /// The tool did not finish in time
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The guest could not be reached over the remote channel
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    /// Whether this error means "the thing is already gone".
    ///
    /// This is the only error class an idempotent delete may swallow.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AdapterError::NotFound(_))
    }

    /// Whether the failure was caused by the remote end being unreachable
    /// rather than by a command that ran and failed.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, AdapterError::Unreachable(_) | AdapterError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(AdapterError::NotFound("rule ssh".into()).is_not_found());
        assert!(!AdapterError::Malformed("x".into()).is_not_found());
        let failed = AdapterError::CommandFailed {
            program: "VBoxManage".into(),
            args: "controlvm".into(),
            code: Some(1),
            stderr: "boom".into(),
        };
        assert!(!failed.is_not_found());
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(AdapterError::Unreachable("refused".into()).is_unreachable());
        assert!(AdapterError::Timeout(Duration::from_secs(1)).is_unreachable());
        assert!(!AdapterError::NotFound("x".into()).is_unreachable());
    }
}

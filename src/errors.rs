//! Typed errors for the run supervision subsystem.
//!
//! Only validation and process failures are visible to callers through run
//! status or HTTP responses; streaming-path failures (bad frames, artifact
//! uploads) are logged where they occur and never surface here.

use thiserror::Error;

/// Errors raised when a run request is validated and launched.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Run {id} has no script configured")]
    NoScript { id: i64 },

    #[error("Run {id} is already in progress")]
    AlreadyRunning { id: i64 },

    #[error("Failed to spawn runner process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_not_found_carries_id() {
        let err = SupervisorError::RunNotFound { id: 42 };
        match &err {
            SupervisorError::RunNotFound { id } => assert_eq!(*id, 42),
            _ => panic!("Expected RunNotFound"),
        }
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "npx not found");
        let err = SupervisorError::SpawnFailed(io_err);
        match &err {
            SupervisorError::SpawnFailed(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed"),
        }
    }

    #[test]
    fn implements_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SupervisorError::NoScript { id: 1 });
    }
}

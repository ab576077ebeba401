/// Error taxonomy for the orchestrator.
///
/// Categories mirror the teacher's `PgError`: a handful of retryable conditions,
/// a handful of fatal ones that halt the scheduler outright, and everything else
/// propagated to the caller for per-task handling.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid prompt: prompt text is empty")]
    InvalidPrompt,

    #[error("invalid status '{0}'")]
    InvalidStatus(String),

    #[error("subprocess timed out after {0:?}")]
    SubprocessTimeout(std::time::Duration),

    #[error("subprocess exited with code {0:?}")]
    SubprocessExit(Option<i32>),

    #[error("failed to spawn subprocess: {0}")]
    SpawnError(String),

    #[error("task {task} exceeded its attempt budget; last error: {last_error}")]
    MaxAttemptsExceeded { task: String, last_error: String },

    #[error("deadlock could not be resolved after {attempts} attempt(s)")]
    DeadlockUnresolvable { attempts: u32 },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Transient conditions worth retrying at the call site (Phase Runner's
    /// implement-phase retry loop, or a deadlock-resolution re-attempt).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::SubprocessTimeout(_)
                | OrchestratorError::SubprocessExit(_)
                | OrchestratorError::SpawnError(_)
        )
    }

    /// Unrecoverable conditions that should abort the whole run rather than
    /// just the task that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::MaxAttemptsExceeded { .. }
                | OrchestratorError::DeadlockUnresolvable { .. }
        )
    }
}

impl From<OrchestratorError> for String {
    fn from(err: OrchestratorError) -> String {
        err.to_string()
    }
}

impl From<String> for OrchestratorError {
    fn from(s: String) -> Self {
        OrchestratorError::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprocess_errors_are_retryable() {
        assert!(OrchestratorError::SubprocessTimeout(std::time::Duration::from_secs(900))
            .is_retryable());
        assert!(OrchestratorError::SubprocessExit(Some(1)).is_retryable());
        assert!(!OrchestratorError::InvalidPrompt.is_retryable());
    }

    #[test]
    fn exhaustion_and_deadlock_are_fatal() {
        assert!(OrchestratorError::MaxAttemptsExceeded {
            task: "a".into(),
            last_error: "boom".into()
        }
        .is_fatal());
        assert!(OrchestratorError::DeadlockUnresolvable { attempts: 3 }.is_fatal());
        assert!(!OrchestratorError::InvalidStatus("x".into()).is_fatal());
    }
}

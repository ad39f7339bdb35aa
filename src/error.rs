//! Execution pipeline error types.

use thiserror::Error;

/// Result type for execution pipeline operations.
pub type ExecResult<T> = Result<T, ExecError>;

/// Errors that can occur while accepting, executing, or reporting a run.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The executable could not be found or spawned. The run fails
    /// immediately; there is no retry.
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The overall run deadline or a prompt deadline elapsed.
    #[error("timed out after {0} seconds")]
    TimedOut(u64),

    /// The conversation already holds the maximum number of queued entries.
    /// Rejected before anything is persisted.
    #[error("queue for conversation {0} is full")]
    QueueFull(String),

    /// Stdin write attempted after the process exited.
    #[error("process is not running")]
    NotRunning,

    /// A prompt response arrived for a run that is not awaiting input.
    #[error("run {0} has no pending prompt")]
    NoPendingPrompt(i64),

    /// Output updates could not be delivered after retries. The run
    /// continues; only the status-update channel is degraded.
    #[error("output delivery degraded: {0}")]
    DeliveryDegraded(String),

    /// The requesting user is not on the allowlist.
    #[error("user {0} is not allowed")]
    Forbidden(String),

    /// The project id does not resolve to an existing working directory.
    #[error("invalid project: {0}")]
    InvalidProject(String),

    /// Run store failure. Fatal to intake: new work must not be accepted
    /// while run state cannot be persisted.
    #[error("storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExecError::QueueFull("chat-1".to_string());
        assert_eq!(err.to_string(), "queue for conversation chat-1 is full");

        let err = ExecError::TimedOut(600);
        assert_eq!(err.to_string(), "timed out after 600 seconds");
    }
}

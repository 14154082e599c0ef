use thiserror::Error;

/// Top-level error type for the Handoff engine.
///
/// `ConcurrencyDenied` and stuck sessions are deliberately absent: a denied
/// slot is an expected "try later" signal and a stuck session is a detector
/// action, neither is a failure.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// A task state change the lifecycle forbids, e.g. completing a pending task.
    #[error("Invalid transition for task {task_id}: cannot {action} while {from}")]
    InvalidTransition {
        /// Task the transition was attempted on.
        task_id: String,
        /// Status the task was in.
        from: String,
        /// Operation that was attempted.
        action: &'static str,
    },

    /// No task with the given id (or session id) is registered.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A caller supplied malformed or incomplete input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The selected provider/model is not connected right now.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Every entry of a task's fallback chain has been attempted.
    #[error("Fallback exhausted for task {task_id} (tried: {})", .tried.join(", "))]
    FallbackExhausted {
        /// Task whose chain ran out.
        task_id: String,
        /// Models attempted, in order.
        tried: Vec<String>,
    },

    /// An error reported by the host runtime (session creation, prompt, fetch).
    #[error("Host runtime error: {0}")]
    Host(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`HandoffError`].
pub type HandoffResult<T> = Result<T, HandoffError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_display() {
        let err = HandoffError::InvalidTransition {
            task_id: "bg_1".into(),
            from: "pending".into(),
            action: "complete",
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for task bg_1: cannot complete while pending"
        );
    }

    #[test]
    fn test_fallback_exhausted_lists_tried_models() {
        let err = HandoffError::FallbackExhausted {
            task_id: "bg_2".into(),
            tried: vec!["claude-opus-4-6".into(), "gpt-5.2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("bg_2"));
        assert!(msg.contains("claude-opus-4-6, gpt-5.2"));
    }
}

use crate::availability::AvailabilityOracle;
use async_trait::async_trait;
use handoff_core::{HandoffResult, ModelSelection, SessionMessage};
use serde::{Deserialize, Serialize};

/// Parameters for creating a subagent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Session of the agent that delegated the work.
    pub parent_session_id: String,
    /// Human-readable title, usually the task description.
    pub title: String,
    /// Agent persona the session runs as.
    pub agent: String,
}

/// A prompt sent into an existing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub agent: String,
    /// Model to run the prompt on; `None` lets the host pick its default.
    pub model: Option<ModelSelection>,
    pub text: String,
}

/// What the host reports about a session between polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Not generating; the last prompt has been answered.
    Idle,
    /// Generating normally.
    Busy,
    /// The provider call failed and the host is retrying it.
    Retry { attempt: u32, message: String },
    /// The session stopped on an error.
    Error { message: String },
}

impl SessionStatus {
    /// Whether the session is in a provider retry loop.
    pub fn is_retry(&self) -> bool {
        matches!(self, SessionStatus::Retry { .. })
    }
}

/// The host runtime that owns sessions, messages and provider connections.
///
/// Every host is also an [`AvailabilityOracle`]: it knows which providers
/// are connected.
#[async_trait]
pub trait HostRuntime: AvailabilityOracle {
    /// Creates a child session and returns its id.
    async fn create_session(&self, request: SessionRequest) -> HandoffResult<String>;

    /// Sends a prompt; returns once the host has accepted it, not when the
    /// model has answered.
    async fn prompt(&self, session_id: &str, request: PromptRequest) -> HandoffResult<()>;

    /// Current session status.
    async fn session_status(&self, session_id: &str) -> HandoffResult<SessionStatus>;

    /// Full message history of the session, oldest first.
    async fn messages(&self, session_id: &str) -> HandoffResult<Vec<SessionMessage>>;

    /// Requests that the session stop. Best effort.
    async fn abort(&self, session_id: &str) -> HandoffResult<()>;
}

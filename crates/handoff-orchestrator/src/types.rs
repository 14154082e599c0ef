use crate::concurrency::ConcurrencySlot;
use crate::detector::DetectorState;
use chrono::{DateTime, Utc};
use handoff_agent::{select_next, FallbackEntry, NextModel};
use handoff_core::ModelSelection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a background task.
///
/// `pending → running → {completed | error | cancelled}`; terminal states are
/// final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Registered, waiting for a concurrency slot or a session.
    Pending,
    /// Holding a slot; the subagent session exists and is working.
    Running,
    /// Finished with a result.
    Completed,
    /// Failed; `error` says whether the work failed or no model was left.
    Error,
    /// Stopped by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a task did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The delegated work itself failed (host or provider error).
    Task,
    /// No model in the task's fallback chain worked.
    FallbackExhausted,
    Cancelled,
}

/// Failure payload stored on a terminal task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Models attempted before giving up; only filled for `FallbackExhausted`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tried_models: Vec<String>,
}

impl TaskFailure {
    /// An ordinary failure carrying the host's message verbatim.
    pub fn task(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Task,
            message: message.into(),
            tried_models: Vec::new(),
        }
    }

    /// Every model in the chain has been tried.
    pub fn fallback_exhausted(task_id: &str, tried_models: Vec<String>) -> Self {
        let message = handoff_core::HandoffError::FallbackExhausted {
            task_id: task_id.to_string(),
            tried: tried_models.clone(),
        }
        .to_string();
        Self {
            kind: FailureKind::FallbackExhausted,
            message,
            tried_models,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: reason.into(),
            tried_models: Vec::new(),
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// The terminal state a task is moved to, with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    Completed(String),
    Error(TaskFailure),
    Cancelled(String),
}

impl TerminalOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TerminalOutcome::Completed(_) => TaskStatus::Completed,
            TerminalOutcome::Error(_) => TaskStatus::Error,
            TerminalOutcome::Cancelled(_) => TaskStatus::Cancelled,
        }
    }
}

/// Parameters for launching a background task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInput {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub prompt: String,
    pub agent: String,
    #[serde(default)]
    pub category: Option<String>,
    pub parent_session_id: String,
    pub parent_message_id: String,
    /// Stable concurrency key; defaults to the agent name.
    #[serde(default)]
    pub concurrency_group: Option<String>,
}

impl LaunchInput {
    pub fn new(
        description: impl Into<String>,
        prompt: impl Into<String>,
        agent: impl Into<String>,
        parent_session_id: impl Into<String>,
        parent_message_id: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            description: description.into(),
            prompt: prompt.into(),
            agent: agent.into(),
            category: None,
            parent_session_id: parent_session_id.into(),
            parent_message_id: parent_message_id.into(),
            concurrency_group: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = Some(group.into());
        self
    }

    /// The concurrency group this input resolves to.
    pub fn group(&self) -> &str {
        self.concurrency_group
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(&self.agent)
    }
}

/// Progress observed on a running task since the last poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDelta {
    /// Newly observed tool calls, added to the running total.
    pub tool_calls: u32,
    pub last_tool: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Observation time; must not precede the task's `last_update`.
    pub at: DateTime<Utc>,
}

impl ProgressDelta {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            tool_calls: 0,
            last_tool: None,
            last_message: None,
            last_message_at: None,
            at,
        }
    }
}

/// A delegated task and everything the engine knows about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    /// The subagent's own session, once created.
    pub session_id: Option<String>,
    pub parent_session_id: String,
    pub parent_message_id: String,

    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub category: Option<String>,

    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<TaskFailure>,

    pub tool_calls: u32,
    pub last_tool: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,

    /// Candidates captured at launch, never modified afterwards.
    pub fallback_chain: Vec<FallbackEntry>,
    /// Exhausting the chain is fatal for this task.
    #[serde(default)]
    pub requires_any_model: bool,
    /// Model the session is currently prompted with.
    pub model: Option<ModelSelection>,
    /// Set while a model swap is in flight.
    pub retry_since: Option<DateTime<Utc>>,
    /// Models already attempted; append-only.
    pub retry_fallback_tried_models: Vec<String>,
    pub last_msg_count: usize,
    pub stable_polls: u32,

    /// Slot held while admitted. Only the gate can mint one.
    #[serde(skip_deserializing)]
    pub concurrency_key: Option<ConcurrencySlot>,
    pub concurrency_group: String,
}

impl BackgroundTask {
    /// A fresh pending task. Input validation is the registry's job.
    pub fn new(input: LaunchInput, fallback_chain: Vec<FallbackEntry>) -> Self {
        let concurrency_group = input.group().to_string();
        Self {
            id: input
                .id
                .unwrap_or_else(|| format!("bg_{}", Uuid::new_v4().simple())),
            session_id: None,
            parent_session_id: input.parent_session_id,
            parent_message_id: input.parent_message_id,
            description: input.description,
            prompt: input.prompt,
            agent: input.agent,
            category: input.category,
            status: TaskStatus::Pending,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            tool_calls: 0,
            last_tool: None,
            last_update: None,
            last_message: None,
            last_message_at: None,
            fallback_chain,
            requires_any_model: false,
            model: None,
            retry_since: None,
            retry_fallback_tried_models: Vec::new(),
            last_msg_count: 0,
            stable_polls: 0,
            concurrency_key: None,
            concurrency_group,
        }
    }

    pub fn with_requires_any_model(mut self, requires_any_model: bool) -> Self {
        self.requires_any_model = requires_any_model;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// First chain entry whose model has not been tried yet.
    pub fn next_fallback(&self) -> NextModel {
        select_next(&self.fallback_chain, &self.retry_fallback_tried_models)
    }

    /// Counters the stuck detector works from.
    pub fn detector_state(&self) -> DetectorState {
        DetectorState {
            last_msg_count: self.last_msg_count,
            stable_polls: self.stable_polls,
            retry_since: self.retry_since,
            tried_models: self.retry_fallback_tried_models.clone(),
        }
    }

    /// Whether a swap has been requested and the new model has not spoken yet.
    pub fn swap_in_flight(&self) -> bool {
        self.retry_since.is_some()
    }
}

/// Filter for [`crate::TaskRegistry::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub concurrency_group: Option<String>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn parent(parent_session_id: impl Into<String>) -> Self {
        Self {
            parent_session_id: Some(parent_session_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &BackgroundTask) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self
                .parent_session_id
                .as_deref()
                .map_or(true, |p| task.parent_session_id == p)
            && self.agent.as_deref().map_or(true, |a| task.agent == a)
            && self
                .concurrency_group
                .as_deref()
                .map_or(true, |g| task.concurrency_group == g)
    }
}

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
}

impl TaskSummary {
    pub(crate) fn count(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Error => self.error += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}

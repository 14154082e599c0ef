use crate::concurrency::ConcurrencySlot;
use crate::detector::DetectorState;
use crate::types::{
    BackgroundTask, LaunchInput, ProgressDelta, TaskFailure, TaskFilter, TaskStatus,
    TaskSummary, TerminalOutcome,
};
use chrono::Utc;
use handoff_agent::ResolvedSlots;
use handoff_core::{HandoffError, HandoffResult, ModelSelection};
use std::collections::HashMap;
use tracing::info;

/// Authoritative in-memory store of background tasks.
///
/// Every mutation clones the record, edits the clone, and swaps it back in,
/// so a reader never sees a half-applied update. Once a task is terminal,
/// every write other than a slot release or a re-attach is rejected.
pub struct TaskRegistry {
    tasks: HashMap<String, BackgroundTask>,
}

fn invalid(task: &BackgroundTask, action: &'static str) -> HandoffError {
    HandoffError::InvalidTransition {
        task_id: task.id.clone(),
        from: task.status.to_string(),
        action,
    }
}

fn require_non_empty(field: &str, value: &str) -> HandoffResult<()> {
    if value.trim().is_empty() {
        return Err(HandoffError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

impl TaskRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Registers a pending task with its resolved fallback chain.
    pub fn create(&mut self, input: LaunchInput, slots: ResolvedSlots) -> HandoffResult<String> {
        require_non_empty("description", &input.description)?;
        require_non_empty("prompt", &input.prompt)?;
        require_non_empty("agent", &input.agent)?;
        require_non_empty("parent_session_id", &input.parent_session_id)?;
        require_non_empty("parent_message_id", &input.parent_message_id)?;
        if let Some(id) = &input.id {
            require_non_empty("id", id)?;
            if self.tasks.contains_key(id) {
                return Err(HandoffError::InvalidInput(format!(
                    "task id '{id}' already registered"
                )));
            }
        }

        let task = BackgroundTask::new(input, slots.entries)
            .with_requires_any_model(slots.requires_any_model);
        let id = task.id.clone();
        info!(
            task_id = %id,
            agent = %task.agent,
            group = %task.concurrency_group,
            candidates = task.fallback_chain.len(),
            "Task queued"
        );
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    fn update<F>(&mut self, id: &str, apply: F) -> HandoffResult<&BackgroundTask>
    where
        F: FnOnce(&mut BackgroundTask) -> HandoffResult<()>,
    {
        let current = self
            .tasks
            .get(id)
            .ok_or_else(|| HandoffError::TaskNotFound(id.to_string()))?;
        let mut next = current.clone();
        apply(&mut next)?;
        self.tasks.insert(id.to_string(), next);
        self.tasks
            .get(id)
            .ok_or_else(|| HandoffError::TaskNotFound(id.to_string()))
    }

    /// `pending → running` once the subagent session exists.
    pub fn mark_running(&mut self, id: &str, session_id: &str) -> HandoffResult<&BackgroundTask> {
        require_non_empty("session_id", session_id)?;
        self.update(id, |task| {
            if task.status != TaskStatus::Pending {
                return Err(invalid(task, "start"));
            }
            task.status = TaskStatus::Running;
            task.session_id = Some(session_id.to_string());
            if task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            info!(task_id = %task.id, session_id, "Task running");
            Ok(())
        })
    }

    /// `running → pending` for a task whose session was never created.
    pub fn requeue(&mut self, id: &str) -> HandoffResult<&BackgroundTask> {
        self.update(id, |task| {
            if task.status != TaskStatus::Running || task.session_id.is_some() {
                return Err(invalid(task, "requeue"));
            }
            task.status = TaskStatus::Pending;
            Ok(())
        })
    }

    /// Moves a task to a terminal state, storing `result` or `error`.
    ///
    /// Completion requires `running`. Errors and cancellation are also
    /// accepted from `pending`, since a queued task can be cancelled or fail
    /// to get a session. Terminal tasks reject every outcome.
    pub fn mark_terminal(
        &mut self,
        id: &str,
        outcome: TerminalOutcome,
    ) -> HandoffResult<&BackgroundTask> {
        self.update(id, |task| {
            let allowed = match outcome {
                TerminalOutcome::Completed(_) => task.status == TaskStatus::Running,
                TerminalOutcome::Error(_) | TerminalOutcome::Cancelled(_) => {
                    !task.status.is_terminal()
                }
            };
            if !allowed {
                return Err(invalid(task, "finish"));
            }

            task.status = outcome.status();
            task.completed_at = Some(Utc::now());
            task.retry_since = None;
            match outcome {
                TerminalOutcome::Completed(result) => {
                    task.result = Some(result);
                    task.error = None;
                }
                TerminalOutcome::Error(failure) => {
                    task.result = None;
                    task.error = Some(failure);
                }
                TerminalOutcome::Cancelled(reason) => {
                    task.result = None;
                    task.error = Some(TaskFailure::cancelled(reason));
                }
            }
            info!(task_id = %task.id, status = %task.status, "Task finished");
            Ok(())
        })
    }

    /// Applies observed progress to a running task.
    pub fn record_progress(
        &mut self,
        id: &str,
        delta: ProgressDelta,
    ) -> HandoffResult<&BackgroundTask> {
        self.update(id, |task| {
            if task.status != TaskStatus::Running {
                return Err(invalid(task, "record progress"));
            }
            if task.last_update.is_some_and(|last| delta.at < last) {
                return Err(HandoffError::InvalidInput(format!(
                    "stale progress for task {}",
                    task.id
                )));
            }
            task.tool_calls = task.tool_calls.saturating_add(delta.tool_calls);
            if delta.last_tool.is_some() {
                task.last_tool = delta.last_tool;
            }
            if delta.last_message.is_some() {
                task.last_message = delta.last_message;
                task.last_message_at = delta.last_message_at.or(Some(delta.at));
            }
            task.last_update = Some(delta.at);
            Ok(())
        })
    }

    /// Points a task at a new parent message on resume. A non-empty
    /// `prompt` replaces the stored one.
    pub fn reattach(
        &mut self,
        id: &str,
        parent_session_id: &str,
        parent_message_id: &str,
        prompt: Option<&str>,
    ) -> HandoffResult<&BackgroundTask> {
        require_non_empty("parent_session_id", parent_session_id)?;
        require_non_empty("parent_message_id", parent_message_id)?;
        self.update(id, |task| {
            task.parent_session_id = parent_session_id.to_string();
            task.parent_message_id = parent_message_id.to_string();
            if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
                task.prompt = prompt.to_string();
            }
            Ok(())
        })
    }

    /// Stores the detector counters after a tick. Tried models only grow.
    pub fn apply_detector_state(
        &mut self,
        id: &str,
        state: DetectorState,
    ) -> HandoffResult<&BackgroundTask> {
        self.update(id, |task| {
            if task.status != TaskStatus::Running {
                return Err(invalid(task, "update detector state"));
            }
            task.last_msg_count = state.last_msg_count;
            task.stable_polls = state.stable_polls;
            task.retry_since = state.retry_since;
            for model in state.tried_models {
                if !task.retry_fallback_tried_models.contains(&model) {
                    task.retry_fallback_tried_models.push(model);
                }
            }
            Ok(())
        })
    }

    /// Appends a model to the tried set; repeated calls are no-ops.
    pub fn note_tried_model(&mut self, id: &str, model: &str) -> HandoffResult<&BackgroundTask> {
        self.update(id, |task| {
            if task.status.is_terminal() {
                return Err(invalid(task, "record tried model"));
            }
            if !task.retry_fallback_tried_models.iter().any(|m| m == model) {
                task.retry_fallback_tried_models.push(model.to_string());
            }
            Ok(())
        })
    }

    /// Records the model the session is now prompted with.
    pub fn set_model(
        &mut self,
        id: &str,
        model: ModelSelection,
    ) -> HandoffResult<&BackgroundTask> {
        self.update(id, |task| {
            if task.status.is_terminal() {
                return Err(invalid(task, "switch model"));
            }
            task.model = Some(model);
            Ok(())
        })
    }

    /// Marks a swap as in flight without running the detector, used when a
    /// host error forces a model change.
    pub fn begin_swap(&mut self, id: &str) -> HandoffResult<&BackgroundTask> {
        self.update(id, |task| {
            if task.status != TaskStatus::Running {
                return Err(invalid(task, "swap model"));
            }
            task.retry_since = Some(Utc::now());
            task.stable_polls = 0;
            Ok(())
        })
    }

    /// Hands a gate-issued slot to a pending task.
    pub fn assign_slot(&mut self, id: &str, slot: ConcurrencySlot) -> HandoffResult<&BackgroundTask> {
        self.update(id, |task| {
            if task.status != TaskStatus::Pending || task.concurrency_key.is_some() {
                return Err(invalid(task, "admit"));
            }
            task.concurrency_key = Some(slot);
            Ok(())
        })
    }

    /// Removes and returns the task's slot so the caller can release it.
    pub fn take_slot(&mut self, id: &str) -> HandoffResult<Option<ConcurrencySlot>> {
        let mut slot = None;
        self.update(id, |task| {
            slot = task.concurrency_key.take();
            Ok(())
        })?;
        Ok(slot)
    }

    /// The task with this id.
    pub fn get(&self, id: &str) -> Option<&BackgroundTask> {
        self.tasks.get(id)
    }

    /// The task running in the given subagent session.
    pub fn find_by_session(&self, session_id: &str) -> Option<&BackgroundTask> {
        self.tasks
            .values()
            .find(|t| t.session_id.as_deref() == Some(session_id))
    }

    /// Matching tasks, oldest first.
    pub fn list(&self, filter: &TaskFilter) -> Vec<&BackgroundTask> {
        let mut tasks: Vec<&BackgroundTask> =
            self.tasks.values().filter(|t| filter.matches(t)).collect();
        tasks.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Ids of pending tasks in `group`, oldest first.
    pub fn pending_in_group(&self, group: &str) -> Vec<String> {
        let filter = TaskFilter {
            status: Some(TaskStatus::Pending),
            concurrency_group: Some(group.to_string()),
            ..TaskFilter::default()
        };
        self.list(&filter).into_iter().map(|t| t.id.clone()).collect()
    }

    /// Task counts per status.
    pub fn summary(&self) -> TaskSummary {
        let mut summary = TaskSummary::default();
        for task in self.tasks.values() {
            summary.count(task.status);
        }
        summary
    }

    /// Number of registered tasks, terminal ones included.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

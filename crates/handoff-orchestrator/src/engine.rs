use crate::concurrency::ConcurrencyGate;
use crate::config::HandoffConfig;
use crate::detector::{DetectorAction, Observation, StuckDetector};
use crate::registry::TaskRegistry;
use crate::transcript::{Transcript, TranscriptQuery};
use crate::types::{
    BackgroundTask, LaunchInput, ProgressDelta, TaskFailure, TaskFilter, TaskStatus, TaskSummary,
    TerminalOutcome,
};
use chrono::{DateTime, Utc};
use handoff_agent::{
    is_retryable, Availability, FallbackCatalog, FallbackEntry, FallbackResolver, HostRuntime,
    NextModel, PromptRequest, ResolveTarget, SessionRequest, SessionStatus,
};
use handoff_core::{HandoffError, HandoffResult, ModelSelection, SessionMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Re-attaches a caller to an existing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInput {
    /// Task id, or the id of the task's subagent session.
    pub task: String,
    /// Follow-up prompt. For a running task it is sent into the session;
    /// for a pending one it replaces the queued prompt.
    #[serde(default)]
    pub prompt: String,
    /// Session the caller resumes from.
    pub parent_session_id: String,
    /// Message the task now reports back to.
    pub parent_message_id: String,
}

/// What `launch` reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    /// Task id, generated unless the caller supplied one.
    pub id: String,
    /// Absent while the task waits for a concurrency slot.
    pub session_id: Option<String>,
    /// Status right after the launch attempt.
    pub status: TaskStatus,
}

/// What `resume` reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeOutcome {
    /// Id of the resolved task.
    pub id: String,
    /// Status after the resume.
    pub status: TaskStatus,
}

/// Marks a task as being polled. Dropping the guard clears the mark.
struct TickGuard<'a> {
    ticking: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> TickGuard<'a> {
    /// `None` when another poll of the same task is still in flight.
    fn try_acquire(ticking: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        if !ticking.lock().insert(id.to_string()) {
            return None;
        }
        Some(Self {
            ticking,
            id: id.to_string(),
        })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.ticking.lock().remove(&self.id);
    }
}

/// Runs delegated tasks against the host runtime.
///
/// Owns the registry, the concurrency gate and the stuck detector. No lock
/// is held while the host is called: each host result is applied in one
/// registry write that first checks the task is still live, so a cancel
/// never waits on a stalled session and a late result never overwrites a
/// terminal record.
pub struct Orchestrator {
    config: HandoffConfig,
    resolver: FallbackResolver,
    registry: Arc<RwLock<TaskRegistry>>,
    gate: Arc<ConcurrencyGate>,
    detector: StuckDetector,
    host: Arc<dyn HostRuntime>,
    ticking: Mutex<HashSet<String>>,
}

impl Orchestrator {
    /// Creates an engine with an empty registry. Gate limits, the stuck
    /// threshold and the slot ceiling come from `config`.
    pub fn new(config: HandoffConfig, catalog: FallbackCatalog, host: Arc<dyn HostRuntime>) -> Self {
        let resolver = FallbackResolver::new(catalog).with_max_slots(config.max_fallback_slots);
        let gate = ConcurrencyGate::from_config(&config.concurrency);
        let detector = StuckDetector::new(config.stuck.threshold_polls);
        Self {
            config,
            resolver,
            registry: Arc::new(RwLock::new(TaskRegistry::new())),
            gate: Arc::new(gate),
            detector,
            host,
            ticking: Mutex::new(HashSet::new()),
        }
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    /// The resolver used at launch.
    pub fn resolver(&self) -> &FallbackResolver {
        &self.resolver
    }

    /// Get a reference to the task registry.
    pub fn registry(&self) -> &Arc<RwLock<TaskRegistry>> {
        &self.registry
    }

    /// Get a reference to the concurrency gate.
    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    async fn snapshot(&self, id: &str) -> HandoffResult<BackgroundTask> {
        self.registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HandoffError::TaskNotFound(id.to_string()))
    }

    /// Registers a task and starts it if its concurrency group has room.
    ///
    /// Fails without registering anything when the fallback chain cannot be
    /// resolved.
    pub async fn launch(&self, input: LaunchInput) -> HandoffResult<LaunchOutcome> {
        let availability = self.host.availability().await?;
        let target = ResolveTarget::Agent {
            name: &input.agent,
            category: input.category.as_deref(),
        };
        let slots = self
            .resolver
            .resolve_slots(target, &self.config.overrides, &availability)?;
        let id = self.registry.write().await.create(input, slots)?;

        self.admit(&id).await?;
        let group = self.snapshot(&id).await?.concurrency_group;
        self.drain(&group).await;

        let task = self.snapshot(&id).await?;
        Ok(LaunchOutcome {
            id,
            session_id: task.session_id,
            status: task.status,
        })
    }

    /// Re-attaches a caller to a task.
    ///
    /// Terminal tasks keep their status. Pending tasks compete for a slot
    /// exactly like a fresh launch. Running tasks receive the new prompt.
    pub async fn resume(&self, input: ResumeInput) -> HandoffResult<ResumeOutcome> {
        let task = {
            let mut registry = self.registry.write().await;
            let id = registry
                .get(&input.task)
                .or_else(|| registry.find_by_session(&input.task))
                .map(|t| t.id.clone())
                .ok_or_else(|| HandoffError::TaskNotFound(input.task.clone()))?;
            registry
                .reattach(
                    &id,
                    &input.parent_session_id,
                    &input.parent_message_id,
                    Some(&input.prompt),
                )?
                .clone()
        };

        match task.status {
            TaskStatus::Pending => self.admit(&task.id).await?,
            TaskStatus::Running => match task.session_id.as_deref() {
                Some(session_id) if !input.prompt.trim().is_empty() => {
                    self.continue_session(&task, session_id, &input.prompt)
                        .await?;
                }
                Some(_) => {}
                None => {
                    self.registry.write().await.requeue(&task.id)?;
                    self.admit(&task.id).await?;
                }
            },
            status => {
                info!(task_id = %task.id, %status, "Resumed a finished task, status kept");
            }
        }
        self.drain(&task.concurrency_group).await;

        let status = self.snapshot(&task.id).await?.status;
        Ok(ResumeOutcome {
            id: task.id,
            status,
        })
    }

    /// Advances one task: admits it if pending, otherwise checks its session
    /// for progress, completion, errors and stalls.
    ///
    /// A poll that overlaps another poll of the same task returns the
    /// current snapshot without ticking.
    pub async fn poll(&self, id: &str) -> HandoffResult<BackgroundTask> {
        let task = self.snapshot(id).await?;
        match task.status {
            TaskStatus::Pending => self.admit(id).await?,
            TaskStatus::Running => match TickGuard::try_acquire(&self.ticking, id) {
                Some(_guard) => self.tick(&task).await?,
                None => debug!(task_id = %id, "Poll already in flight, tick skipped"),
            },
            _ => {}
        }
        self.drain(&task.concurrency_group).await;
        self.snapshot(id).await
    }

    /// Polls every non-terminal task once. Returns how many were polled.
    pub async fn poll_all(&self) -> usize {
        let ids: Vec<String> = self
            .registry
            .read()
            .await
            .list(&TaskFilter::default())
            .into_iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();

        let mut polled = 0;
        for id in ids {
            match self.poll(&id).await {
                Ok(_) => polled += 1,
                Err(e) => warn!(task_id = %id, error = %e, "Poll failed"),
            }
        }
        polled
    }

    /// Drives [`Orchestrator::poll_all`] on the configured interval until
    /// the handle is aborted.
    pub fn spawn_poller(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.poll_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let polled = self.poll_all().await;
                debug!(polled, "Poll tick");
            }
        })
    }

    /// Cancels a pending or running task. Returns `false` when the task had
    /// already finished, leaving it untouched.
    ///
    /// The local transition happens first and does not wait on any host
    /// call in flight for the task; the abort request to the host follows.
    pub async fn cancel(&self, id: &str) -> HandoffResult<bool> {
        let (session_id, slot, group) = {
            let mut registry = self.registry.write().await;
            let task = registry
                .get(id)
                .ok_or_else(|| HandoffError::TaskNotFound(id.to_string()))?;
            if task.is_terminal() {
                debug!(task_id = %id, status = %task.status, "Cancel ignored, task already finished");
                return Ok(false);
            }
            let session_id = task.session_id.clone();
            let group = task.concurrency_group.clone();
            registry.mark_terminal(id, TerminalOutcome::Cancelled("cancelled by caller".into()))?;
            (session_id, registry.take_slot(id)?, group)
        };
        if let Some(slot) = slot {
            self.gate.release(&slot);
        }
        if let Some(session_id) = session_id {
            if let Err(e) = self.host.abort(&session_id).await {
                warn!(task_id = %id, error = %e, "Abort request failed, task cancelled locally");
            }
        }
        self.drain(&group).await;
        Ok(true)
    }

    /// Reads a page of the task's session transcript.
    pub async fn transcript(&self, id: &str, query: &TranscriptQuery) -> HandoffResult<Transcript> {
        let task = self.snapshot(id).await?;
        let Some(session_id) = task.session_id else {
            return Ok(Transcript::empty(id));
        };
        let history = self.host.messages(&session_id).await?;
        Transcript::build(
            id,
            session_id,
            &history,
            query,
            self.config.transcript_message_cap,
        )
    }

    /// Snapshot of one task.
    pub async fn get(&self, id: &str) -> Option<BackgroundTask> {
        self.registry.read().await.get(id).cloned()
    }

    /// Matching tasks, oldest first.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<BackgroundTask> {
        self.registry
            .read()
            .await
            .list(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Task counts per status.
    pub async fn summary(&self) -> TaskSummary {
        self.registry.read().await.summary()
    }

    /// Reserves a gate slot for a pending task. `None` when the task is not
    /// pending, already holds a slot, or its group is full.
    async fn claim_slot(&self, id: &str) -> HandoffResult<Option<BackgroundTask>> {
        let mut registry = self.registry.write().await;
        let task = registry
            .get(id)
            .ok_or_else(|| HandoffError::TaskNotFound(id.to_string()))?;
        if task.status != TaskStatus::Pending || task.concurrency_key.is_some() {
            return Ok(None);
        }
        let Some(slot) = self.gate.acquire(&task.concurrency_group) else {
            debug!(task_id = %id, group = %task.concurrency_group, "Task waits for a concurrency slot");
            return Ok(None);
        };
        match registry.assign_slot(id, slot.clone()) {
            Ok(task) => Ok(Some(task.clone())),
            Err(e) => {
                self.gate.release(&slot);
                Err(e)
            }
        }
    }

    /// Tries to start a pending task.
    async fn admit(&self, id: &str) -> HandoffResult<()> {
        let Some(task) = self.claim_slot(id).await? else {
            return Ok(());
        };

        let (session_id, created) = match &task.session_id {
            Some(existing) => (existing.clone(), false),
            None => {
                let request = SessionRequest {
                    parent_session_id: task.parent_session_id.clone(),
                    title: task.description.clone(),
                    agent: task.agent.clone(),
                };
                match self.host.create_session(request).await {
                    Ok(session_id) => (session_id, true),
                    Err(e) => {
                        error!(task_id = %id, error = %e, "Failed to create subagent session");
                        return self
                            .finish(id, TerminalOutcome::Error(TaskFailure::task(host_message(e))))
                            .await;
                    }
                }
            }
        };

        let model = self.initial_model(&task).await;
        let started = {
            let mut registry = self.registry.write().await;
            if registry
                .get(id)
                .is_some_and(|t| t.status == TaskStatus::Pending)
            {
                if let Err(e) = registry.mark_running(id, &session_id) {
                    if let Some(slot) = registry.take_slot(id)? {
                        self.gate.release(&slot);
                    }
                    return Err(e);
                }
                if let Some(selection) = &model {
                    registry.note_tried_model(id, &selection.model)?;
                    registry.set_model(id, selection.clone())?;
                }
                true
            } else {
                false
            }
        };
        if !started {
            info!(task_id = %id, session_id = %session_id, "Task finished while its session was starting");
            if created {
                if let Err(e) = self.host.abort(&session_id).await {
                    warn!(task_id = %id, error = %e, "Abort of orphaned session failed");
                }
            }
            return Ok(());
        }

        let label = model
            .as_ref()
            .map_or_else(|| "default".to_string(), ToString::to_string);
        info!(task_id = %id, session_id = %session_id, model = %label, "Launching subagent");
        let request = PromptRequest {
            agent: task.agent.clone(),
            model,
            text: task.prompt.clone(),
        };
        if let Err(e) = self.host.prompt(&session_id, request).await {
            error!(task_id = %id, error = %e, "Prompt rejected by host");
            return self
                .finish(id, TerminalOutcome::Error(TaskFailure::task(host_message(e))))
                .await;
        }
        Ok(())
    }

    /// Model for the first prompt: the first chain entry with a connected
    /// provider, else the head of the chain as declared.
    async fn initial_model(&self, task: &BackgroundTask) -> Option<ModelSelection> {
        if task.model.is_some() {
            return task.model.clone();
        }
        let head = task.fallback_chain.first()?;
        match self.host.availability().await {
            Ok(availability) => task
                .fallback_chain
                .iter()
                .find_map(|e| e.select_provider(&availability))
                .or_else(|| Some(head.primary())),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Availability unknown, using declared order");
                Some(head.primary())
            }
        }
    }

    /// Applies `write` only if the task is still running, in the same
    /// registry write as the check. `None` when it has left `running`.
    async fn while_running<F>(&self, id: &str, write: F) -> HandoffResult<Option<BackgroundTask>>
    where
        F: FnOnce(&mut TaskRegistry) -> HandoffResult<()>,
    {
        let mut registry = self.registry.write().await;
        if !registry
            .get(id)
            .is_some_and(|t| t.status == TaskStatus::Running)
        {
            debug!(task_id = %id, "Task no longer running, update dropped");
            return Ok(None);
        }
        write(&mut *registry)?;
        Ok(registry.get(id).cloned())
    }

    /// One detector tick for a running task, from the caller's snapshot.
    async fn tick(&self, task: &BackgroundTask) -> HandoffResult<()> {
        let Some(session_id) = task.session_id.clone() else {
            self.registry.write().await.requeue(&task.id)?;
            return Ok(());
        };
        let status = match self.host.session_status(&session_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Session status unavailable, skipping tick");
                return Ok(());
            }
        };
        let messages = match self.host.messages(&session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Session messages unavailable, skipping tick");
                return Ok(());
            }
        };

        let now = Utc::now();
        let observation = Observation {
            message_count: messages.iter().filter(|m| m.is_assistant()).count(),
            in_retry: status.is_retry(),
            at: now,
        };
        // The record may have moved on while the host answered; observe
        // against the current one.
        let mut action = DetectorAction::None;
        let Some(task) = self
            .while_running(&task.id, |registry| {
                let Some(current) = registry.get(&task.id).cloned() else {
                    return Err(HandoffError::TaskNotFound(task.id.clone()));
                };
                let (state, next) = self.detector.observe(
                    &current.detector_state(),
                    &current.fallback_chain,
                    &observation,
                );
                action = next;
                if let Some(delta) = progress_since(&current, &messages, now) {
                    registry.record_progress(&current.id, delta)?;
                }
                registry.apply_detector_state(&current.id, state)?;
                Ok(())
            })
            .await?
        else {
            return Ok(());
        };
        debug!(
            task_id = %task.id,
            stable_polls = task.stable_polls,
            messages = observation.message_count,
            "Polled session"
        );

        match (status, action) {
            (SessionStatus::Error { message }, _) => {
                self.handle_session_error(&task, &session_id, message).await
            }
            (_, DetectorAction::SwapModel(entry)) => {
                info!(
                    task_id = %task.id,
                    since = ?task.retry_since,
                    next = %entry.model,
                    "Session stuck in provider retry, switching model"
                );
                self.swap_model(&task, &session_id, entry).await
            }
            (_, DetectorAction::Exhausted) => self.exhaust(&task).await,
            (SessionStatus::Idle, DetectorAction::None) if !task.swap_in_flight() => {
                match last_assistant_text(&messages) {
                    Some(text) => self.finish(&task.id, TerminalOutcome::Completed(text)).await,
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    async fn handle_session_error(
        &self,
        task: &BackgroundTask,
        session_id: &str,
        message: String,
    ) -> HandoffResult<()> {
        if !is_retryable(&message) {
            warn!(task_id = %task.id, error = %message, "Session failed");
            return self
                .finish(&task.id, TerminalOutcome::Error(TaskFailure::task(message)))
                .await;
        }
        match task.next_fallback() {
            NextModel::Next(entry) => {
                info!(
                    task_id = %task.id,
                    error = %message,
                    next = %entry.model,
                    "Provider error, switching model"
                );
                let noted = self
                    .while_running(&task.id, |registry| {
                        registry.note_tried_model(&task.id, &entry.model).map(|_| ())
                    })
                    .await?;
                match noted {
                    Some(task) => self.swap_model(&task, session_id, entry).await,
                    None => Ok(()),
                }
            }
            NextModel::Exhausted if task.requires_any_model => self.exhaust(task).await,
            NextModel::Exhausted => {
                warn!(task_id = %task.id, error = %message, "Provider error with no fallback left");
                self.finish(&task.id, TerminalOutcome::Error(TaskFailure::task(message)))
                    .await
            }
        }
    }

    /// Re-issues the task prompt on `entry`, walking further down the chain
    /// while the chosen model has no connected provider. `entry.model` must
    /// already be recorded as tried.
    async fn swap_model(
        &self,
        task: &BackgroundTask,
        session_id: &str,
        entry: FallbackEntry,
    ) -> HandoffResult<()> {
        let availability = match self.host.availability().await {
            Ok(availability) => Some(availability),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Availability unknown, trusting declared providers");
                None
            }
        };

        let mut entry = entry;
        let selection = loop {
            if let Some(selection) = select_for(&entry, availability.as_ref()) {
                break selection;
            }
            let unavailable = HandoffError::ProviderUnavailable(entry.model.clone());
            warn!(task_id = %task.id, error = %unavailable, "Skipping fallback model");
            let current = self.snapshot(&task.id).await?;
            match current.next_fallback() {
                NextModel::Next(next) => {
                    let noted = self
                        .while_running(&task.id, |registry| {
                            registry.note_tried_model(&task.id, &next.model).map(|_| ())
                        })
                        .await?;
                    if noted.is_none() {
                        return Ok(());
                    }
                    entry = next;
                }
                NextModel::Exhausted => return self.exhaust(&current).await,
            }
        };

        let started = self
            .while_running(&task.id, |registry| {
                registry.begin_swap(&task.id).map(|_| ())
            })
            .await?;
        if started.is_none() {
            return Ok(());
        }
        if let Err(e) = self.host.abort(session_id).await {
            warn!(task_id = %task.id, error = %e, "Abort before model switch failed");
        }
        info!(task_id = %task.id, model = %selection, "Re-prompting on fallback model");
        let request = PromptRequest {
            agent: task.agent.clone(),
            model: Some(selection.clone()),
            text: task.prompt.clone(),
        };
        match self.host.prompt(session_id, request).await {
            Ok(()) => {
                self.while_running(&task.id, |registry| {
                    registry.set_model(&task.id, selection).map(|_| ())
                })
                .await?;
                Ok(())
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Prompt rejected by host");
                self.finish(&task.id, TerminalOutcome::Error(TaskFailure::task(host_message(e))))
                    .await
            }
        }
    }

    async fn continue_session(
        &self,
        task: &BackgroundTask,
        session_id: &str,
        prompt: &str,
    ) -> HandoffResult<()> {
        let request = PromptRequest {
            agent: task.agent.clone(),
            model: task.model.clone(),
            text: prompt.to_string(),
        };
        if let Err(e) = self.host.prompt(session_id, request).await {
            error!(task_id = %task.id, error = %e, "Follow-up prompt rejected by host");
            return self
                .finish(&task.id, TerminalOutcome::Error(TaskFailure::task(host_message(e))))
                .await;
        }
        Ok(())
    }

    async fn exhaust(&self, task: &BackgroundTask) -> HandoffResult<()> {
        let current = self.snapshot(&task.id).await?;
        warn!(
            task_id = %task.id,
            tried = ?current.retry_fallback_tried_models,
            "Fallback chain exhausted"
        );
        let failure =
            TaskFailure::fallback_exhausted(&task.id, current.retry_fallback_tried_models);
        self.finish(&task.id, TerminalOutcome::Error(failure)).await
    }

    /// Writes the terminal state and returns the task's slot to the gate.
    ///
    /// The first terminal write wins: an outcome arriving for a task that
    /// already finished (typically cancelled during a host call) is dropped.
    async fn finish(&self, id: &str, outcome: TerminalOutcome) -> HandoffResult<()> {
        let slot = {
            let mut registry = self.registry.write().await;
            let current = registry
                .get(id)
                .ok_or_else(|| HandoffError::TaskNotFound(id.to_string()))?;
            if current.is_terminal() {
                debug!(
                    task_id = %id,
                    status = %current.status,
                    dropped = %outcome.status(),
                    "Task already finished, outcome dropped"
                );
                return Ok(());
            }
            let applied = registry.mark_terminal(id, outcome).map(|_| ());
            if let Err(e) = &applied {
                error!(task_id = %id, error = %e, "Terminal write rejected");
            }
            debug_assert!(applied.is_ok(), "terminal write rejected for task {id}");
            applied?;
            registry.take_slot(id)?
        };
        if let Some(slot) = slot {
            self.gate.release(&slot);
        }
        Ok(())
    }

    /// Admits queued tasks of `group`, oldest first, while the gate has room.
    async fn drain(&self, group: &str) {
        let pending = self.registry.read().await.pending_in_group(group);
        for id in pending {
            if self.gate.active(group) >= self.gate.limit(group) {
                break;
            }
            if let Err(e) = self.admit(&id).await {
                warn!(task_id = %id, error = %e, "Failed to admit queued task");
            }
        }
    }
}

fn select_for(entry: &FallbackEntry, availability: Option<&Availability>) -> Option<ModelSelection> {
    match availability {
        Some(availability) => entry.select_provider(availability),
        None => Some(entry.primary()),
    }
}

/// Host errors are stored with the host's own wording.
fn host_message(err: HandoffError) -> String {
    match err {
        HandoffError::Host(message) => message,
        other => other.to_string(),
    }
}

fn last_assistant(messages: &[SessionMessage]) -> Option<&SessionMessage> {
    messages
        .iter()
        .rev()
        .find(|m| m.is_assistant() && !m.text().trim().is_empty())
}

fn last_assistant_text(messages: &[SessionMessage]) -> Option<String> {
    last_assistant(messages).map(SessionMessage::text)
}

/// Progress visible in `messages` that the task record does not have yet.
fn progress_since(
    task: &BackgroundTask,
    messages: &[SessionMessage],
    now: DateTime<Utc>,
) -> Option<ProgressDelta> {
    let total: usize = messages.iter().map(|m| m.tool_calls().count()).sum();
    let total = u32::try_from(total).unwrap_or(u32::MAX);
    let new_calls = total.saturating_sub(task.tool_calls);
    let last_tool = messages
        .iter()
        .flat_map(|m| m.tool_calls())
        .last()
        .map(str::to_string);
    let last = last_assistant(messages);
    let last_message = last.map(SessionMessage::text);

    let changed = new_calls > 0
        || (last_tool.is_some() && last_tool != task.last_tool)
        || (last_message.is_some() && last_message != task.last_message);
    if !changed {
        return None;
    }
    Some(ProgressDelta {
        tool_calls: new_calls,
        last_tool,
        last_message,
        last_message_at: last.map(|m| m.created_at),
        at: task.last_update.map_or(now, |prev| prev.max(now)),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use handoff_core::{MessagePart, MessageRole};

    fn running_task() -> BackgroundTask {
        let mut task = BackgroundTask::new(
            LaunchInput::new("d", "p", "explore", "ses_p", "msg_p"),
            Vec::new(),
        );
        task.status = TaskStatus::Running;
        task
    }

    fn tool_message(id: &str, tool: &str) -> SessionMessage {
        SessionMessage::new(id, MessageRole::Assistant).with_part(MessagePart::ToolCall {
            call_id: format!("call_{id}"),
            tool: tool.into(),
            input: serde_json::json!({}),
        })
    }

    #[test]
    fn test_progress_counts_only_new_tool_calls() {
        let mut task = running_task();
        let messages = vec![
            tool_message("m1", "grep"),
            tool_message("m2", "read"),
            SessionMessage::assistant_text("m3", "Done reading."),
        ];
        let delta = progress_since(&task, &messages, Utc::now()).unwrap();
        assert_eq!(delta.tool_calls, 2);
        assert_eq!(delta.last_tool.as_deref(), Some("read"));
        assert_eq!(delta.last_message.as_deref(), Some("Done reading."));

        task.tool_calls = 2;
        task.last_tool = Some("read".into());
        task.last_message = Some("Done reading.".into());
        assert!(progress_since(&task, &messages, Utc::now()).is_none());
    }

    #[test]
    fn test_progress_timestamp_never_goes_back() {
        let mut task = running_task();
        let later = Utc::now() + chrono::Duration::seconds(30);
        task.last_update = Some(later);
        let delta = progress_since(&task, &[tool_message("m1", "grep")], Utc::now()).unwrap();
        assert_eq!(delta.at, later);
    }

    #[test]
    fn test_last_assistant_text_skips_tool_only_messages() {
        let messages = vec![
            SessionMessage::assistant_text("m1", "first answer"),
            tool_message("m2", "grep"),
            SessionMessage::user_text("m3", "thanks"),
        ];
        assert_eq!(last_assistant_text(&messages).as_deref(), Some("first answer"));
        assert!(last_assistant_text(&[tool_message("m1", "grep")]).is_none());
    }

    #[test]
    fn test_tick_guard_is_exclusive_and_cleared_on_drop() {
        let ticking = Mutex::new(HashSet::new());
        let first = TickGuard::try_acquire(&ticking, "t1").unwrap();
        assert!(TickGuard::try_acquire(&ticking, "t1").is_none());
        let other = TickGuard::try_acquire(&ticking, "t2").unwrap();
        assert_eq!(ticking.lock().len(), 2);

        drop(first);
        drop(other);
        assert!(ticking.lock().is_empty());
        assert!(TickGuard::try_acquire(&ticking, "t1").is_some());
    }

    #[test]
    fn test_host_message_is_verbatim() {
        assert_eq!(host_message(HandoffError::Host("429 rate limit".into())), "429 rate limit");
        assert!(host_message(HandoffError::Config("x".into())).contains("Config error"));
    }

    #[test]
    fn test_select_for_without_availability_uses_primary() {
        let entry = FallbackEntry::new(vec!["anthropic".into(), "opencode".into()], "m", None)
            .unwrap();
        assert_eq!(select_for(&entry, None).unwrap().provider, "anthropic");
        let avail = Availability::connected(["opencode"]);
        assert_eq!(select_for(&entry, Some(&avail)).unwrap().provider, "opencode");
        assert!(select_for(&entry, Some(&Availability::new())).is_none());
    }
}

//! Stuck-session detection.
//!
//! A pure transition `(state, observation) -> (state, action)`. The engine
//! decides when ticks happen and carries out the returned action; nothing in
//! here touches the registry or the host.

use chrono::{DateTime, Utc};
use handoff_agent::{select_next, FallbackEntry, NextModel};
use serde::{Deserialize, Serialize};

/// Inactivity counters carried on each task between polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorState {
    pub last_msg_count: usize,
    pub stable_polls: u32,
    /// Set when a swap is requested, cleared once the session produces a
    /// new message. While set, no further swap is offered.
    pub retry_since: Option<DateTime<Utc>>,
    pub tried_models: Vec<String>,
}

/// What one poll saw of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Assistant messages in the session so far.
    pub message_count: usize,
    /// The host reports the session in a provider retry loop.
    pub in_retry: bool,
    pub at: DateTime<Utc>,
}

/// What the caller should do after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorAction {
    None,
    /// Re-issue the prompt on this entry's model.
    SwapModel(FallbackEntry),
    /// Stuck with nothing left to try.
    Exhausted,
}

/// Detects sessions that stopped producing messages while retrying.
#[derive(Debug, Clone, Copy)]
pub struct StuckDetector {
    threshold: u32,
}

impl StuckDetector {
    /// `threshold` consecutive unchanged polls count as stuck (minimum 1).
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn observe(
        &self,
        state: &DetectorState,
        chain: &[FallbackEntry],
        observation: &Observation,
    ) -> (DetectorState, DetectorAction) {
        let mut next = state.clone();

        if observation.message_count == state.last_msg_count {
            next.stable_polls = state.stable_polls.saturating_add(1);
        } else {
            next.stable_polls = 0;
            next.last_msg_count = observation.message_count;
            // The swapped-in model has spoken.
            next.retry_since = None;
        }

        if next.stable_polls < self.threshold || !observation.in_retry {
            return (next, DetectorAction::None);
        }
        if next.retry_since.is_some() {
            return (next, DetectorAction::None);
        }

        next.retry_since = Some(observation.at);
        match select_next(chain, &next.tried_models) {
            NextModel::Next(entry) => {
                next.tried_models.push(entry.model.clone());
                next.stable_polls = 0;
                (next, DetectorAction::SwapModel(entry))
            }
            NextModel::Exhausted => (next, DetectorAction::Exhausted),
        }
    }
}

impl Default for StuckDetector {
    fn default() -> Self {
        Self::new(3)
    }
}

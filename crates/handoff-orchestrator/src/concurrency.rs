use crate::config::ConcurrencyConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// Proof that one unit of a key's concurrency budget is held.
///
/// Only [`ConcurrencyGate::acquire`] creates slots, so a task can hold a
/// `concurrency_key` only if the gate actually admitted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConcurrencySlot {
    key: String,
}

impl ConcurrencySlot {
    /// The concurrency key this slot counts against.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Per-key counter bounding how many tasks of one group run at once.
///
/// Holds no queue: a denied caller keeps its task pending and asks again
/// later.
pub struct ConcurrencyGate {
    default_limit: usize,
    limits: HashMap<String, usize>,
    active: Mutex<HashMap<String, usize>>,
}

impl ConcurrencyGate {
    /// A gate where every key runs at most `default_limit` tasks (minimum 1).
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: default_limit.max(1),
            limits: HashMap::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        config
            .limits
            .iter()
            .fold(Self::new(config.default_limit), |gate, (key, limit)| {
                gate.with_limit(key.clone(), *limit)
            })
    }

    /// Overrides the limit for one key.
    pub fn with_limit(mut self, key: impl Into<String>, limit: usize) -> Self {
        self.limits.insert(key.into(), limit.max(1));
        self
    }

    /// Configured limit for `key`.
    pub fn limit(&self, key: &str) -> usize {
        self.limits.get(key).copied().unwrap_or(self.default_limit)
    }

    /// Slots currently held for `key`.
    pub fn active(&self, key: &str) -> usize {
        self.active.lock().get(key).copied().unwrap_or(0)
    }

    /// Non-blocking admission. `None` means "try later", not failure.
    pub fn acquire(&self, key: &str) -> Option<ConcurrencySlot> {
        let limit = self.limit(key);
        let mut active = self.active.lock();
        let count = active.entry(key.to_string()).or_insert(0);
        if *count >= limit {
            debug!(key, active = *count, limit, "Concurrency slot denied");
            return None;
        }
        *count += 1;
        debug!(key, active = *count, limit, "Concurrency slot acquired");
        Some(ConcurrencySlot {
            key: key.to_string(),
        })
    }

    /// Returns a slot. Releasing against a zero count is a no-op; returns
    /// whether the count was actually decremented.
    pub fn release(&self, slot: &ConcurrencySlot) -> bool {
        let mut active = self.active.lock();
        match active.get_mut(slot.key()) {
            Some(count) if *count > 0 => {
                *count -= 1;
                debug!(key = slot.key(), active = *count, "Concurrency slot released");
                if *count == 0 {
                    active.remove(slot.key());
                }
                true
            }
            _ => {
                debug!(key = slot.key(), "Release on idle key ignored");
                false
            }
        }
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(1)
    }
}

use crate::transcript::DEFAULT_TRANSCRIPT_CAP;
use handoff_agent::{FallbackOverrides, DEFAULT_MAX_SLOTS};
use handoff_core::{HandoffError, HandoffResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Engine configuration, usually loaded from `handoff.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Ceiling on resolved fallback candidates per task.
    #[serde(default = "default_max_slots")]
    pub max_fallback_slots: usize,
    /// Ceiling on messages returned by one transcript query.
    #[serde(default = "default_transcript_cap")]
    pub transcript_message_cap: usize,
    /// `[agents.*]` and `[categories.*]` fallback overrides.
    #[serde(flatten)]
    pub overrides: FallbackOverrides,
    /// `[concurrency]` section.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// `[stuck]` section.
    #[serde(default)]
    pub stuck: StuckConfig,
}

/// How many tasks of one concurrency group may run at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Limit for groups without an entry in `limits`.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Per concurrency-group limits.
    #[serde(default)]
    pub limits: HashMap<String, usize>,
}

/// Stuck-session detection and poll cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckConfig {
    /// Consecutive unchanged polls before a retrying session counts as stuck.
    #[serde(default = "default_threshold_polls")]
    pub threshold_polls: u32,
    /// Period of the background poller.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            max_fallback_slots: default_max_slots(),
            transcript_message_cap: default_transcript_cap(),
            overrides: FallbackOverrides::default(),
            concurrency: ConcurrencyConfig::default(),
            stuck: StuckConfig::default(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            limits: HashMap::new(),
        }
    }
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            threshold_polls: default_threshold_polls(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_max_slots() -> usize {
    DEFAULT_MAX_SLOTS
}
fn default_transcript_cap() -> usize {
    DEFAULT_TRANSCRIPT_CAP
}
fn default_limit() -> usize {
    1
}
fn default_threshold_polls() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    2000
}

impl HandoffConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> HandoffResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| HandoffError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a config file.
    pub async fn load(path: impl AsRef<Path>) -> HandoffResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> HandoffResult<()> {
        if self.max_fallback_slots == 0 {
            return Err(HandoffError::Config(
                "max_fallback_slots must be at least 1".into(),
            ));
        }
        if self.transcript_message_cap == 0 {
            return Err(HandoffError::Config(
                "transcript_message_cap must be at least 1".into(),
            ));
        }
        if self.stuck.threshold_polls == 0 {
            return Err(HandoffError::Config(
                "stuck.threshold_polls must be at least 1".into(),
            ));
        }
        if self.stuck.poll_interval_ms == 0 {
            return Err(HandoffError::Config(
                "stuck.poll_interval_ms must be at least 1".into(),
            ));
        }
        if self.concurrency.default_limit == 0 {
            return Err(HandoffError::Config(
                "concurrency.default_limit must be at least 1".into(),
            ));
        }
        if let Some((key, _)) = self.concurrency.limits.iter().find(|(_, l)| **l == 0) {
            return Err(HandoffError::Config(format!(
                "concurrency limit for '{key}' must be at least 1"
            )));
        }
        self.overrides.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.stuck.poll_interval_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HandoffConfig::from_toml_str("").unwrap();
        assert_eq!(config, HandoffConfig::default());
        assert_eq!(config.max_fallback_slots, 4);
        assert_eq!(config.transcript_message_cap, 100);
        assert_eq!(config.concurrency.default_limit, 1);
        assert_eq!(config.stuck.threshold_polls, 3);
        assert_eq!(config.poll_interval(), Duration::from_millis(2000));
    }

    #[test]
    fn test_full_document() {
        let raw = r#"
            max_fallback_slots = 3

            [agents.kord]
            category = "ultrabrain"
            fallback = [{ model = "openai/gpt-5.2", variant = "high" }]

            [categories.quick]
            fallback = [{ model = "claude-haiku-4-5" }]

            [concurrency]
            default_limit = 2
            [concurrency.limits]
            "build-1" = 1

            [stuck]
            threshold_polls = 5
        "#;
        let config = HandoffConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.max_fallback_slots, 3);
        assert_eq!(config.transcript_message_cap, 100);
        assert_eq!(
            config.overrides.agent("kord").unwrap().category.as_deref(),
            Some("ultrabrain")
        );
        assert_eq!(config.overrides.category("quick").unwrap().fallback.len(), 1);
        assert_eq!(config.concurrency.default_limit, 2);
        assert_eq!(config.concurrency.limits["build-1"], 1);
        assert_eq!(config.stuck.threshold_polls, 5);
        assert_eq!(config.stuck.poll_interval_ms, 2000);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(HandoffConfig::from_toml_str("max_fallback_slots = 0").is_err());
        assert!(HandoffConfig::from_toml_str("[stuck]\nthreshold_polls = 0").is_err());
        assert!(HandoffConfig::from_toml_str("[concurrency.limits]\nx = 0").is_err());
        assert!(HandoffConfig::from_toml_str("max_fallback_slots = \"four\"").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "transcript_message_cap = 50").unwrap();
        let config = HandoffConfig::load(file.path()).await.unwrap();
        assert_eq!(config.transcript_message_cap, 50);

        let missing = HandoffConfig::load("/nonexistent/handoff.toml").await;
        assert!(matches!(missing, Err(HandoffError::Io(_))));
    }
}

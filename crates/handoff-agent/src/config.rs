use handoff_core::{split_qualified, HandoffError, HandoffResult, PROVIDER_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One model in a user-supplied fallback list.
///
/// `model` is either bare (`glm-4.7`), in which case the provider list is
/// borrowed from the catalog, or qualified (`openai/gpt-5.2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackModel {
    pub model: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl FallbackModel {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Explicit provider and bare model id.
    pub fn split(&self) -> (Option<&str>, &str) {
        split_qualified(&self.model)
    }

    fn validate(&self, owner: &str) -> HandoffResult<()> {
        let (provider, model) = self.split();
        if model.is_empty() || provider == Some("") || model.contains(PROVIDER_SEPARATOR) {
            return Err(HandoffError::Config(format!(
                "invalid fallback model '{}' for '{owner}'",
                self.model
            )));
        }
        Ok(())
    }
}

/// Per-agent override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOverride {
    /// Category whose override this agent falls back to when it has no
    /// `fallback` list of its own.
    #[serde(default)]
    pub category: Option<String>,
    /// Replaces the catalog chain entirely when non-empty.
    #[serde(default)]
    pub fallback: Vec<FallbackModel>,
}

/// Per-category override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryOverride {
    /// Replaces the catalog chain entirely when non-empty.
    #[serde(default)]
    pub fallback: Vec<FallbackModel>,
}

/// All user overrides, as loaded from the `[agents.*]` and `[categories.*]`
/// config tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackOverrides {
    #[serde(default)]
    pub agents: HashMap<String, AgentOverride>,
    #[serde(default)]
    pub categories: HashMap<String, CategoryOverride>,
}

impl FallbackOverrides {
    pub fn agent(&self, name: &str) -> Option<&AgentOverride> {
        self.agents.get(name)
    }

    pub fn category(&self, name: &str) -> Option<&CategoryOverride> {
        self.categories.get(name)
    }

    /// Rejects empty or multiply-qualified model ids.
    pub fn validate(&self) -> HandoffResult<()> {
        for (name, o) in &self.agents {
            o.fallback.iter().try_for_each(|m| m.validate(name))?;
        }
        for (name, o) in &self.categories {
            o.fallback.iter().try_for_each(|m| m.validate(name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides_from_toml() {
        let raw = r#"
            [agents.kord]
            category = "ultrabrain"
            fallback = [
                { model = "openai/gpt-5.2", variant = "high" },
                { model = "glm-4.7" },
            ]

            [categories.quick]
            fallback = [{ model = "claude-haiku-4-5" }]
        "#;
        let overrides: FallbackOverrides = toml::from_str(raw).unwrap();
        overrides.validate().unwrap();

        let kord = overrides.agent("kord").unwrap();
        assert_eq!(kord.category.as_deref(), Some("ultrabrain"));
        assert_eq!(kord.fallback.len(), 2);
        assert_eq!(kord.fallback[0].split(), (Some("openai"), "gpt-5.2"));
        assert_eq!(kord.fallback[1].split(), (None, "glm-4.7"));
        assert_eq!(overrides.category("quick").unwrap().fallback.len(), 1);
    }

    #[test]
    fn test_validate_rejects_nested_provider() {
        let mut overrides = FallbackOverrides::default();
        overrides.agents.insert(
            "oracle".into(),
            AgentOverride {
                category: None,
                fallback: vec![FallbackModel::new("openrouter/anthropic/claude")],
            },
        );
        assert!(overrides.validate().is_err());
    }
}

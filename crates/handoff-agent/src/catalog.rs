use crate::availability::Availability;
use handoff_core::{HandoffError, HandoffResult, ModelSelection, PROVIDER_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One candidate in a fallback chain: a model that any of `providers` can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEntry {
    /// Providers able to serve the model, in preference order. Never empty.
    pub providers: Vec<String>,
    /// Model id without a provider prefix.
    pub model: String,
    /// Optional reasoning / cost tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl FallbackEntry {
    /// Creates a validated entry.
    pub fn new(
        providers: Vec<String>,
        model: impl Into<String>,
        variant: Option<String>,
    ) -> HandoffResult<Self> {
        let entry = Self {
            providers,
            model: model.into(),
            variant,
        };
        entry.validate()?;
        Ok(entry)
    }

    fn builtin(providers: &[&str], model: &str, variant: Option<&str>) -> Self {
        Self {
            providers: providers.iter().map(|p| (*p).to_string()).collect(),
            model: model.to_string(),
            variant: variant.map(String::from),
        }
    }

    /// Checks the entry invariants: providers non-empty, model unqualified.
    pub fn validate(&self) -> HandoffResult<()> {
        if self.providers.is_empty() || self.providers.iter().any(String::is_empty) {
            return Err(HandoffError::Config(format!(
                "fallback entry '{}' has no providers",
                self.model
            )));
        }
        if self.model.is_empty() || self.model.contains(PROVIDER_SEPARATOR) {
            return Err(HandoffError::Config(format!(
                "fallback model '{}' must be a bare model id",
                self.model
            )));
        }
        Ok(())
    }

    /// True when at least one listed provider is connected.
    pub fn is_viable(&self, availability: &Availability) -> bool {
        self.providers.iter().any(|p| availability.is_connected(p))
    }

    /// First listed provider that is connected and exposes the model.
    pub fn select_provider(&self, availability: &Availability) -> Option<ModelSelection> {
        self.providers
            .iter()
            .find(|p| availability.exposes(p, &self.model))
            .map(|p| self.selection_for(p))
    }

    /// The selection this entry names for its preferred provider,
    /// regardless of availability.
    pub fn primary(&self) -> ModelSelection {
        let provider = self.providers.first().map(String::as_str).unwrap_or_default();
        self.selection_for(provider)
    }

    fn selection_for(&self, provider: &str) -> ModelSelection {
        ModelSelection::new(provider, &self.model).with_variant(self.variant.clone())
    }
}

/// Model policy for one agent or category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequirement {
    /// Candidates, tried strictly in order.
    pub fallback_chain: Vec<FallbackEntry>,
    /// The task must run on one of these providers, whatever the chain says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_provider: Option<Vec<String>>,
    /// The task must run on exactly this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_model: Option<String>,
    /// The task must end up on some model rather than fail outright.
    #[serde(default)]
    pub requires_any_model: bool,
}

impl ModelRequirement {
    /// A requirement with only a chain.
    pub fn chain(fallback_chain: Vec<FallbackEntry>) -> Self {
        Self {
            fallback_chain,
            requires_provider: None,
            requires_model: None,
            requires_any_model: false,
        }
    }

    /// Sets `requires_provider`.
    pub fn requiring_provider(mut self, providers: &[&str]) -> Self {
        self.requires_provider = Some(providers.iter().map(|p| (*p).to_string()).collect());
        self
    }

    /// Sets `requires_model`.
    pub fn requiring_model(mut self, model: impl Into<String>) -> Self {
        self.requires_model = Some(model.into());
        self
    }

    /// Sets `requires_any_model`.
    pub fn requiring_any_model(mut self) -> Self {
        self.requires_any_model = true;
        self
    }

    fn validate(&self, name: &str) -> HandoffResult<()> {
        if self.fallback_chain.is_empty() {
            return Err(HandoffError::Config(format!(
                "fallback chain for '{name}' is empty"
            )));
        }
        self.fallback_chain.iter().try_for_each(FallbackEntry::validate)
    }
}

/// Static table of fallback chains keyed by agent name and by category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackCatalog {
    agents: BTreeMap<String, ModelRequirement>,
    categories: BTreeMap<String, ModelRequirement>,
}

impl FallbackCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog shipped with the engine.
    pub fn builtin() -> Self {
        const ANTHROPIC: &[&str] = &["anthropic", "github-copilot", "opencode"];
        const OPENAI: &[&str] = &["openai", "github-copilot", "opencode"];
        const GOOGLE: &[&str] = &["google", "github-copilot", "opencode"];
        let e = FallbackEntry::builtin;

        let mut catalog = Self::new();

        catalog.insert_agent(
            "kord",
            ModelRequirement::chain(vec![
                e(ANTHROPIC, "claude-opus-4-6", Some("max")),
                e(OPENAI, "gpt-5.2", Some("high")),
                e(GOOGLE, "gemini-3-pro", None),
                e(&["zai-coding-plan", "opencode"], "glm-4.7", None),
                e(&["opencode"], "big-pickle", None),
            ]),
        );
        catalog.insert_agent(
            "planner",
            ModelRequirement::chain(vec![
                e(ANTHROPIC, "claude-opus-4-6", Some("max")),
                e(OPENAI, "gpt-5.2", Some("high")),
                e(GOOGLE, "gemini-3-pro", None),
            ]),
        );
        catalog.insert_agent(
            "oracle",
            ModelRequirement::chain(vec![
                e(OPENAI, "gpt-5.2", Some("high")),
                e(GOOGLE, "gemini-3-pro", Some("high")),
                e(ANTHROPIC, "claude-opus-4-6", Some("max")),
            ]),
        );
        catalog.insert_agent(
            "librarian",
            ModelRequirement::chain(vec![
                e(&["zai-coding-plan", "opencode"], "glm-4.7", None),
                e(&["opencode"], "glm-4.7-free", None),
                e(ANTHROPIC, "claude-sonnet-4-5", None),
            ]),
        );
        catalog.insert_agent(
            "explore",
            ModelRequirement::chain(vec![
                e(&["github-copilot", "xai"], "grok-code-fast-1", None),
                e(ANTHROPIC, "claude-haiku-4-5", None),
                e(&["opencode"], "gpt-5-nano", None),
            ])
            .requiring_any_model(),
        );
        catalog.insert_agent(
            "multimodal-looker",
            ModelRequirement::chain(vec![
                e(GOOGLE, "gemini-3-flash", None),
                e(OPENAI, "gpt-5.2", None),
                e(&["zai-coding-plan"], "glm-4.6v", None),
                e(ANTHROPIC, "claude-haiku-4-5", None),
                e(&["opencode"], "gpt-5-nano", None),
            ]),
        );

        catalog.insert_category(
            "visual-engineering",
            ModelRequirement::chain(vec![
                e(GOOGLE, "gemini-3-pro", Some("high")),
                e(ANTHROPIC, "claude-opus-4-6", Some("max")),
            ])
            .requiring_provider(&["google", "github-copilot", "opencode"]),
        );
        catalog.insert_category(
            "ultrabrain",
            ModelRequirement::chain(vec![
                e(OPENAI, "gpt-5.2-codex", Some("xhigh")),
                e(GOOGLE, "gemini-3-pro", Some("high")),
                e(ANTHROPIC, "claude-opus-4-6", Some("max")),
            ]),
        );
        catalog.insert_category(
            "deep",
            ModelRequirement::chain(vec![
                e(OPENAI, "gpt-5.2-codex", Some("medium")),
                e(ANTHROPIC, "claude-opus-4-6", Some("max")),
            ])
            .requiring_model("gpt-5.2-codex"),
        );
        catalog.insert_category(
            "quick",
            ModelRequirement::chain(vec![
                e(ANTHROPIC, "claude-haiku-4-5", None),
                e(GOOGLE, "gemini-3-flash", None),
                e(&["opencode"], "gpt-5-nano", None),
            ])
            .requiring_any_model(),
        );
        catalog.insert_category(
            "writing",
            ModelRequirement::chain(vec![
                e(GOOGLE, "gemini-3-flash", None),
                e(ANTHROPIC, "claude-sonnet-4-5", None),
                e(&["zai-coding-plan"], "glm-4.7", None),
            ]),
        );

        catalog
    }

    /// Registers (or replaces) an agent requirement.
    pub fn insert_agent(&mut self, name: impl Into<String>, requirement: ModelRequirement) {
        self.agents.insert(name.into(), requirement);
    }

    /// Registers (or replaces) a category requirement.
    pub fn insert_category(&mut self, name: impl Into<String>, requirement: ModelRequirement) {
        self.categories.insert(name.into(), requirement);
    }

    /// Requirement for an agent.
    pub fn agent(&self, name: &str) -> Option<&ModelRequirement> {
        self.agents.get(name)
    }

    /// Requirement for a category.
    pub fn category(&self, name: &str) -> Option<&ModelRequirement> {
        self.categories.get(name)
    }

    /// Agent names, sorted.
    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    /// Category names, sorted.
    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    /// Provider list for a bare model: first from `preferred`, then from any
    /// agent or category chain in the catalog.
    pub fn providers_for_model(
        &self,
        preferred: Option<&ModelRequirement>,
        model: &str,
    ) -> Option<Vec<String>> {
        preferred
            .into_iter()
            .chain(self.agents.values())
            .chain(self.categories.values())
            .flat_map(|req| req.fallback_chain.iter())
            .find(|entry| entry.model == model)
            .map(|entry| entry.providers.clone())
    }

    /// Validates every chain in the catalog.
    pub fn validate(&self) -> HandoffResult<()> {
        for (name, req) in self.agents.iter().chain(self.categories.iter()) {
            req.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = FallbackCatalog::builtin();
        catalog.validate().unwrap();
        assert!(catalog.agent("kord").is_some());
        assert!(catalog.category("quick").is_some());
        assert_eq!(catalog.agent("kord").unwrap().fallback_chain.len(), 5);
    }

    #[test]
    fn test_entry_rejects_qualified_model() {
        let err = FallbackEntry::new(vec!["openai".into()], "openai/gpt-5.2", None);
        assert!(err.is_err());
        let err = FallbackEntry::new(vec![], "gpt-5.2", None);
        assert!(err.is_err());
    }

    #[test]
    fn test_select_provider_prefers_listed_order() {
        let entry = FallbackEntry::new(
            vec!["anthropic".into(), "github-copilot".into()],
            "claude-opus-4-6",
            Some("max".into()),
        )
        .unwrap();
        let avail = Availability::connected(["github-copilot", "anthropic"]);
        let sel = entry.select_provider(&avail).unwrap();
        assert_eq!(sel.to_string(), "anthropic/claude-opus-4-6:max");

        let only_copilot = Availability::connected(["github-copilot"]);
        let sel = entry.select_provider(&only_copilot).unwrap();
        assert_eq!(sel.provider, "github-copilot");

        assert!(entry.select_provider(&Availability::new()).is_none());
        assert_eq!(entry.primary().provider, "anthropic");
    }

    #[test]
    fn test_providers_for_model_prefers_own_chain() {
        let catalog = FallbackCatalog::builtin();
        let own = ModelRequirement::chain(vec![FallbackEntry::builtin(
            &["custom"],
            "gpt-5.2",
            None,
        )]);
        assert_eq!(
            catalog.providers_for_model(Some(&own), "gpt-5.2"),
            Some(vec!["custom".to_string()])
        );
        let found = catalog.providers_for_model(None, "gpt-5.2").unwrap();
        assert_eq!(found[0], "openai");
        assert!(catalog.providers_for_model(None, "no-such-model").is_none());
    }

    #[test]
    fn test_empty_chain_fails_validation() {
        let mut catalog = FallbackCatalog::new();
        catalog.insert_agent("ghost", ModelRequirement::chain(vec![]));
        assert!(catalog.validate().is_err());
    }
}

//! Fallback resolution.
//!
//! [`FallbackResolver::resolve_slots`] turns an agent or category into the
//! ordered list of candidates a task will be allowed to try, and
//! [`select_next`] answers which of them should replace a model that just
//! failed. Declared order is authoritative everywhere: nothing here re-sorts
//! candidates by cost, latency or any other runtime signal.

use crate::availability::Availability;
use crate::catalog::{FallbackCatalog, FallbackEntry, ModelRequirement};
use crate::config::{FallbackModel, FallbackOverrides};
use handoff_core::{HandoffError, HandoffResult, ModelSelection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Default ceiling on resolved candidates, bounding worst-case retry latency.
pub const DEFAULT_MAX_SLOTS: usize = 4;

/// What to resolve slots for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveTarget<'a> {
    /// A named agent, optionally launched under an explicit category.
    Agent {
        name: &'a str,
        category: Option<&'a str>,
    },
    /// A bare task category.
    Category(&'a str),
}

impl<'a> ResolveTarget<'a> {
    /// An agent without an explicit category.
    pub fn agent(name: &'a str) -> Self {
        ResolveTarget::Agent {
            name,
            category: None,
        }
    }

    /// The agent or category name.
    pub fn name(&self) -> &'a str {
        match *self {
            ResolveTarget::Agent { name, .. } => name,
            ResolveTarget::Category(name) => name,
        }
    }
}

/// Where the resolved chain came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotSource {
    AgentOverride,
    CategoryOverride,
    Catalog,
    /// Neither an override nor a catalog entry exists.
    None,
}

/// The bounded, ordered candidate list for one agent or category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSlots {
    pub entries: Vec<FallbackEntry>,
    pub source: SlotSource,
    /// Copied from the governing requirement: the task must end up on some
    /// model, so exhausting the chain is fatal.
    pub requires_any_model: bool,
}

impl ResolvedSlots {
    fn empty(requires_any_model: bool) -> Self {
        Self {
            entries: Vec::new(),
            source: SlotSource::None,
            requires_any_model,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fully-qualified selections, using the first connected provider of
    /// each entry or its preferred provider when none is connected.
    pub fn selections(&self, availability: &Availability) -> Vec<ModelSelection> {
        self.entries
            .iter()
            .map(|e| e.select_provider(availability).unwrap_or_else(|| e.primary()))
            .collect()
    }
}

/// Outcome of [`select_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextModel {
    /// The first entry whose model has not been tried yet.
    Next(FallbackEntry),
    /// Every model in the chain has been tried.
    Exhausted,
}

/// Scans `chain` in order and returns the first entry whose model is not in
/// `tried`.
///
/// Two entries naming the same model share its tried state, so the earlier
/// entry's variant always wins.
pub fn select_next(chain: &[FallbackEntry], tried: &[String]) -> NextModel {
    chain
        .iter()
        .find(|entry| !tried.iter().any(|m| *m == entry.model))
        .cloned()
        .map_or(NextModel::Exhausted, NextModel::Next)
}

/// Resolves fallback chains against the catalog, user overrides and the
/// current provider availability.
#[derive(Debug, Clone)]
pub struct FallbackResolver {
    catalog: FallbackCatalog,
    max_slots: usize,
}

impl FallbackResolver {
    /// A resolver over `catalog` with the default slot ceiling.
    pub fn new(catalog: FallbackCatalog) -> Self {
        Self {
            catalog,
            max_slots: DEFAULT_MAX_SLOTS,
        }
    }

    /// Sets the slot ceiling (minimum 1).
    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots.max(1);
        self
    }

    pub fn catalog(&self) -> &FallbackCatalog {
        &self.catalog
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// The catalog requirement governing `target`: the agent's own entry,
    /// else the entry of the category it delegates to.
    pub fn requirement(
        &self,
        target: ResolveTarget<'_>,
        overrides: &FallbackOverrides,
    ) -> Option<&ModelRequirement> {
        match target {
            ResolveTarget::Agent { name, .. } => self.catalog.agent(name).or_else(|| {
                delegated_category(target, overrides).and_then(|c| self.catalog.category(c))
            }),
            ResolveTarget::Category(name) => self.catalog.category(name),
        }
    }

    /// Produces the ordered candidate list for `target`.
    ///
    /// 1. An agent override with a non-empty `fallback` list replaces the
    ///    catalog chain outright; otherwise a non-empty override of the
    ///    delegated category does; otherwise the catalog chain is used.
    /// 2. The requirement's `requires_model` / `requires_provider` narrow the
    ///    chain. If nothing survives, resolution fails with
    ///    [`HandoffError::ProviderUnavailable`].
    /// 3. Repeated models collapse onto their first position.
    /// 4. Unless the requirement demands *some* model, entries with no
    ///    connected provider are dropped; if that drops everything, the
    ///    unfiltered chain is kept.
    /// 5. The result is truncated to the slot ceiling.
    pub fn resolve_slots(
        &self,
        target: ResolveTarget<'_>,
        overrides: &FallbackOverrides,
        availability: &Availability,
    ) -> HandoffResult<ResolvedSlots> {
        let requirement = self.requirement(target, overrides);
        let requires_any_model = requirement.is_some_and(|r| r.requires_any_model);

        let Some((chain, source)) = self.base_chain(target, overrides, requirement) else {
            debug!(name = target.name(), "No fallback chain configured");
            return Ok(ResolvedSlots::empty(requires_any_model));
        };

        let chain = apply_requirement(chain, requirement);
        if chain.is_empty() {
            return Err(HandoffError::ProviderUnavailable(format!(
                "no fallback entry for '{}' satisfies its provider/model requirement",
                target.name()
            )));
        }
        let chain = dedupe_models(chain);

        let mut entries = if requires_any_model {
            chain
        } else {
            let viable: Vec<FallbackEntry> = chain
                .iter()
                .filter(|e| e.is_viable(availability))
                .cloned()
                .collect();
            if viable.is_empty() {
                warn!(
                    name = target.name(),
                    "No fallback entry has a connected provider, keeping the full chain"
                );
                chain
            } else {
                viable
            }
        };
        entries.truncate(self.max_slots);

        debug!(
            name = target.name(),
            source = ?source,
            slots = entries.len(),
            "Resolved fallback slots"
        );

        Ok(ResolvedSlots {
            entries,
            source,
            requires_any_model,
        })
    }

    fn base_chain(
        &self,
        target: ResolveTarget<'_>,
        overrides: &FallbackOverrides,
        requirement: Option<&ModelRequirement>,
    ) -> Option<(Vec<FallbackEntry>, SlotSource)> {
        if let ResolveTarget::Agent { name, .. } = target {
            if let Some(o) = overrides.agent(name) {
                let chain = self.expand_override(&o.fallback, requirement, name);
                if !chain.is_empty() {
                    return Some((chain, SlotSource::AgentOverride));
                }
            }
        }

        if let Some(category) = delegated_category(target, overrides) {
            if let Some(o) = overrides.category(category) {
                let chain = self.expand_override(&o.fallback, requirement, category);
                if !chain.is_empty() {
                    return Some((chain, SlotSource::CategoryOverride));
                }
            }
        }

        requirement.map(|r| (r.fallback_chain.clone(), SlotSource::Catalog))
    }

    /// Turns override models into entries. Qualified models keep their
    /// provider; bare ones borrow the provider list from the catalog.
    fn expand_override(
        &self,
        models: &[FallbackModel],
        requirement: Option<&ModelRequirement>,
        owner: &str,
    ) -> Vec<FallbackEntry> {
        models
            .iter()
            .filter_map(|m| {
                let (provider, model) = m.split();
                let providers = match provider {
                    Some(p) => Some(vec![p.to_string()]),
                    None => self.catalog.providers_for_model(requirement, model),
                };
                match providers {
                    Some(providers) => Some(FallbackEntry {
                        providers,
                        model: model.to_string(),
                        variant: m.variant.clone(),
                    }),
                    None => {
                        warn!(
                            owner,
                            model = %m.model,
                            "Override model has no known provider, skipping"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

/// The category a target delegates to: the explicit one, else the one the
/// agent's override names.
fn delegated_category<'a>(
    target: ResolveTarget<'a>,
    overrides: &'a FallbackOverrides,
) -> Option<&'a str> {
    match target {
        ResolveTarget::Agent {
            category: Some(c), ..
        } => Some(c),
        ResolveTarget::Agent {
            name,
            category: None,
        } => overrides.agent(name).and_then(|o| o.category.as_deref()),
        ResolveTarget::Category(c) => Some(c),
    }
}

fn apply_requirement(
    mut chain: Vec<FallbackEntry>,
    requirement: Option<&ModelRequirement>,
) -> Vec<FallbackEntry> {
    let Some(req) = requirement else {
        return chain;
    };
    if let Some(model) = &req.requires_model {
        chain.retain(|e| e.model == *model);
    }
    if let Some(allowed) = &req.requires_provider {
        for entry in &mut chain {
            entry.providers.retain(|p| allowed.contains(p));
        }
        chain.retain(|e| !e.providers.is_empty());
    }
    chain
}

fn dedupe_models(chain: Vec<FallbackEntry>) -> Vec<FallbackEntry> {
    let mut seen = HashSet::new();
    chain
        .into_iter()
        .filter(|e| seen.insert(e.model.clone()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{AgentOverride, CategoryOverride};
    use handoff_core::PROVIDER_SEPARATOR;

    fn resolver() -> FallbackResolver {
        FallbackResolver::new(FallbackCatalog::builtin())
    }

    fn models(slots: &ResolvedSlots) -> Vec<&str> {
        slots.entries.iter().map(|e| e.model.as_str()).collect()
    }

    #[test]
    fn test_kord_drops_unconnected_first_entry() {
        let avail = Availability::connected(["openai"]);
        let slots = resolver()
            .resolve_slots(ResolveTarget::agent("kord"), &FallbackOverrides::default(), &avail)
            .unwrap();
        assert_eq!(slots.source, SlotSource::Catalog);
        assert_eq!(models(&slots), vec!["gpt-5.2"]);
    }

    #[test]
    fn test_filter_then_cap_keeps_original_order() {
        let avail = Availability::connected(["openai", "opencode"]);
        let slots = resolver()
            .resolve_slots(ResolveTarget::agent("kord"), &FallbackOverrides::default(), &avail)
            .unwrap();
        // claude-opus-4-6 is reachable through opencode, so all five survive
        // filtering and the ceiling keeps the first four.
        assert_eq!(
            models(&slots),
            vec!["claude-opus-4-6", "gpt-5.2", "gemini-3-pro", "glm-4.7"]
        );

        let avail = Availability::connected(["openai", "zai-coding-plan"]);
        let slots = resolver()
            .resolve_slots(ResolveTarget::agent("kord"), &FallbackOverrides::default(), &avail)
            .unwrap();
        assert_eq!(models(&slots), vec!["gpt-5.2", "glm-4.7"]);
    }

    #[test]
    fn test_nothing_connected_keeps_unfiltered_chain() {
        let slots = resolver()
            .resolve_slots(
                ResolveTarget::agent("kord"),
                &FallbackOverrides::default(),
                &Availability::new(),
            )
            .unwrap();
        assert_eq!(slots.len(), DEFAULT_MAX_SLOTS);
        assert_eq!(slots.entries[0].model, "claude-opus-4-6");
    }

    #[test]
    fn test_requires_any_model_skips_filtering() {
        let avail = Availability::connected(["openai"]);
        let slots = resolver()
            .resolve_slots(ResolveTarget::agent("explore"), &FallbackOverrides::default(), &avail)
            .unwrap();
        assert!(slots.requires_any_model);
        assert_eq!(
            models(&slots),
            vec!["grok-code-fast-1", "claude-haiku-4-5", "gpt-5-nano"]
        );
    }

    #[test]
    fn test_agent_override_replaces_catalog_chain() {
        let mut overrides = FallbackOverrides::default();
        overrides.agents.insert(
            "kord".into(),
            AgentOverride {
                category: None,
                fallback: vec![FallbackModel::new("openai/gpt-5.2").with_variant("xhigh")],
            },
        );
        let avail = Availability::connected(["openai", "anthropic"]);
        let slots = resolver()
            .resolve_slots(ResolveTarget::agent("kord"), &overrides, &avail)
            .unwrap();
        assert_eq!(slots.source, SlotSource::AgentOverride);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.entries[0].providers, vec!["openai".to_string()]);
        assert_eq!(slots.entries[0].variant.as_deref(), Some("xhigh"));
    }

    #[test]
    fn test_agent_delegates_to_category_override() {
        let mut overrides = FallbackOverrides::default();
        overrides.agents.insert(
            "kord".into(),
            AgentOverride {
                category: Some("quick".into()),
                fallback: vec![],
            },
        );
        overrides.categories.insert(
            "quick".into(),
            CategoryOverride {
                fallback: vec![FallbackModel::new("claude-haiku-4-5")],
            },
        );
        let avail = Availability::connected(["anthropic"]);
        let slots = resolver()
            .resolve_slots(ResolveTarget::agent("kord"), &overrides, &avail)
            .unwrap();
        assert_eq!(slots.source, SlotSource::CategoryOverride);
        assert_eq!(models(&slots), vec!["claude-haiku-4-5"]);
        assert_eq!(slots.entries[0].providers[0], "anthropic");
    }

    #[test]
    fn test_unresolvable_override_falls_through_to_catalog() {
        let mut overrides = FallbackOverrides::default();
        overrides.agents.insert(
            "oracle".into(),
            AgentOverride {
                category: None,
                fallback: vec![FallbackModel::new("mystery-model")],
            },
        );
        let avail = Availability::connected(["openai"]);
        let slots = resolver()
            .resolve_slots(ResolveTarget::agent("oracle"), &overrides, &avail)
            .unwrap();
        assert_eq!(slots.source, SlotSource::Catalog);
        assert_eq!(slots.entries[0].model, "gpt-5.2");
    }

    #[test]
    fn test_requires_provider_narrows_entries() {
        let avail = Availability::connected(["google", "anthropic", "github-copilot"]);
        let slots = resolver()
            .resolve_slots(
                ResolveTarget::Category("visual-engineering"),
                &FallbackOverrides::default(),
                &avail,
            )
            .unwrap();
        assert_eq!(models(&slots), vec!["gemini-3-pro", "claude-opus-4-6"]);
        assert_eq!(
            slots.entries[1].providers,
            vec!["github-copilot".to_string(), "opencode".to_string()]
        );
    }

    #[test]
    fn test_requires_model_filters_override() {
        let mut overrides = FallbackOverrides::default();
        overrides.categories.insert(
            "deep".into(),
            CategoryOverride {
                fallback: vec![FallbackModel::new("anthropic/claude-opus-4-6")],
            },
        );
        let err = resolver()
            .resolve_slots(
                ResolveTarget::Category("deep"),
                &overrides,
                &Availability::connected(["anthropic"]),
            )
            .unwrap_err();
        assert!(matches!(err, HandoffError::ProviderUnavailable(_)));

        let slots = resolver()
            .resolve_slots(
                ResolveTarget::Category("deep"),
                &FallbackOverrides::default(),
                &Availability::connected(["openai"]),
            )
            .unwrap();
        assert_eq!(models(&slots), vec!["gpt-5.2-codex"]);
    }

    #[test]
    fn test_agent_without_catalog_entry_uses_category_chain() {
        let target = ResolveTarget::Agent {
            name: "build-helper",
            category: Some("writing"),
        };
        let slots = resolver()
            .resolve_slots(target, &FallbackOverrides::default(), &Availability::connected(["google"]))
            .unwrap();
        assert_eq!(slots.source, SlotSource::Catalog);
        assert_eq!(models(&slots), vec!["gemini-3-flash"]);
    }

    #[test]
    fn test_unknown_target_resolves_empty() {
        let slots = resolver()
            .resolve_slots(
                ResolveTarget::agent("nobody"),
                &FallbackOverrides::default(),
                &Availability::connected(["openai"]),
            )
            .unwrap();
        assert!(slots.is_empty());
        assert_eq!(slots.source, SlotSource::None);
    }

    #[test]
    fn test_duplicate_model_keeps_earlier_variant() {
        let mut catalog = FallbackCatalog::new();
        catalog.insert_agent(
            "dup",
            ModelRequirement::chain(vec![
                FallbackEntry::new(vec!["openai".into()], "gpt-5.2", Some("high".into())).unwrap(),
                FallbackEntry::new(vec!["openai".into()], "gpt-5.2", Some("low".into())).unwrap(),
                FallbackEntry::new(vec!["google".into()], "gemini-3-pro", None).unwrap(),
            ]),
        );
        let slots = FallbackResolver::new(catalog)
            .resolve_slots(
                ResolveTarget::agent("dup"),
                &FallbackOverrides::default(),
                &Availability::connected(["openai", "google"]),
            )
            .unwrap();
        assert_eq!(models(&slots), vec!["gpt-5.2", "gemini-3-pro"]);
        assert_eq!(slots.entries[0].variant.as_deref(), Some("high"));
    }

    #[test]
    fn test_every_catalog_target_respects_ceiling() {
        let resolver = resolver();
        let snapshots = [
            Availability::new(),
            Availability::connected(["openai"]),
            Availability::connected(["anthropic", "google", "openai", "opencode"]),
        ];
        let catalog = resolver.catalog().clone();
        let targets = catalog
            .agent_names()
            .map(ResolveTarget::agent)
            .chain(catalog.category_names().map(ResolveTarget::Category));
        for target in targets {
            for avail in &snapshots {
                let slots = resolver
                    .resolve_slots(target, &FallbackOverrides::default(), avail)
                    .unwrap();
                assert!(slots.len() <= DEFAULT_MAX_SLOTS, "{}", target.name());
                for entry in &slots.entries {
                    assert!(!entry.model.contains(PROVIDER_SEPARATOR));
                    assert!(!entry.providers.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_custom_ceiling() {
        let slots = resolver()
            .with_max_slots(2)
            .resolve_slots(
                ResolveTarget::agent("kord"),
                &FallbackOverrides::default(),
                &Availability::connected(["opencode"]),
            )
            .unwrap();
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_select_next_skips_tried_models() {
        let chain = FallbackCatalog::builtin().agent("oracle").unwrap().fallback_chain.clone();
        assert_eq!(select_next(&chain, &[]), NextModel::Next(chain[0].clone()));
        let tried = vec!["gpt-5.2".to_string()];
        assert_eq!(select_next(&chain, &tried), NextModel::Next(chain[1].clone()));
    }

    #[test]
    fn test_select_next_exhausted_is_idempotent() {
        let chain = FallbackCatalog::builtin().agent("oracle").unwrap().fallback_chain.clone();
        let tried: Vec<String> = chain.iter().map(|e| e.model.clone()).collect();
        assert_eq!(select_next(&chain, &tried), NextModel::Exhausted);
        assert_eq!(select_next(&chain, &tried), NextModel::Exhausted);
        assert_eq!(select_next(&[], &[]), NextModel::Exhausted);
    }

    #[test]
    fn test_selections_fall_back_to_primary_provider() {
        let slots = resolver()
            .resolve_slots(
                ResolveTarget::agent("oracle"),
                &FallbackOverrides::default(),
                &Availability::connected(["github-copilot"]),
            )
            .unwrap();
        let selections = slots.selections(&Availability::connected(["github-copilot"]));
        assert_eq!(selections[0].to_string(), "github-copilot/gpt-5.2:high");
        let offline = slots.selections(&Availability::new());
        assert_eq!(offline[0].provider, "openai");
    }
}

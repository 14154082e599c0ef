use async_trait::async_trait;
use handoff_core::HandoffResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Point-in-time view of which providers are connected and which models
/// they expose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    connected: BTreeSet<String>,
    /// Models a provider advertises. A connected provider without an entry
    /// here is assumed to serve any model.
    #[serde(default)]
    models: BTreeMap<String, BTreeSet<String>>,
}

impl Availability {
    /// Nothing connected.
    pub fn new() -> Self {
        Self::default()
    }

    /// The given providers connected, serving any model.
    pub fn connected<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            connected: providers.into_iter().map(Into::into).collect(),
            models: BTreeMap::new(),
        }
    }

    /// Marks a provider connected.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.connected.insert(provider.into());
        self
    }

    /// Marks a provider connected and restricts it to the listed models.
    pub fn with_models<I, S>(mut self, provider: impl Into<String>, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let provider = provider.into();
        self.connected.insert(provider.clone());
        self.models
            .entry(provider)
            .or_default()
            .extend(models.into_iter().map(Into::into));
        self
    }

    /// Whether the provider is connected.
    pub fn is_connected(&self, provider: &str) -> bool {
        self.connected.contains(provider)
    }

    /// Whether the provider is connected and can serve `model`.
    pub fn exposes(&self, provider: &str, model: &str) -> bool {
        if !self.is_connected(provider) {
            return false;
        }
        match self.models.get(provider) {
            Some(models) if !models.is_empty() => models.contains(model),
            _ => true,
        }
    }

    /// Connected providers, sorted.
    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.connected.iter().map(String::as_str)
    }

    /// True when no provider is connected.
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty()
    }
}

/// Read-only source of [`Availability`] snapshots.
#[async_trait]
pub trait AvailabilityOracle: Send + Sync {
    /// Current snapshot.
    async fn availability(&self) -> HandoffResult<Availability>;
}

/// An oracle that always answers with the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticAvailability(pub Availability);

#[async_trait]
impl AvailabilityOracle for StaticAvailability {
    async fn availability(&self) -> HandoffResult<Availability> {
        Ok(self.0.clone())
    }
}

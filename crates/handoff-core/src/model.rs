use crate::error::{HandoffError, HandoffResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Separates the provider from the model in a qualified id (`openai/gpt-5.2`).
pub const PROVIDER_SEPARATOR: char = '/';

/// Separates the variant from the model in a selection string (`gpt-5.2:high`).
pub const VARIANT_SEPARATOR: char = ':';

/// A fully-qualified model choice: which provider serves which model, at
/// which variant (reasoning tier).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSelection {
    /// Provider id, e.g. `anthropic`.
    pub provider: String,
    /// Model id without a provider prefix.
    pub model: String,
    /// Optional provider-specific tier, e.g. `max`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ModelSelection {
    /// Creates a selection without a variant.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            variant: None,
        }
    }

    /// Sets the variant.
    pub fn with_variant(mut self, variant: Option<String>) -> Self {
        self.variant = variant;
        self
    }

    /// `provider/model`, without the variant.
    pub fn qualified(&self) -> String {
        format!("{}{PROVIDER_SEPARATOR}{}", self.provider, self.model)
    }
}

impl std::fmt::Display for ModelSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}{VARIANT_SEPARATOR}{v}", self.qualified()),
            None => write!(f, "{}", self.qualified()),
        }
    }
}

impl FromStr for ModelSelection {
    type Err = HandoffError;

    /// Parses `provider/model[:variant]`. The variant is split at the first
    /// `:` after the provider separator.
    fn from_str(s: &str) -> HandoffResult<Self> {
        let (provider, rest) = match split_qualified(s.trim()) {
            (Some(p), rest) => (p, rest),
            (None, _) => {
                return Err(HandoffError::InvalidInput(format!(
                    "model selection '{s}' is missing a provider prefix"
                )))
            }
        };
        let (model, variant) = match rest.split_once(VARIANT_SEPARATOR) {
            Some((m, v)) if !v.is_empty() => (m, Some(v.to_string())),
            Some((m, _)) => (m, None),
            None => (rest, None),
        };
        if provider.is_empty() || model.is_empty() || model.contains(PROVIDER_SEPARATOR) {
            return Err(HandoffError::InvalidInput(format!(
                "malformed model selection '{s}'"
            )));
        }
        Ok(Self::new(provider, model).with_variant(variant))
    }
}

/// Splits `provider/model` into its parts. A bare model yields `(None, model)`.
pub fn split_qualified(id: &str) -> (Option<&str>, &str) {
    match id.split_once(PROVIDER_SEPARATOR) {
        Some((provider, model)) => (Some(provider), model),
        None => (None, id),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_and_without_variant() {
        let plain = ModelSelection::new("openai", "gpt-5.2");
        assert_eq!(plain.to_string(), "openai/gpt-5.2");
        let tiered = plain.with_variant(Some("high".into()));
        assert_eq!(tiered.to_string(), "openai/gpt-5.2:high");
        assert_eq!(tiered.qualified(), "openai/gpt-5.2");
    }

    #[test]
    fn test_parse_selection() {
        let sel: ModelSelection = "anthropic/claude-opus-4-6:max".parse().unwrap();
        assert_eq!(sel.provider, "anthropic");
        assert_eq!(sel.model, "claude-opus-4-6");
        assert_eq!(sel.variant.as_deref(), Some("max"));

        let bare: ModelSelection = "google/gemini-3-pro".parse().unwrap();
        assert!(bare.variant.is_none());
    }

    #[test]
    fn test_parse_rejects_missing_provider() {
        assert!("gpt-5.2".parse::<ModelSelection>().is_err());
        assert!("/gpt-5.2".parse::<ModelSelection>().is_err());
        assert!("openrouter/anthropic/claude".parse::<ModelSelection>().is_err());
    }

    #[test]
    fn test_split_qualified() {
        assert_eq!(split_qualified("openai/gpt-5.2"), (Some("openai"), "gpt-5.2"));
        assert_eq!(split_qualified("glm-4.7"), (None, "glm-4.7"));
    }
}

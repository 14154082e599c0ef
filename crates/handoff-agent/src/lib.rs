//! Model selection for delegated agents.
//!
//! Knows, for every agent and task category, which (provider, model, variant)
//! candidates are acceptable and in which order, and narrows that list to what
//! the host runtime can actually reach right now.
//!
//! # Main types
//!
//! - [`FallbackCatalog`] — Built-in chains and requirements per agent and category.
//! - [`Availability`] — Snapshot of connected providers and exposed models.
//! - [`FallbackResolver`] — Produces [`ResolvedSlots`] and picks the next untried model.
//! - [`HostRuntime`] — The seam to the host that owns sessions.

pub mod availability;
pub mod catalog;
pub mod config;
pub mod failover;
pub mod host;
pub mod resolver;

pub use availability::{Availability, AvailabilityOracle, StaticAvailability};
pub use catalog::{FallbackCatalog, FallbackEntry, ModelRequirement};
pub use config::{AgentOverride, CategoryOverride, FallbackModel, FallbackOverrides};
pub use failover::is_retryable;
pub use host::{HostRuntime, PromptRequest, SessionRequest, SessionStatus};
pub use resolver::{
    select_next, FallbackResolver, NextModel, ResolveTarget, ResolvedSlots, SlotSource,
    DEFAULT_MAX_SLOTS,
};

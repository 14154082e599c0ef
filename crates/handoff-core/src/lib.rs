//! Core types and error definitions for the Handoff delegation engine.
//!
//! This crate provides the foundational types shared across all Handoff crates:
//! the unified error enum, the session message model exchanged with the host
//! runtime, and fully-qualified model selections.
//!
//! # Main types
//!
//! - [`HandoffError`] — Unified error enum for all Handoff subsystems.
//! - [`HandoffResult`] — Convenience alias for `Result<T, HandoffError>`.
//! - [`SessionMessage`] — A single message read back from a host session.
//! - [`MessagePart`] — Text, reasoning, tool call or tool result content.
//! - [`ModelSelection`] — A `provider/model[:variant]` triple.

/// Error types.
pub mod error;
/// Session message model.
pub mod message;
/// Fully-qualified model selections.
pub mod model;

pub use error::{HandoffError, HandoffResult};
pub use message::{MessagePart, MessageRole, SessionMessage};
pub use model::{split_qualified, ModelSelection, PROVIDER_SEPARATOR, VARIANT_SEPARATOR};

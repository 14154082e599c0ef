//! Background task orchestration for delegated subagent work.
//!
//! Tracks every delegated task from launch to a terminal state, bounds how
//! many tasks of one concurrency group run at once, and rescues sessions
//! stuck in provider retry loops by moving them to the next model in their
//! fallback chain.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Launch / resume / poll / cancel entry points for the host.
//! - [`TaskRegistry`] — Authoritative in-memory map of task records and their state machine.
//! - [`ConcurrencyGate`] — Per-key admission counter.
//! - [`StuckDetector`] — Pure inactivity detector driving model substitution.
//! - [`HandoffConfig`] — TOML configuration surface.

/// Engine configuration.
pub mod config;
/// Per-key concurrency limits.
pub mod concurrency;
/// Stuck-session detection.
pub mod detector;
/// Orchestration engine.
pub mod engine;
/// Task registry and lifecycle state machine.
pub mod registry;
/// Session transcript queries.
pub mod transcript;
/// Shared task types.
pub mod types;

pub use concurrency::{ConcurrencyGate, ConcurrencySlot};
pub use config::{ConcurrencyConfig, HandoffConfig, StuckConfig};
pub use detector::{DetectorAction, DetectorState, Observation, StuckDetector};
pub use engine::{LaunchOutcome, Orchestrator, ResumeInput, ResumeOutcome};
pub use registry::TaskRegistry;
pub use transcript::{Transcript, TranscriptMessage, TranscriptQuery, DEFAULT_TRANSCRIPT_CAP};
pub use types::{
    BackgroundTask, FailureKind, LaunchInput, ProgressDelta, TaskFailure, TaskFilter, TaskStatus,
    TaskSummary, TerminalOutcome,
};

//! Adjutant: an instruction-driven task orchestrator.
//!
//! An instruction is one natural-language request ("find the report on my
//! desktop and delete it"). The engine parses it into structured intents
//! through a swappable NLU provider, builds a deterministic dependency-aware
//! plan, gates every step through a safety policy (capability allow-set,
//! filesystem sandbox, confirmation for destructive work), dispatches steps
//! to system and browser executors with bounded concurrency, and aggregates
//! everything into an auditable execution trace. Success statistics feed a
//! persistent learning store that flags historically unreliable patterns for
//! extra confirmation.
//!
//! Entry point: [`orchestrator::Orchestrator`] — `bootstrap` a default
//! runtime from an [`config::AssistantConfig`], then `run` instructions.

pub mod capabilities;
pub mod config;
pub mod errors;
pub mod learning;
pub mod nlu;
pub mod orchestrator;
pub mod planner;
pub mod safety;
pub mod types;

pub use config::AssistantConfig;
pub use orchestrator::{ConfirmationHandler, ConfirmationRequest, Orchestrator, RunOutcome};
pub use types::{ExecutionTrace, Instruction, RunStatus};

//! Failure taxonomy for the orchestration engine.
//!
//! Parse and plan failures abort a whole run (nothing can safely execute).
//! Safety denials and execution failures are local to a step: they fail that
//! step and cascade only to its dependents. Nothing fails silently; every
//! failure is attached to its step in the execution trace.

use thiserror::Error;

/// The NLU provider could not produce intents.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseFailure {
    #[error("timeout")]
    Timeout,
    #[error("NLU provider unavailable: {0}")]
    Unavailable(String),
    #[error("instruction is ambiguous: {0}")]
    Ambiguous(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// The plan builder could not produce a runnable plan.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanFailure {
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),
    #[error("missing required parameter '{parameter}' for capability '{capability}'")]
    MissingParameter {
        capability: String,
        parameter: String,
    },
    #[error("dependency cycle involving step {0}")]
    DependencyCycle(String),
    #[error("ambiguous reference: {0}")]
    AmbiguousReference(String),
}

/// An executor failed to complete a step.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionFailure {
    #[error("execution timed out")]
    Timeout,
    #[error("execution cancelled")]
    Cancelled,
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("executor error: {0}")]
    Internal(String),
}

/// Registry lookup failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
}

/// Learning store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Invalid(e.to_string())
    }
}

/// Run-level failure surfaced alongside the (possibly empty) trace.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RunError {
    #[error("parse failure: {0}")]
    Parse(#[from] ParseFailure),
    #[error("plan failure: {0}")]
    Plan(#[from] PlanFailure),
    #[error("run aborted by caller")]
    Aborted,
}

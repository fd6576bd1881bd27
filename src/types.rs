//! Core data model for the orchestration engine.
//!
//! Design goals:
//! - Small, serializable structures with stable snake_case field names so the
//!   execution trace can be rendered by any caller.
//! - Deterministic containers (`BTreeMap` for parameters) so planning over the
//!   same inputs always produces the same plan.
//! - Identifiers are opaque strings (UUID v4 underneath).
//!
//! Unit tests for plan invariants are colocated at the bottom of this file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Identifier for an instruction (opaque string).
pub type InstructionId = String;
/// Identifier for a step within a plan (opaque string).
pub type StepId = String;
/// Identifier for a plan (opaque string).
pub type PlanId = String;
/// Identifier for one orchestrator run (opaque string).
pub type RunId = String;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A raw natural-language request from the caller. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instruction {
    pub id: InstructionId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Optional session/context correlation id supplied by the caller.
    pub session: Option<String>,
}

impl Instruction {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            text: text.into(),
            timestamp: Utc::now(),
            session: None,
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }
}

/// Structured (capability, parameters) extracted from an instruction by the
/// NLU provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub capability: String,
    pub params: BTreeMap<String, serde_json::Value>,
    pub confidence: f64,
    pub instruction_id: InstructionId,
}

impl Intent {
    pub fn new(capability: impl Into<String>, instruction_id: impl Into<InstructionId>) -> Self {
        Self {
            capability: capability.into(),
            params: BTreeMap::new(),
            confidence: 1.0,
            instruction_id: instruction_id.into(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Gated,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether the step has reached a state it can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// One scheduled invocation of a capability within a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: StepId,
    pub capability: String,
    pub params: BTreeMap<String, serde_json::Value>,
    /// Position in the plan; dense and strictly increasing from zero.
    pub ordinal: usize,
    /// Declared data dependency on an earlier step's output.
    pub depends_on: Option<StepId>,
    pub status: StepStatus,
    /// Set by the planner when learned statistics fall below the confidence
    /// floor; forces the safety gate to require confirmation.
    pub low_confidence: bool,
}

impl Step {
    pub fn new(capability: impl Into<String>, ordinal: usize) -> Self {
        Self {
            id: new_id(),
            capability: capability.into(),
            params: BTreeMap::new(),
            ordinal,
            depends_on: None,
            status: StepStatus::Pending,
            low_confidence: false,
        }
    }

    /// String form of a parameter, if present and a JSON string.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Ordered, dependency-annotated sequence of steps for one run. Owned
/// exclusively by a single orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPlan {
    pub id: PlanId,
    pub instruction_id: InstructionId,
    pub steps: Vec<Step>,
}

impl TaskPlan {
    pub fn new(instruction_id: impl Into<InstructionId>, steps: Vec<Step>) -> Self {
        Self {
            id: new_id(),
            instruction_id: instruction_id.into(),
            steps,
        }
    }

    /// Check plan invariants: ordinals dense and strictly increasing; every
    /// dependency references a strictly earlier ordinal in the same plan.
    pub fn validate(&self) -> Result<(), String> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.ordinal != i {
                return Err(format!(
                    "step {} has ordinal {} at position {}",
                    step.id, step.ordinal, i
                ));
            }
            if let Some(dep) = &step.depends_on {
                let Some(source) = self.steps.iter().find(|s| &s.id == dep) else {
                    return Err(format!("step {} depends on unknown step {}", step.id, dep));
                };
                if source.ordinal >= step.ordinal {
                    return Err(format!(
                        "step {} (ordinal {}) depends on non-earlier step {} (ordinal {})",
                        step.id, step.ordinal, source.id, source.ordinal
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Decision taken by the safety gate for one step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    NeedsConfirmation,
}

/// Machine-readable grounds for a verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "code", content = "detail")]
pub enum VerdictReason {
    Allowed,
    CapabilityNotAllowed(String),
    PathOutsideSandbox(String),
    DestructiveRequiresConfirmation,
    LowConfidenceRequiresConfirmation,
}

/// Verdict produced fresh for every step immediately before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyVerdict {
    pub step_id: StepId,
    pub decision: Decision,
    pub reason: VerdictReason,
}

/// Semantic union of executor output payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum StepOutput {
    Text(String),
    Files(Vec<PathBuf>),
    Record(serde_json::Value),
}

impl StepOutput {
    /// Render the payload for feeding into a dependent step's inputs.
    pub fn as_binding_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Files(fs) => fs
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Record(v) => v.to_string(),
        }
    }
}

/// Terminal record of one step's execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    pub output: Option<StepOutput>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn succeeded(step_id: impl Into<StepId>, output: StepOutput, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(step_id: impl Into<StepId>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn skipped(step_id: impl Into<StepId>, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            duration_ms: 0,
        }
    }
}

/// One (step, verdict, result) triple in the audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub step: Step,
    pub verdict: Option<SafetyVerdict>,
    pub result: Option<StepResult>,
}

/// Terminal state of a whole run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Aborted,
}

/// Full audit record of a run: ordered (step, verdict, result) triples.
/// This is the externally observable result of an orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTrace {
    pub run_id: RunId,
    pub instruction_id: InstructionId,
    pub status: RunStatus,
    pub entries: Vec<TraceEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionTrace {
    /// Empty trace for runs that never produced a runnable plan.
    pub fn empty(instruction_id: impl Into<InstructionId>, status: RunStatus) -> Self {
        let now = Utc::now();
        Self {
            run_id: new_id(),
            instruction_id: instruction_id.into(),
            status,
            entries: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Aggregated success statistics for one (capability, parameter-shape)
/// pattern. Created on first observation, updated forever, never deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LearningRecord {
    pub attempts: u64,
    pub successes: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl LearningRecord {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// Coarse pattern key: capability name plus the sorted parameter-name shape.
/// Two steps with the same capability and the same parameter names share
/// statistics regardless of parameter values.
pub fn pattern_key(capability: &str, params: &BTreeMap<String, serde_json::Value>) -> String {
    let shape: Vec<&str> = params.keys().map(String::as_str).collect();
    format!("{}:{}", capability, shape.join(","))
}

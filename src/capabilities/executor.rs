//! Executor trait and per-step execution context.
//!
//! Executors are polymorphic over a single interface: they receive the step,
//! the outputs of its declared dependency, and a context carrying the run id,
//! a cooperative cancellation token, and the policy-configured timeout. The
//! orchestrator enforces the timeout; executors must watch the token so no
//! long-running work is left untracked after a cancel.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::ExecutionFailure;
use crate::types::{RunId, Step, StepId, StepOutput};

/// Values produced by declared dependency steps, keyed by source step id.
#[derive(Debug, Clone, Default)]
pub struct BoundInputs {
    outputs: BTreeMap<StepId, StepOutput>,
}

impl BoundInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, step_id: impl Into<StepId>, output: StepOutput) {
        self.outputs.insert(step_id.into(), output);
    }

    pub fn get(&self, step_id: &str) -> Option<&StepOutput> {
        self.outputs.get(step_id)
    }

    /// The single bound input for steps with exactly one dependency.
    pub fn sole(&self) -> Option<&StepOutput> {
        if self.outputs.len() == 1 {
            self.outputs.values().next()
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Per-step execution context handed to executors.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    /// Child token of the run's root token; cancelled on caller abort.
    pub cancellation: CancellationToken,
    /// Hard wall-clock budget for this step.
    pub timeout: Duration,
}

impl ExecutionContext {
    pub fn new(run_id: impl Into<RunId>, cancellation: CancellationToken, timeout: Duration) -> Self {
        Self {
            run_id: run_id.into(),
            cancellation,
            timeout,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// A component that performs a capability's side effect.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    /// Perform the step. The orchestrator wraps this call in the step
    /// timeout; implementations must also stop promptly when
    /// `cx.cancellation` fires.
    async fn execute(
        &self,
        step: &Step,
        inputs: &BoundInputs,
        cx: &ExecutionContext,
    ) -> Result<StepOutput, ExecutionFailure>;
}

//! Run lifecycle: parse → plan → gate → dispatch → aggregate → learn.
//!
//! One `run` call owns one instruction end to end. The phases are strict:
//! parsing and planning abort the whole run on failure (empty trace), while
//! gate denials and executor failures stay local to their step and cascade
//! only to declared dependents. Gating is sequential — a confirmation
//! suspends the current wave until the handler answers or the deadline
//! passes — but dispatch of allowed steps is concurrent, bounded by
//! `max_concurrency`.
//!
//! Every step's verdict and result land in the `ExecutionTrace` in plan
//! order, so the trace alone answers "what ran, what was blocked, why".

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::browser::{BrowserExecutor, EnvCredentialResolver};
use crate::capabilities::system::SystemExecutor;
use crate::capabilities::{BoundInputs, CapabilityRegistry, ExecutionContext};
use crate::config::{AssistantConfig, NluBackend};
use crate::errors::{ConfigError, ExecutionFailure, ParseFailure, RunError};
use crate::learning::LearningStore;
use crate::nlu::gemini::{GeminiConfig, GeminiProvider};
use crate::nlu::rules::RuleProvider;
use crate::nlu::{CapabilitySummary, NluProvider, NluRequest, TraceSummary};
use crate::planner::PlanBuilder;
use crate::safety::{SafetyGate, SafetyPolicy};
use crate::types::{
    pattern_key, new_id, Decision, ExecutionTrace, Instruction, RunStatus, SafetyVerdict, Step,
    StepId, StepOutput, StepResult, StepStatus, TaskPlan, TraceEntry, VerdictReason,
};

/// How many prior runs are summarized for the NLU provider.
const RECENT_TRACE_WINDOW: usize = 8;

/// A pending confirmation handed to the `ConfirmationHandler`. Consuming it
/// with `approve` or `deny` resumes the suspended run; dropping it counts
/// as denial.
pub struct ConfirmationRequest {
    pub step: Step,
    pub reason: VerdictReason,
    responder: oneshot::Sender<bool>,
}

impl ConfirmationRequest {
    pub fn approve(self) {
        let _ = self.responder.send(true);
    }

    pub fn deny(self) {
        let _ = self.responder.send(false);
    }
}

impl std::fmt::Debug for ConfirmationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationRequest")
            .field("step", &self.step.id)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Delivers confirmation requests to whoever can answer them (a terminal
/// prompt, a UI, a test harness). The orchestrator enforces the deadline.
#[async_trait::async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn deliver(&self, request: ConfirmationRequest);
}

/// Denies everything by dropping the request. Safe default for headless use.
#[derive(Debug, Default)]
pub struct DenyAll;

#[async_trait::async_trait]
impl ConfirmationHandler for DenyAll {
    async fn deliver(&self, request: ConfirmationRequest) {
        request.deny();
    }
}

/// The externally observable result of one run.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub trace: ExecutionTrace,
    /// Run-level failure when parsing or planning aborted the run.
    pub error: Option<RunError>,
}

pub struct Orchestrator {
    config: AssistantConfig,
    registry: Arc<CapabilityRegistry>,
    nlu: Arc<dyn NluProvider>,
    gate: SafetyGate,
    planner: PlanBuilder,
    learning: Arc<LearningStore>,
    confirmations: Arc<dyn ConfirmationHandler>,
    /// Held for session teardown at run end; executors are dispatched
    /// through the registry.
    browser: Option<Arc<BrowserExecutor>>,
    recent: Mutex<Vec<TraceSummary>>,
}

impl Orchestrator {
    pub fn new(
        config: AssistantConfig,
        registry: Arc<CapabilityRegistry>,
        nlu: Arc<dyn NluProvider>,
        learning: Arc<LearningStore>,
        confirmations: Arc<dyn ConfirmationHandler>,
    ) -> Self {
        let gate = SafetyGate::new(SafetyPolicy::from_config(&config.safety));
        let planner = PlanBuilder::new(
            config.learning.confidence_floor,
            config.learning.min_attempts,
        );
        Self {
            config,
            registry,
            nlu,
            gate,
            planner,
            learning,
            confirmations,
            browser: None,
            recent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_browser(mut self, browser: Arc<BrowserExecutor>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Wire the full default runtime from a configuration document: built-in
    /// executors, the configured NLU backend, and the learning store.
    pub fn bootstrap(
        config: AssistantConfig,
        confirmations: Arc<dyn ConfirmationHandler>,
    ) -> Result<Self, ConfigError> {
        let nlu: Arc<dyn NluProvider> = match config.nlu.provider {
            NluBackend::Rules => Arc::new(RuleProvider::new()),
            NluBackend::Gemini => {
                let api_key = config.nlu_api_key().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "gemini backend selected but {} is unset",
                        config.nlu.api_key_env
                    ))
                })?;
                let provider = GeminiProvider::new(GeminiConfig {
                    model: config.nlu.model.clone(),
                    api_key,
                    base_url: config.nlu.base_url.clone(),
                    timeout: config.nlu_timeout(),
                })
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Arc::new(provider)
            }
        };

        let browser = Arc::new(BrowserExecutor::new(
            config.browser.clone(),
            Arc::new(EnvCredentialResolver),
        ));
        let registry = Arc::new(CapabilityRegistry::with_builtins(
            Arc::new(SystemExecutor::new()),
            browser.clone(),
        ));
        let learning = Arc::new(LearningStore::open(
            config.learning.store_path.clone(),
            config.learning.enabled,
        ));

        Ok(Self::new(config, registry, nlu, learning, confirmations).with_browser(browser))
    }

    /// Execute one instruction end to end. Cancelling `cancel` aborts the
    /// run: in-flight steps are interrupted, remaining steps are skipped,
    /// and the trace is finalized as `Aborted`.
    #[instrument(skip_all, fields(instruction = %instruction.id))]
    pub async fn run(&self, instruction: Instruction, cancel: CancellationToken) -> RunOutcome {
        if cancel.is_cancelled() {
            return self.aborted_outcome(&instruction);
        }

        let intents = match self.parse(&instruction, &cancel).await {
            Ok(intents) => intents,
            Err(RunError::Aborted) => return self.aborted_outcome(&instruction),
            Err(e) => {
                warn!(error = %e, "run failed before planning");
                return RunOutcome {
                    status: RunStatus::Failed,
                    trace: ExecutionTrace::empty(&instruction.id, RunStatus::Failed),
                    error: Some(e),
                };
            }
        };

        let snapshot = self.learning.snapshot();
        let plan = match self
            .planner
            .build(&instruction, &intents, &self.registry, &snapshot)
        {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "planning failed");
                return RunOutcome {
                    status: RunStatus::Failed,
                    trace: ExecutionTrace::empty(&instruction.id, RunStatus::Failed),
                    error: Some(RunError::Plan(e)),
                };
            }
        };
        info!(plan = %plan.id, steps = plan.steps.len(), "plan built");

        let outcome = self.execute_plan(&instruction, plan, &cancel).await;
        self.remember(&instruction, &outcome).await;
        outcome
    }

    fn aborted_outcome(&self, instruction: &Instruction) -> RunOutcome {
        RunOutcome {
            status: RunStatus::Aborted,
            trace: ExecutionTrace::empty(&instruction.id, RunStatus::Aborted),
            error: Some(RunError::Aborted),
        }
    }

    async fn parse(
        &self,
        instruction: &Instruction,
        cancel: &CancellationToken,
    ) -> Result<Vec<crate::types::Intent>, RunError> {
        let summaries: Vec<CapabilitySummary> = self
            .registry
            .specs()
            .into_iter()
            .map(CapabilitySummary::from_spec)
            .collect();
        let mut request = NluRequest::new(instruction.clone(), summaries);
        request.recent = self.recent.lock().await.clone();

        let parse = self.nlu.parse(&request);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RunError::Aborted),
            outcome = tokio::time::timeout(self.config.nlu_timeout(), parse) => {
                outcome.map_err(|_| ParseFailure::Timeout)??
            }
        };
        debug!(intents = response.intents.len(), "instruction parsed");
        Ok(response.intents)
    }

    async fn execute_plan(
        &self,
        instruction: &Instruction,
        mut plan: TaskPlan,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let run_id = new_id();
        let started_at = Utc::now();
        let run_token = cancel.child_token();

        let mut verdicts: HashMap<StepId, SafetyVerdict> = HashMap::new();
        let mut results: HashMap<StepId, StepResult> = HashMap::new();
        let mut outputs: HashMap<StepId, StepOutput> = HashMap::new();
        let mut aborted = false;

        loop {
            if cancel.is_cancelled() {
                aborted = true;
                break;
            }

            // Dependents of anything that did not succeed are skipped; this
            // cascades within one pass because skipping is itself terminal.
            let mut cascaded = true;
            while cascaded {
                cascaded = false;
                let unhappy: Vec<StepId> = plan
                    .steps
                    .iter()
                    .filter(|s| {
                        matches!(s.status, StepStatus::Failed | StepStatus::Skipped)
                    })
                    .map(|s| s.id.clone())
                    .collect();
                for step in plan.steps.iter_mut() {
                    if step.status == StepStatus::Pending
                        && step
                            .depends_on
                            .as_ref()
                            .is_some_and(|d| unhappy.contains(d))
                    {
                        step.status = StepStatus::Skipped;
                        results.insert(
                            step.id.clone(),
                            StepResult::skipped(&step.id, "dependency did not succeed"),
                        );
                        cascaded = true;
                    }
                }
            }

            // Ready: pending, with no dependency or a succeeded one.
            let ready: Vec<StepId> = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Pending)
                .filter(|s| match &s.depends_on {
                    None => true,
                    Some(dep) => plan
                        .step(dep)
                        .is_some_and(|d| d.status == StepStatus::Succeeded),
                })
                .map(|s| s.id.clone())
                .collect();
            if ready.is_empty() {
                break;
            }

            // Gate sequentially. A confirmation suspends the whole wave.
            let mut approved: Vec<StepId> = Vec::new();
            for step_id in ready {
                if cancel.is_cancelled() {
                    aborted = true;
                    break;
                }
                let step = plan
                    .steps
                    .iter_mut()
                    .find(|s| s.id == step_id)
                    .filter(|s| s.status == StepStatus::Pending);
                let Some(step) = step else { continue };

                let spec = match self.registry.resolve(&step.capability) {
                    Ok(entry) => entry.spec.clone(),
                    Err(e) => {
                        step.status = StepStatus::Failed;
                        results.insert(step.id.clone(), StepResult::failed(&step.id, e.to_string(), 0));
                        continue;
                    }
                };

                let verdict = self.gate.evaluate(step, &spec);
                verdicts.insert(step.id.clone(), verdict.clone());
                match verdict.decision {
                    Decision::Allow => approved.push(step.id.clone()),
                    Decision::Deny => {
                        debug!(step = %step.id, reason = ?verdict.reason, "step denied");
                        step.status = StepStatus::Failed;
                        results.insert(
                            step.id.clone(),
                            StepResult::failed(&step.id, format!("denied: {:?}", verdict.reason), 0),
                        );
                    }
                    Decision::NeedsConfirmation => {
                        step.status = StepStatus::Gated;
                        let confirmed = self
                            .await_confirmation(step.clone(), verdict.reason.clone(), cancel)
                            .await;
                        match confirmed {
                            None => {
                                aborted = true;
                                step.status = StepStatus::Skipped;
                                results.insert(
                                    step.id.clone(),
                                    StepResult::skipped(&step.id, "run aborted"),
                                );
                            }
                            Some(true) => {
                                step.status = StepStatus::Pending;
                                approved.push(step.id.clone());
                            }
                            Some(false) => {
                                step.status = StepStatus::Skipped;
                                results.insert(
                                    step.id.clone(),
                                    StepResult::skipped(&step.id, "confirmation denied or timed out"),
                                );
                            }
                        }
                    }
                }
                if aborted {
                    break;
                }
            }
            if aborted {
                break;
            }

            // Dispatch the approved set concurrently, bounded.
            let mut in_flight = FuturesUnordered::new();
            let mut queue = approved.into_iter();
            let limit = self.config.max_concurrency.0.max(1);
            loop {
                while in_flight.len() < limit {
                    let Some(step_id) = queue.next() else { break };
                    let Some(step) = plan.step(&step_id).cloned() else { continue };
                    let mut inputs = BoundInputs::new();
                    if let Some(dep) = &step.depends_on {
                        if let Some(output) = outputs.get(dep) {
                            inputs.bind(dep.clone(), output.clone());
                        }
                    }
                    let cx = ExecutionContext::new(
                        run_id.clone(),
                        run_token.child_token(),
                        self.config.step_timeout(),
                    );
                    in_flight.push(self.dispatch(step, inputs, cx));
                }
                let Some((step_id, result, output)) = in_flight.next().await else {
                    break;
                };
                if let Some(step) = plan.steps.iter_mut().find(|s| s.id == step_id) {
                    step.status = result.status;
                }
                if let Some(output) = output {
                    outputs.insert(step_id.clone(), output);
                }
                results.insert(step_id, result);
            }
        }

        if aborted {
            // Whatever never reached a terminal state is skipped.
            for step in plan.steps.iter_mut() {
                if !step.status.is_terminal() {
                    step.status = StepStatus::Skipped;
                    results
                        .entry(step.id.clone())
                        .or_insert_with(|| StepResult::skipped(&step.id, "run aborted"));
                }
            }
        }

        if let Some(browser) = &self.browser {
            browser.teardown(&run_id).await;
        }
        let learning = self.learning.clone();
        match tokio::task::spawn_blocking(move || learning.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "learning flush failed"),
            Err(e) => warn!(error = %e, "learning flush task failed"),
        }

        // Step-level failures and denials stay in the trace; a dispatched run
        // finishes Completed. Failed is reserved for parse and plan failures.
        let status = if aborted {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };

        let entries = plan
            .steps
            .iter()
            .map(|step| TraceEntry {
                step: step.clone(),
                verdict: verdicts.remove(&step.id),
                result: results.remove(&step.id),
            })
            .collect();
        let trace = ExecutionTrace {
            run_id,
            instruction_id: instruction.id.clone(),
            status,
            entries,
            started_at,
            finished_at: Utc::now(),
        };
        info!(run = %trace.run_id, status = ?status, "run finished");

        RunOutcome {
            status,
            trace,
            error: if aborted { Some(RunError::Aborted) } else { None },
        }
    }

    /// Run one approved step and record the attempt in the learning store.
    /// Returns the output separately so dependents can bind it.
    async fn dispatch(
        &self,
        step: Step,
        inputs: BoundInputs,
        cx: ExecutionContext,
    ) -> (StepId, StepResult, Option<StepOutput>) {
        let entry = match self.registry.resolve(&step.capability) {
            Ok(entry) => entry,
            Err(e) => {
                return (step.id.clone(), StepResult::failed(&step.id, e.to_string(), 0), None)
            }
        };
        let started = std::time::Instant::now();
        // The budget is enforced here as well as inside the built-in
        // executors, so an executor that ignores its context still cannot
        // overrun the step.
        let outcome = tokio::select! {
            _ = cx.cancellation.cancelled() => Err(ExecutionFailure::Cancelled),
            result = tokio::time::timeout(cx.timeout, entry.executor.execute(&step, &inputs, &cx)) => {
                result.unwrap_or(Err(ExecutionFailure::Timeout))
            }
        };
        let elapsed = started.elapsed().as_millis() as u64;

        let key = pattern_key(&step.capability, &step.params);
        self.learning.record(&key, outcome.is_ok());

        match outcome {
            Ok(output) => {
                debug!(step = %step.id, ms = elapsed, "step succeeded");
                (
                    step.id.clone(),
                    StepResult::succeeded(&step.id, output.clone(), elapsed),
                    Some(output),
                )
            }
            Err(e) => {
                warn!(step = %step.id, error = %e, "step failed");
                (step.id.clone(), StepResult::failed(&step.id, e.to_string(), elapsed), None)
            }
        }
    }

    /// Suspend until the handler answers, the deadline passes, or the run is
    /// cancelled. `None` means cancelled; otherwise the boolean answer, with
    /// timeout and a dropped request both counting as denial.
    async fn await_confirmation(
        &self,
        step: Step,
        reason: VerdictReason,
        cancel: &CancellationToken,
    ) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        self.confirmations
            .deliver(ConfirmationRequest {
                step,
                reason,
                responder: tx,
            })
            .await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            answer = tokio::time::timeout(self.config.confirmation_timeout(), rx) => {
                Some(matches!(answer, Ok(Ok(true))))
            }
        }
    }

    /// Keep a bounded window of finished runs for NLU context.
    async fn remember(&self, instruction: &Instruction, outcome: &RunOutcome) {
        let summary = TraceSummary {
            instruction_text: instruction.text.clone(),
            capabilities: outcome
                .trace
                .entries
                .iter()
                .map(|e| e.step.capability.clone())
                .collect(),
            status: outcome.status,
        };
        let mut recent = self.recent.lock().await;
        recent.push(summary);
        if recent.len() > RECENT_TRACE_WINDOW {
            let overflow = recent.len() - RECENT_TRACE_WINDOW;
            recent.drain(..overflow);
        }
    }
}

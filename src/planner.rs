//! Plan builder: turns NLU intents into an ordered task plan.
//!
//! A pure transformation, no side effects: validate capabilities against the
//! registry, fill parameter defaults, wire textual back-references into data
//! dependencies, and annotate steps whose learned success rate sits below the
//! confidence floor. Building twice from the same intents and the same
//! learning snapshot yields the same plan.

use std::collections::HashMap;
use tracing::debug;

use crate::capabilities::CapabilityRegistry;
use crate::errors::PlanFailure;
use crate::types::{pattern_key, Instruction, Intent, LearningRecord, Step, TaskPlan};

/// Read-only view of the learning store taken at planning time.
pub type LearningSnapshot = HashMap<String, LearningRecord>;

/// Phrases that mark a parameter as referring to a previous step's output.
const EXPLICIT_MARKERS: &[&str] = &[
    "the file we just found",
    "the file found",
    "that file",
    "the result",
    "the previous step",
    "previous result",
];

/// How a parameter value refers back to earlier output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reference {
    /// A concrete phrase; binds to the nearest preceding intent.
    Explicit,
    /// A bare pronoun; only unambiguous with a single possible source.
    Pronoun,
}

fn detect_reference(value: &str) -> Option<Reference> {
    let lowered = value.trim().to_lowercase();
    if lowered == "it" {
        return Some(Reference::Pronoun);
    }
    if EXPLICIT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some(Reference::Explicit);
    }
    None
}

#[derive(Debug, Clone)]
pub struct PlanBuilder {
    confidence_floor: f64,
    min_attempts: u64,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self {
            confidence_floor: 0.2,
            min_attempts: 5,
        }
    }
}

impl PlanBuilder {
    pub fn new(confidence_floor: f64, min_attempts: u64) -> Self {
        Self {
            confidence_floor,
            min_attempts,
        }
    }

    /// Build a task plan. Fails fast: the first unsupported capability,
    /// missing parameter, or unresolvable reference aborts the whole plan.
    pub fn build(
        &self,
        instruction: &Instruction,
        intents: &[Intent],
        registry: &CapabilityRegistry,
        snapshot: &LearningSnapshot,
    ) -> Result<TaskPlan, PlanFailure> {
        // Validate capabilities and fill defaults, still in NLU order.
        let mut drafts = Vec::with_capacity(intents.len());
        for intent in intents {
            let entry = registry
                .resolve(&intent.capability)
                .map_err(|_| PlanFailure::UnsupportedCapability(intent.capability.clone()))?;

            let mut params = intent.params.clone();
            for spec in &entry.spec.params {
                if params.contains_key(&spec.name) {
                    continue;
                }
                match &spec.default {
                    Some(default) => {
                        params.insert(spec.name.clone(), default.clone());
                    }
                    None if spec.required => {
                        return Err(PlanFailure::MissingParameter {
                            capability: intent.capability.clone(),
                            parameter: spec.name.clone(),
                        });
                    }
                    None => {}
                }
            }
            drafts.push((intent.capability.clone(), params));
        }

        // Resolve textual back-references into dependency edges by index.
        let mut deps: Vec<Option<usize>> = vec![None; drafts.len()];
        for (i, (capability, params)) in drafts.iter().enumerate() {
            let reference = params
                .values()
                .filter_map(|v| v.as_str())
                .find_map(detect_reference);
            let Some(reference) = reference else { continue };

            if i == 0 {
                return Err(PlanFailure::AmbiguousReference(format!(
                    "'{}' references prior output but no step precedes it",
                    capability
                )));
            }
            match reference {
                Reference::Pronoun if i > 1 => {
                    return Err(PlanFailure::AmbiguousReference(format!(
                        "'it' in '{}' could refer to any of {} preceding steps",
                        capability, i
                    )));
                }
                _ => deps[i] = Some(i - 1),
            }
        }

        let order = order_with_pinning(&deps)?;

        // Materialize steps with dense ordinals and deterministic ids.
        let mut steps: Vec<Step> = Vec::with_capacity(drafts.len());
        let mut id_of_index: Vec<Option<String>> = vec![None; drafts.len()];
        for (ordinal, &index) in order.iter().enumerate() {
            let (capability, params) = &drafts[index];
            let id = format!("s{}", ordinal);
            id_of_index[index] = Some(id.clone());

            let mut step = Step::new(capability.as_str(), ordinal);
            step.id = id;
            step.params = params.clone();
            step.depends_on = deps[index]
                .map(|source| id_of_index[source].clone().expect("source emitted first"));

            let key = pattern_key(capability, params);
            if let Some(record) = snapshot.get(&key) {
                if record.attempts >= self.min_attempts
                    && record.success_rate() < self.confidence_floor
                {
                    debug!(pattern = %key, rate = record.success_rate(), "low-confidence pattern");
                    step.low_confidence = true;
                }
            }
            steps.push(step);
        }

        let plan = TaskPlan::new(instruction.id.clone(), steps);
        plan.validate().map_err(PlanFailure::DependencyCycle)?;
        Ok(plan)
    }
}

/// Emit indices in NLU order, except each dependent is pinned immediately
/// after its source (dependents of the same source keep their relative
/// order). Unemittable leftovers mean a dependency cycle.
fn order_with_pinning(deps: &[Option<usize>]) -> Result<Vec<usize>, PlanFailure> {
    let n = deps.len();
    let mut order = Vec::with_capacity(n);
    let mut emitted = vec![false; n];

    fn emit(i: usize, deps: &[Option<usize>], emitted: &mut [bool], order: &mut Vec<usize>) {
        if emitted[i] {
            return;
        }
        emitted[i] = true;
        order.push(i);
        for j in 0..deps.len() {
            if deps[j] == Some(i) {
                emit(j, deps, emitted, order);
            }
        }
    }

    for i in 0..n {
        if deps[i].is_none() {
            emit(i, deps, &mut emitted, &mut order);
        }
    }
    if order.len() != n {
        let stuck = emitted.iter().position(|e| !e).unwrap_or(0);
        return Err(PlanFailure::DependencyCycle(format!("step index {}", stuck)));
    }
    Ok(order)
}

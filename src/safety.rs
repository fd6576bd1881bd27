//! Safety gate: policy-driven pre-execution checks.
//!
//! Policy is data, not code: an allow-set of capabilities, a set of sandbox
//! root directories, a step time budget, and a flag controlling whether
//! destructive capabilities need explicit confirmation. Verdicts are computed
//! fresh for every step immediately before dispatch; nothing is cached across
//! runs because parameters vary.
//!
//! Decision order:
//! 1. capability must be in the allow-set, else DENY;
//! 2. every path-typed parameter must resolve (after `~` expansion, `..`
//!    normalization and symlink resolution) inside an allowed root, else DENY;
//! 3. destructive steps under a confirm-destructive policy, credential
//!    submission, and low-confidence steps need confirmation;
//! 4. otherwise ALLOW.

use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::capabilities::CapabilitySpec;
use crate::config::{expand_home, SafetyConfig};
use crate::types::{Decision, SafetyVerdict, Step, VerdictReason};

/// Materialized policy for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    pub allowed_capabilities: std::collections::HashSet<String>,
    /// Sandbox roots, home-expanded. Canonicalized lazily per check so roots
    /// created after startup still resolve.
    pub allowed_roots: Vec<PathBuf>,
    pub confirm_destructive: bool,
}

impl SafetyPolicy {
    pub fn from_config(cfg: &SafetyConfig) -> Self {
        Self {
            allowed_capabilities: cfg.allowed_capabilities.clone(),
            allowed_roots: cfg.allowed_roots.iter().map(|p| expand_home(p)).collect(),
            confirm_destructive: cfg.require_confirmation_for_destructive,
        }
    }
}

/// Stateless evaluator over a policy.
#[derive(Debug, Clone)]
pub struct SafetyGate {
    policy: SafetyPolicy,
}

impl SafetyGate {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    /// Evaluate one step against the policy. `spec` is the registry entry
    /// for the step's capability (the orchestrator resolves it first).
    pub fn evaluate(&self, step: &Step, spec: &CapabilitySpec) -> SafetyVerdict {
        if !self.policy.allowed_capabilities.contains(&step.capability) {
            return self.verdict(
                step,
                Decision::Deny,
                VerdictReason::CapabilityNotAllowed(step.capability.clone()),
            );
        }

        for param in spec.params.iter().filter(|p| p.is_path) {
            let Some(raw) = step.param_str(&param.name) else {
                continue;
            };
            let resolved = resolve_path(Path::new(raw));
            if !self.inside_allowed_root(&resolved) {
                debug!(step = %step.id, path = %resolved.display(), "path escapes sandbox");
                return self.verdict(
                    step,
                    Decision::Deny,
                    VerdictReason::PathOutsideSandbox(resolved.display().to_string()),
                );
            }
        }

        if spec.always_confirm {
            return self.verdict(
                step,
                Decision::NeedsConfirmation,
                VerdictReason::DestructiveRequiresConfirmation,
            );
        }
        if spec.destructive && self.policy.confirm_destructive {
            return self.verdict(
                step,
                Decision::NeedsConfirmation,
                VerdictReason::DestructiveRequiresConfirmation,
            );
        }
        if step.low_confidence {
            return self.verdict(
                step,
                Decision::NeedsConfirmation,
                VerdictReason::LowConfidenceRequiresConfirmation,
            );
        }

        self.verdict(step, Decision::Allow, VerdictReason::Allowed)
    }

    fn inside_allowed_root(&self, path: &Path) -> bool {
        self.policy.allowed_roots.iter().any(|root| {
            // Compare canonical forms when the root exists, lexical forms
            // otherwise, so symlinked roots and not-yet-created roots both
            // behave.
            let root = root.canonicalize().unwrap_or_else(|_| resolve_path(root));
            path.starts_with(&root)
        })
    }

    fn verdict(&self, step: &Step, decision: Decision, reason: VerdictReason) -> SafetyVerdict {
        SafetyVerdict {
            step_id: step.id.clone(),
            decision,
            reason,
        }
    }
}

/// Resolve a user-supplied path: expand `~`, absolutize against the current
/// directory, normalize `.`/`..` lexically, then resolve symlinks through the
/// longest existing prefix. The target itself may not exist yet (search
/// targets, files about to be created).
pub fn resolve_path(raw: &Path) -> PathBuf {
    let expanded = expand_home(raw);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    };

    let normalized = normalize_lexically(&absolute);

    // Walk down from the full path to the longest existing ancestor and
    // canonicalize that prefix, so a symlink anywhere on the path cannot
    // smuggle the target outside the sandbox.
    let mut prefix = normalized.as_path();
    loop {
        if let Ok(canonical) = prefix.canonicalize() {
            let rest = normalized.strip_prefix(prefix).unwrap_or(Path::new(""));
            // join("") would append a trailing separator.
            return if rest.as_os_str().is_empty() {
                canonical
            } else {
                canonical.join(rest)
            };
        }
        match prefix.parent() {
            Some(parent) => prefix = parent,
            None => return normalized,
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{CapabilityKind, ParamSpec};
    use serde_json::json;
    use std::collections::HashSet;

    fn spec(name: &str, destructive: bool, always_confirm: bool, path_param: bool) -> CapabilitySpec {
        let mut params = vec![ParamSpec::required("name")];
        if path_param {
            params.push(ParamSpec::optional("root", json!("~")).path());
        }
        CapabilitySpec {
            name: name.to_string(),
            description: String::new(),
            kind: CapabilityKind::System,
            params,
            destructive,
            always_confirm,
        }
    }

    fn gate(allowed: &[&str], roots: Vec<PathBuf>, confirm_destructive: bool) -> SafetyGate {
        SafetyGate::new(SafetyPolicy {
            allowed_capabilities: allowed.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            allowed_roots: roots,
            confirm_destructive,
        })
    }

    fn step_with(capability: &str, params: &[(&str, serde_json::Value)]) -> Step {
        let mut step = Step::new(capability, 0);
        for (k, v) in params {
            step.params.insert(k.to_string(), v.clone());
        }
        step
    }

    #[test]
    fn resolving_an_existing_file_keeps_the_exact_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doomed.log");
        std::fs::write(&file, b"x").unwrap();

        let resolved = resolve_path(&file);
        assert_eq!(resolved, file.canonicalize().unwrap());
        assert!(
            !resolved.to_string_lossy().ends_with(std::path::MAIN_SEPARATOR),
            "resolved path must not grow a trailing separator"
        );
        // The resolved form must be usable for file operations directly.
        std::fs::remove_file(&resolved).unwrap();
    }

    #[test]
    fn capability_outside_allow_set_is_denied_regardless_of_params() {
        let gate = gate(&["file-search"], vec![PathBuf::from("/tmp")], true);
        let step = step_with("process-list", &[]);
        let verdict = gate.evaluate(&step, &spec("process-list", false, false, false));
        assert_eq!(verdict.decision, Decision::Deny);
        assert!(matches!(verdict.reason, VerdictReason::CapabilityNotAllowed(_)));
    }

    #[test]
    fn path_inside_root_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&["file-search"], vec![dir.path().to_path_buf()], true);
        let step = step_with(
            "file-search",
            &[("name", json!("x")), ("root", json!(dir.path().join("sub").to_str().unwrap()))],
        );
        let verdict = gate.evaluate(&step, &spec("file-search", false, false, true));
        assert_eq!(verdict.decision, Decision::Allow);
    }

    #[test]
    fn parent_traversal_escaping_root_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let escape = format!("{}/sub/../../etc", dir.path().display());
        let gate = gate(&["file-search"], vec![dir.path().to_path_buf()], true);
        let step = step_with("file-search", &[("name", json!("x")), ("root", json!(escape))]);
        let verdict = gate.evaluate(&step, &spec("file-search", false, false, true));
        assert_eq!(verdict.decision, Decision::Deny);
        assert!(matches!(verdict.reason, VerdictReason::PathOutsideSandbox(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_denied() {
        let sandbox = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let link = sandbox.path().join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let gate = gate(&["file-search"], vec![sandbox.path().to_path_buf()], true);
        let step = step_with(
            "file-search",
            &[("name", json!("x")), ("root", json!(link.to_str().unwrap()))],
        );
        let verdict = gate.evaluate(&step, &spec("file-search", false, false, true));
        assert_eq!(verdict.decision, Decision::Deny);
    }

    #[test]
    fn destructive_step_needs_confirmation_when_policy_says_so() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&["file-delete"], vec![dir.path().to_path_buf()], true);
        let step = step_with(
            "file-delete",
            &[("name", json!("logs")), ("root", json!(dir.path().to_str().unwrap()))],
        );
        let verdict = gate.evaluate(&step, &spec("file-delete", true, false, true));
        assert_eq!(verdict.decision, Decision::NeedsConfirmation);
    }

    #[test]
    fn destructive_step_passes_when_confirmation_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate(&["file-delete"], vec![dir.path().to_path_buf()], false);
        let step = step_with(
            "file-delete",
            &[("name", json!("logs")), ("root", json!(dir.path().to_str().unwrap()))],
        );
        let verdict = gate.evaluate(&step, &spec("file-delete", true, false, true));
        assert_eq!(verdict.decision, Decision::Allow);
    }

    #[test]
    fn credential_submission_always_needs_confirmation() {
        let gate = gate(&["browser-login"], vec![], false);
        let step = step_with("browser-login", &[("name", json!("x"))]);
        let verdict = gate.evaluate(&step, &spec("browser-login", true, true, false));
        assert_eq!(verdict.decision, Decision::NeedsConfirmation);
    }

    #[test]
    fn low_confidence_step_needs_confirmation() {
        let gate = gate(&["file-search"], vec![], true);
        let mut step = step_with("file-search", &[("name", json!("x"))]);
        step.low_confidence = true;
        let verdict = gate.evaluate(&step, &spec("file-search", false, false, false));
        assert_eq!(verdict.decision, Decision::NeedsConfirmation);
        assert_eq!(verdict.reason, VerdictReason::LowConfidenceRequiresConfirmation);
    }
}

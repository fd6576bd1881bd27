//! Capability registry: maps a capability name to its executor and the
//! metadata the planner and safety gate need (parameter specs, destructive
//! classification). Dispatch is a tagged registry lookup, not an inheritance
//! hierarchy.

pub mod browser;
pub mod executor;
pub mod system;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::RegistryError;
pub use executor::{BoundInputs, CapabilityExecutor, ExecutionContext};

/// Which executor family serves a capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    System,
    Browser,
}

/// Declared parameter of a capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    pub default: Option<serde_json::Value>,
    /// Path-typed parameters are resolved against the sandbox roots by the
    /// safety gate before dispatch.
    pub is_path: bool,
}

impl ParamSpec {
    pub fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            default: None,
            is_path: false,
        }
    }

    pub fn optional(name: &str, default: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            default: Some(default),
            is_path: false,
        }
    }

    pub fn path(mut self) -> Self {
        self.is_path = true;
        self
    }
}

/// Static description of a capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    pub kind: CapabilityKind,
    pub params: Vec<ParamSpec>,
    /// Destructive capabilities (delete, overwrite, credential submission)
    /// route through the confirmation path when policy demands it.
    pub destructive: bool,
    /// Credential-submitting capabilities always require confirmation,
    /// independent of the destructive-confirmation policy flag.
    pub always_confirm: bool,
}

impl CapabilitySpec {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// One registry slot: spec plus executor handle.
#[derive(Clone)]
pub struct CapabilityEntry {
    pub spec: CapabilitySpec,
    pub executor: Arc<dyn CapabilityExecutor>,
}

/// Name → entry mapping. Leaf dependency for planner, gate, and orchestrator.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, CapabilityEntry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: CapabilitySpec, executor: Arc<dyn CapabilityExecutor>) {
        self.entries
            .insert(spec.name.clone(), CapabilityEntry { spec, executor });
    }

    pub fn resolve(&self, name: &str) -> Result<&CapabilityEntry, RegistryError> {
        self.entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Specs of every registered capability, name-sorted for determinism.
    pub fn specs(&self) -> Vec<&CapabilitySpec> {
        let mut specs: Vec<&CapabilitySpec> = self.entries.values().map(|e| &e.spec).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Registry with the built-in system and browser capabilities wired to
    /// the given executors.
    pub fn with_builtins(
        system: Arc<dyn CapabilityExecutor>,
        browser: Arc<dyn CapabilityExecutor>,
    ) -> Self {
        use serde_json::json;
        let mut registry = Self::new();

        let system_caps = vec![
            CapabilitySpec {
                name: "file-search".into(),
                description: "Search for files by name fragment under a root directory".into(),
                kind: CapabilityKind::System,
                params: vec![
                    ParamSpec::required("name"),
                    ParamSpec::optional("root", json!("~")).path(),
                ],
                destructive: false,
                always_confirm: false,
            },
            CapabilitySpec {
                name: "dir-list".into(),
                description: "List the entries of a directory".into(),
                kind: CapabilityKind::System,
                params: vec![ParamSpec::optional("path", json!(".")).path()],
                destructive: false,
                always_confirm: false,
            },
            CapabilitySpec {
                name: "process-list".into(),
                description: "List running processes".into(),
                kind: CapabilityKind::System,
                params: vec![],
                destructive: false,
                always_confirm: false,
            },
            CapabilitySpec {
                name: "disk-usage".into(),
                description: "Report filesystem disk usage".into(),
                kind: CapabilityKind::System,
                params: vec![],
                destructive: false,
                always_confirm: false,
            },
            CapabilitySpec {
                name: "git-status".into(),
                description: "Read-only git working tree status".into(),
                kind: CapabilityKind::System,
                params: vec![ParamSpec::optional("path", json!(".")).path()],
                destructive: false,
                always_confirm: false,
            },
            CapabilitySpec {
                name: "git-log".into(),
                description: "Recent git history of a repository".into(),
                kind: CapabilityKind::System,
                params: vec![
                    ParamSpec::optional("path", json!(".")).path(),
                    ParamSpec::optional("limit", json!(20)),
                ],
                destructive: false,
                always_confirm: false,
            },
            CapabilitySpec {
                name: "file-delete".into(),
                description: "Delete files matching a name fragment under a root directory".into(),
                kind: CapabilityKind::System,
                params: vec![
                    ParamSpec::required("name"),
                    ParamSpec::optional("root", json!("~")).path(),
                ],
                destructive: true,
                always_confirm: false,
            },
        ];

        let browser_caps = vec![
            CapabilitySpec {
                name: "browser-navigate".into(),
                description: "Navigate the run's browser session to a URL".into(),
                kind: CapabilityKind::Browser,
                params: vec![ParamSpec::required("url")],
                destructive: false,
                always_confirm: false,
            },
            CapabilitySpec {
                name: "browser-click".into(),
                description: "Click the element matching a CSS selector".into(),
                kind: CapabilityKind::Browser,
                params: vec![ParamSpec::required("selector")],
                destructive: false,
                always_confirm: false,
            },
            CapabilitySpec {
                name: "browser-login".into(),
                description: "Submit credentials (resolved from an opaque handle) to a login form"
                    .into(),
                kind: CapabilityKind::Browser,
                params: vec![
                    ParamSpec::required("url"),
                    ParamSpec::required("credential_handle"),
                    ParamSpec::optional("username_selector", json!("input[type=email]")),
                    ParamSpec::optional("password_selector", json!("input[type=password]")),
                    ParamSpec::optional("submit_selector", json!("button[type=submit]")),
                ],
                destructive: true,
                always_confirm: true,
            },
        ];

        for spec in system_caps {
            registry.register(spec, system.clone());
        }
        for spec in browser_caps {
            registry.register(spec, browser.clone());
        }
        registry
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecutionFailure;
    use crate::types::{Step, StepOutput};
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl CapabilityExecutor for NoopExecutor {
        async fn execute(
            &self,
            _step: &Step,
            _inputs: &BoundInputs,
            _cx: &ExecutionContext,
        ) -> Result<StepOutput, ExecutionFailure> {
            Ok(StepOutput::Text("ok".into()))
        }
    }

    #[test]
    fn resolve_unknown_capability_fails() {
        let registry = CapabilityRegistry::new();
        let err = registry.resolve("no-such-capability").err().unwrap();
        assert_eq!(
            err,
            crate::errors::RegistryError::UnknownCapability("no-such-capability".into())
        );
    }

    #[test]
    fn builtins_cover_both_executor_families() {
        let registry =
            CapabilityRegistry::with_builtins(Arc::new(NoopExecutor), Arc::new(NoopExecutor));
        assert!(registry.contains("file-search"));
        assert!(registry.contains("browser-navigate"));
        let login = registry.resolve("browser-login").unwrap();
        assert!(login.spec.destructive);
        assert!(login.spec.always_confirm);
        let delete = registry.resolve("file-delete").unwrap();
        assert!(delete.spec.destructive);
        assert!(!delete.spec.always_confirm);
    }

    #[test]
    fn specs_are_name_sorted() {
        let registry =
            CapabilityRegistry::with_builtins(Arc::new(NoopExecutor), Arc::new(NoopExecutor));
        let names: Vec<&str> = registry.specs().iter().map(|s| s.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}

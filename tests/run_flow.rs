//! End-to-end runs through the public API: real system executor, real
//! learning store, a scripted NLU provider, and a tempdir sandbox.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use adjutant::capabilities::system::SystemExecutor;
use adjutant::capabilities::CapabilityRegistry;
use adjutant::config::AssistantConfig;
use adjutant::errors::{ParseFailure, RunError};
use adjutant::learning::LearningStore;
use adjutant::nlu::{NluProvider, NluRequest, NluResponse, ProviderInfo, CONTRACT_VERSION};
use adjutant::orchestrator::{ConfirmationHandler, ConfirmationRequest, DenyAll, Orchestrator};
use adjutant::types::{Intent, RunStatus, StepOutput, StepStatus};
use adjutant::Instruction;

/// Provider that replays a fixed script of intents.
struct Scripted(Vec<Intent>);

#[async_trait]
impl NluProvider for Scripted {
    async fn parse(&self, request: &NluRequest) -> Result<NluResponse, ParseFailure> {
        if self.0.is_empty() {
            return Err(ParseFailure::Ambiguous("nothing scripted".into()));
        }
        let intents = self
            .0
            .iter()
            .cloned()
            .map(|mut i| {
                i.instruction_id = request.instruction.id.clone();
                i
            })
            .collect();
        Ok(NluResponse {
            version: CONTRACT_VERSION,
            intents,
        })
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "scripted".into(),
            model: "none".into(),
        }
    }
}

struct ApproveAll;

#[async_trait]
impl ConfirmationHandler for ApproveAll {
    async fn deliver(&self, request: ConfirmationRequest) {
        request.approve();
    }
}

fn sandboxed_config(root: &Path, store: Option<&Path>) -> AssistantConfig {
    let mut config = AssistantConfig::default();
    config.safety.allowed_roots = vec![root.to_path_buf()];
    config
        .safety
        .allowed_capabilities
        .insert("file-delete".to_string());
    config.safety.confirmation_timeout_seconds = 1;
    match store {
        Some(path) => config.learning.store_path = path.to_path_buf(),
        None => config.learning.enabled = false,
    }
    config
}

fn build(
    config: AssistantConfig,
    intents: Vec<Intent>,
    confirmations: Arc<dyn ConfirmationHandler>,
) -> Orchestrator {
    let system = Arc::new(SystemExecutor::new());
    // No browser steps in these scenarios; both slots get the system executor.
    let registry = Arc::new(CapabilityRegistry::with_builtins(system.clone(), system));
    let learning = Arc::new(LearningStore::open(
        config.learning.store_path.clone(),
        config.learning.enabled,
    ));
    Orchestrator::new(config, registry, Arc::new(Scripted(intents)), learning, confirmations)
}

#[tokio::test]
async fn file_search_finds_seeded_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/report.pdf"), b"x").unwrap();

    let intents = vec![Intent::new("file-search", "")
        .with_param("name", json!("report"))
        .with_param("root", json!(dir.path().to_str().unwrap()))];
    let orchestrator = build(sandboxed_config(dir.path(), None), intents, Arc::new(DenyAll));

    let outcome = orchestrator
        .run(Instruction::new("find the report"), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    let entry = &outcome.trace.entries[0];
    assert_eq!(entry.step.status, StepStatus::Succeeded);
    let output = entry.result.as_ref().unwrap().output.as_ref().unwrap();
    match output {
        StepOutput::Files(files) => {
            assert_eq!(files.len(), 1);
            assert!(files[0].ends_with("sub/report.pdf"));
        }
        other => panic!("expected file listing, got {:?}", other),
    }
}

#[tokio::test]
async fn denied_delete_leaves_target_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("old.log");
    std::fs::write(&target, b"x").unwrap();

    let intents = vec![
        Intent::new("file-search", "")
            .with_param("name", json!("old.log"))
            .with_param("root", json!(dir.path().to_str().unwrap())),
        Intent::new("file-delete", "")
            .with_param("name", json!("it"))
            .with_param("root", json!(dir.path().to_str().unwrap())),
    ];
    let orchestrator = build(sandboxed_config(dir.path(), None), intents, Arc::new(DenyAll));

    let outcome = orchestrator
        .run(
            Instruction::new("find old.log and delete it"),
            CancellationToken::new(),
        )
        .await;

    // Denial skips the delete; the search still counts as a success.
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.trace.entries[0].step.status, StepStatus::Succeeded);
    assert_eq!(outcome.trace.entries[1].step.status, StepStatus::Skipped);
    assert!(target.exists());
}

#[tokio::test]
async fn approved_delete_removes_found_file() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("old.log");
    std::fs::write(&target, b"x").unwrap();
    let bystander = dir.path().join("keep.txt");
    std::fs::write(&bystander, b"x").unwrap();

    let intents = vec![
        Intent::new("file-search", "")
            .with_param("name", json!("old.log"))
            .with_param("root", json!(dir.path().to_str().unwrap())),
        Intent::new("file-delete", "")
            .with_param("name", json!("it"))
            .with_param("root", json!(dir.path().to_str().unwrap())),
    ];
    let orchestrator = build(
        sandboxed_config(dir.path(), None),
        intents,
        Arc::new(ApproveAll),
    );

    let outcome = orchestrator
        .run(
            Instruction::new("find old.log and delete it"),
            CancellationToken::new(),
        )
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.trace.entries[1].step.status, StepStatus::Succeeded);
    assert!(!target.exists());
    assert!(bystander.exists());
}

#[tokio::test]
async fn sandbox_escape_is_denied_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let escape = format!("{}/../outside", dir.path().display());

    let intents = vec![Intent::new("file-search", "")
        .with_param("name", json!("anything"))
        .with_param("root", json!(escape))];
    let orchestrator = build(sandboxed_config(dir.path(), None), intents, Arc::new(DenyAll));

    let outcome = orchestrator
        .run(Instruction::new("search outside"), CancellationToken::new())
        .await;

    // The denial fails the step; the run still completes with a mixed trace.
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(outcome.error.is_none());
    let entry = &outcome.trace.entries[0];
    assert_eq!(entry.step.status, StepStatus::Failed);
    assert!(entry.result.as_ref().unwrap().error.as_deref().unwrap().contains("denied"));
}

#[tokio::test]
async fn parse_failure_leaves_learning_store_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("learning.json");

    let orchestrator = build(
        sandboxed_config(dir.path(), Some(&store_path)),
        vec![],
        Arc::new(DenyAll),
    );

    let outcome = orchestrator
        .run(Instruction::new("???"), CancellationToken::new())
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.trace.entries.is_empty());
    assert!(matches!(outcome.error, Some(RunError::Parse(_))));
    assert!(!store_path.exists());
}

#[tokio::test]
async fn successful_run_persists_learning_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("learning.json");
    std::fs::write(dir.path().join("report.pdf"), b"x").unwrap();

    let intents = vec![Intent::new("file-search", "")
        .with_param("name", json!("report"))
        .with_param("root", json!(dir.path().to_str().unwrap()))];
    let orchestrator = build(
        sandboxed_config(dir.path(), Some(&store_path)),
        intents,
        Arc::new(DenyAll),
    );

    let outcome = orchestrator
        .run(Instruction::new("find the report"), CancellationToken::new())
        .await;
    assert_eq!(outcome.status, RunStatus::Completed);

    // Flushed at run end; a fresh store sees the attempt.
    let reloaded = LearningStore::open(store_path, true);
    let snapshot = reloaded.snapshot();
    let record = snapshot.get("file-search:name,root").unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.successes, 1);
}

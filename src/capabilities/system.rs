//! System executor: local, read-only system queries plus the guarded
//! file-delete capability.
//!
//! Directory walks run on the blocking pool and poll the cancellation token;
//! external queries (`ps`, `df`, `git`) are spawned with `kill_on_drop` so a
//! timeout or abort never leaves an orphaned child. Every operation respects
//! the per-step wall-clock budget from the execution context.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::executor::{BoundInputs, CapabilityExecutor, ExecutionContext};
use crate::errors::ExecutionFailure;
use crate::safety::resolve_path;
use crate::types::{Step, StepOutput};

/// Caps so a runaway search cannot pin the blocking pool.
const MAX_VISITED_ENTRIES: usize = 100_000;
const MAX_RESULTS: usize = 256;

#[derive(Debug, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }

    async fn file_search(&self, step: &Step, cx: &ExecutionContext) -> Result<StepOutput, ExecutionFailure> {
        let name = required_str(step, "name")?.to_lowercase();
        let root = resolve_path(Path::new(required_str(step, "root")?));
        let matches = walk_for_matches(root, name, cx.cancellation.clone()).await?;
        Ok(StepOutput::Files(matches))
    }

    async fn dir_list(&self, step: &Step) -> Result<StepOutput, ExecutionFailure> {
        let path = resolve_path(Path::new(required_str(step, "path")?));
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ExecutionFailure::Internal(format!("read_dir {}: {}", path.display(), e)))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ExecutionFailure::Internal(e.to_string()))?
        {
            entries.push(entry.path());
        }
        entries.sort();
        Ok(StepOutput::Files(entries))
    }

    async fn process_list(&self, cx: &ExecutionContext) -> Result<StepOutput, ExecutionFailure> {
        let mut cmd = Command::new("ps");
        cmd.args(["-eo", "pid,comm,pcpu,pmem"]);
        run_command(cmd, cx).await.map(StepOutput::Text)
    }

    async fn disk_usage(&self, cx: &ExecutionContext) -> Result<StepOutput, ExecutionFailure> {
        let mut cmd = Command::new("df");
        cmd.arg("-h");
        run_command(cmd, cx).await.map(StepOutput::Text)
    }

    async fn git_status(&self, step: &Step, cx: &ExecutionContext) -> Result<StepOutput, ExecutionFailure> {
        let path = resolve_path(Path::new(required_str(step, "path")?));
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&path).args(["status", "--porcelain"]);
        let out = run_command(cmd, cx).await?;
        if out.trim().is_empty() {
            Ok(StepOutput::Text("clean".to_string()))
        } else {
            Ok(StepOutput::Text(out))
        }
    }

    async fn git_log(&self, step: &Step, cx: &ExecutionContext) -> Result<StepOutput, ExecutionFailure> {
        let path = resolve_path(Path::new(required_str(step, "path")?));
        let limit = step
            .params
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(20);
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&path)
            .args(["log", "--oneline", "-n", &limit.to_string()]);
        run_command(cmd, cx).await.map(StepOutput::Text)
    }

    /// Delete files. With a bound input (a prior search's file list) the
    /// exact listed paths are removed, re-checked against the step's root;
    /// otherwise the executor searches for the name fragment first.
    async fn file_delete(
        &self,
        step: &Step,
        inputs: &BoundInputs,
        cx: &ExecutionContext,
    ) -> Result<StepOutput, ExecutionFailure> {
        let root = resolve_path(Path::new(required_str(step, "root")?));

        let targets: Vec<PathBuf> = match inputs.sole() {
            Some(StepOutput::Files(files)) => files
                .iter()
                .map(|p| resolve_path(p))
                .filter(|p| p.starts_with(&root))
                .collect(),
            _ => {
                let name = required_str(step, "name")?.to_lowercase();
                walk_for_matches(root.clone(), name, cx.cancellation.clone()).await?
            }
        };

        let mut deleted = Vec::with_capacity(targets.len());
        for target in targets {
            if cx.is_cancelled() {
                return Err(ExecutionFailure::Cancelled);
            }
            tokio::fs::remove_file(&target)
                .await
                .map_err(|e| ExecutionFailure::Internal(format!("delete {}: {}", target.display(), e)))?;
            debug!(path = %target.display(), "deleted file");
            deleted.push(target);
        }
        Ok(StepOutput::Files(deleted))
    }
}

#[async_trait]
impl CapabilityExecutor for SystemExecutor {
    #[instrument(skip_all, fields(capability = %step.capability, step = %step.id))]
    async fn execute(
        &self,
        step: &Step,
        inputs: &BoundInputs,
        cx: &ExecutionContext,
    ) -> Result<StepOutput, ExecutionFailure> {
        let work = async {
            match step.capability.as_str() {
                "file-search" => self.file_search(step, cx).await,
                "dir-list" => self.dir_list(step).await,
                "process-list" => self.process_list(cx).await,
                "disk-usage" => self.disk_usage(cx).await,
                "git-status" => self.git_status(step, cx).await,
                "git-log" => self.git_log(step, cx).await,
                "file-delete" => self.file_delete(step, inputs, cx).await,
                other => Err(ExecutionFailure::Internal(format!(
                    "system executor cannot serve capability '{}'",
                    other
                ))),
            }
        };

        tokio::select! {
            _ = cx.cancellation.cancelled() => Err(ExecutionFailure::Cancelled),
            result = tokio::time::timeout(cx.timeout, work) => {
                result.map_err(|_| ExecutionFailure::Timeout)?
            }
        }
    }
}

fn required_str<'a>(step: &'a Step, key: &str) -> Result<&'a str, ExecutionFailure> {
    step.param_str(key)
        .ok_or_else(|| ExecutionFailure::Internal(format!("parameter '{}' missing or not a string", key)))
}

/// Iterative breadth-first walk matching file names case-insensitively
/// against a fragment. Runs on the blocking pool; the token is polled per
/// directory so cancellation lands promptly.
async fn walk_for_matches(
    root: PathBuf,
    fragment: String,
    token: CancellationToken,
) -> Result<Vec<PathBuf>, ExecutionFailure> {
    tokio::task::spawn_blocking(move || {
        let mut matches = Vec::new();
        let mut queue = std::collections::VecDeque::from([root]);
        let mut visited = 0usize;

        while let Some(dir) = queue.pop_front() {
            if token.is_cancelled() {
                return Err(ExecutionFailure::Cancelled);
            }
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue; // unreadable directories are skipped, not fatal
            };
            for entry in entries.flatten() {
                visited += 1;
                if visited > MAX_VISITED_ENTRIES || matches.len() >= MAX_RESULTS {
                    return Ok(matches);
                }
                let path = entry.path();
                let file_type = match entry.file_type() {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    queue.push_back(path);
                } else if entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains(&fragment)
                {
                    matches.push(path);
                }
            }
        }
        matches.sort();
        Ok(matches)
    })
    .await
    .map_err(|e| ExecutionFailure::Internal(format!("walk task: {}", e)))?
}

/// Spawn a subprocess with `kill_on_drop` and collect stdout. Cancellation
/// drops the future, which kills the child.
async fn run_command(mut cmd: Command, cx: &ExecutionContext) -> Result<String, ExecutionFailure> {
    cmd.kill_on_drop(true);
    let output = tokio::select! {
        _ = cx.cancellation.cancelled() => return Err(ExecutionFailure::Cancelled),
        out = cmd.output() => out,
    };
    let output = output.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            ExecutionFailure::ResourceUnavailable(format!("command not found: {}", e))
        }
        _ => ExecutionFailure::Internal(e.to_string()),
    })?;
    if !output.status.success() {
        return Err(ExecutionFailure::Internal(format!(
            "command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn cx() -> ExecutionContext {
        ExecutionContext::new("run-1", CancellationToken::new(), Duration::from_secs(10))
    }

    fn step(capability: &str, params: &[(&str, serde_json::Value)]) -> Step {
        let mut step = Step::new(capability, 0);
        for (k, v) in params {
            step.params.insert(k.to_string(), v.clone());
        }
        step
    }

    #[tokio::test]
    async fn file_search_finds_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("report.pdf"), b"x").unwrap();
        std::fs::write(dir.path().join("other.txt"), b"x").unwrap();

        let executor = SystemExecutor::new();
        let step = step(
            "file-search",
            &[("name", json!("report.pdf")), ("root", json!(dir.path().to_str().unwrap()))],
        );
        let out = executor
            .execute(&step, &BoundInputs::new(), &cx())
            .await
            .unwrap();
        match out {
            StepOutput::Files(files) => {
                assert_eq!(files.len(), 1);
                assert!(files[0].ends_with("report.pdf"));
            }
            other => panic!("expected file list, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn file_search_returns_empty_list_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SystemExecutor::new();
        let step = step(
            "file-search",
            &[("name", json!("missing.doc")), ("root", json!(dir.path().to_str().unwrap()))],
        );
        let out = executor
            .execute(&step, &BoundInputs::new(), &cx())
            .await
            .unwrap();
        assert_eq!(out, StepOutput::Files(vec![]));
    }

    #[tokio::test]
    async fn dir_list_reports_entries_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let executor = SystemExecutor::new();
        let step = step("dir-list", &[("path", json!(dir.path().to_str().unwrap()))]);
        let out = executor
            .execute(&step, &BoundInputs::new(), &cx())
            .await
            .unwrap();
        match out {
            StepOutput::Files(files) => {
                assert_eq!(files.len(), 2);
                assert!(files[0].ends_with("a.txt"));
            }
            other => panic!("expected file list, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn file_delete_removes_bound_targets_only_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let inside = dir.path().join("doomed.log");
        std::fs::write(&inside, b"x").unwrap();
        let outside_dir = tempfile::tempdir().unwrap();
        let outside = outside_dir.path().join("innocent.log");
        std::fs::write(&outside, b"x").unwrap();

        let executor = SystemExecutor::new();
        let step = step(
            "file-delete",
            &[("name", json!("it")), ("root", json!(dir.path().to_str().unwrap()))],
        );
        let mut inputs = BoundInputs::new();
        inputs.bind(
            "s0",
            StepOutput::Files(vec![inside.clone(), outside.clone()]),
        );

        let out = executor.execute(&step, &inputs, &cx()).await.unwrap();
        match out {
            StepOutput::Files(deleted) => assert_eq!(deleted.len(), 1),
            other => panic!("expected file list, got {:?}", other),
        }
        assert!(!inside.exists());
        assert!(outside.exists(), "path outside root must be untouched");
    }

    #[tokio::test]
    async fn cancelled_token_aborts_execution() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let cx = ExecutionContext::new("run-1", token, Duration::from_secs(10));

        let executor = SystemExecutor::new();
        let step = step(
            "file-search",
            &[("name", json!("x")), ("root", json!(dir.path().to_str().unwrap()))],
        );
        let err = executor
            .execute(&step, &BoundInputs::new(), &cx)
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionFailure::Cancelled);
    }

    #[tokio::test]
    async fn unknown_capability_is_internal_error() {
        let executor = SystemExecutor::new();
        let step = step("teleport", &[]);
        let err = executor
            .execute(&step, &BoundInputs::new(), &cx())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionFailure::Internal(_)));
    }
}

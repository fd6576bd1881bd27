//! Learning store: durable success statistics per capability pattern.
//!
//! Process-wide shared state with an explicit lifecycle: opened at
//! orchestrator construction, flushed after each run, kept until shutdown.
//! Reads are snapshots (possibly stale, which is fine: learning only biases
//! confidence, never correctness). Writes are buffered as per-key deltas and
//! folded into the file with read-merge-write, so concurrent processes never
//! lose each other's updates to unrelated keys. Records are never deleted.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::planner::LearningSnapshot;
use crate::types::LearningRecord;

#[derive(Debug, Default, Clone)]
struct PendingDelta {
    attempts: u64,
    successes: u64,
}

/// Durable (capability, pattern) → {attempts, successes, last_used} mapping.
#[derive(Debug)]
pub struct LearningStore {
    /// None when learning is disabled; every operation becomes a no-op.
    path: Option<PathBuf>,
    /// Local view: file contents at load time plus local deltas.
    records: DashMap<String, LearningRecord>,
    /// Deltas not yet folded into the file.
    deltas: DashMap<String, PendingDelta>,
    /// Serializes read-merge-write cycles against the file.
    flush_lock: Mutex<()>,
}

impl LearningStore {
    /// Open the store, loading existing statistics. A corrupt file is
    /// treated as empty rather than fatal (statistics are advisory).
    pub fn open(path: PathBuf, enabled: bool) -> Self {
        let store = Self {
            path: enabled.then_some(path),
            records: DashMap::new(),
            deltas: DashMap::new(),
            flush_lock: Mutex::new(()),
        };
        if let Some(path) = &store.path {
            match Self::read_file(path) {
                Ok(loaded) => {
                    for (key, record) in loaded {
                        store.records.insert(key, record);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "learning store unreadable, starting fresh"),
            }
        }
        store
    }

    /// Disabled store: never reads or writes anything.
    pub fn disabled() -> Self {
        Self {
            path: None,
            records: DashMap::new(),
            deltas: DashMap::new(),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Point-in-time copy for the planner. Taken once per run at PLANNED
    /// time; staleness against concurrent runs is acceptable.
    pub fn snapshot(&self) -> LearningSnapshot {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Record one executed attempt for a pattern. Buffered; becomes durable
    /// on the next `flush`.
    pub fn record(&self, pattern: &str, success: bool) {
        if self.path.is_none() {
            return;
        }
        let now = Utc::now();
        {
            let mut delta = self.deltas.entry(pattern.to_string()).or_default();
            delta.attempts += 1;
            if success {
                delta.successes += 1;
            }
        }
        let mut record = self.records.entry(pattern.to_string()).or_default();
        record.attempts += 1;
        if success {
            record.successes += 1;
        }
        record.last_used = Some(now);
    }

    /// Fold buffered deltas into the file: reload, merge, write atomically.
    /// Unrelated keys written by other processes survive untouched.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.deltas.is_empty() {
            return Ok(());
        }
        let _guard = self
            .flush_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut merged = Self::read_file(path).unwrap_or_default();
        let now = Utc::now();
        let keys: Vec<String> = self.deltas.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some((_, delta)) = self.deltas.remove(&key) else {
                continue;
            };
            let record = merged.entry(key.clone()).or_default();
            record.attempts += delta.attempts;
            record.successes += delta.successes;
            record.last_used = Some(now);
            // Refresh the local view with the merged truth.
            self.records.insert(key, record.clone());
        }

        let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, &merged)?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        debug!(path = %path.display(), keys = merged.len(), "learning store flushed");
        Ok(())
    }

    fn read_file(path: &PathBuf) -> Result<HashMap<String, LearningRecord>, StoreError> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_accumulate_across_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");

        let store = LearningStore::open(path.clone(), true);
        for _ in 0..3 {
            store.record("file-search:name,root", true);
        }
        store.flush().unwrap();

        // Reopen to prove durability.
        let reopened = LearningStore::open(path, true);
        let snapshot = reopened.snapshot();
        let record = &snapshot["file-search:name,root"];
        assert_eq!(record.attempts, 3);
        assert_eq!(record.successes, 3);
        assert!(record.last_used.is_some());
    }

    #[test]
    fn successes_never_exceed_attempts() {
        let store = LearningStore::open(
            tempfile::tempdir().unwrap().path().join("l.json"),
            true,
        );
        store.record("p", true);
        store.record("p", false);
        store.record("p", true);
        let snapshot = store.snapshot();
        let record = &snapshot["p"];
        assert_eq!(record.attempts, 3);
        assert_eq!(record.successes, 2);
        assert!(record.successes <= record.attempts);
    }

    #[test]
    fn unrelated_keys_from_other_writers_survive_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");

        let store = LearningStore::open(path.clone(), true);
        store.record("mine", true);

        // Another process writes a different key between our load and flush.
        let mut other = HashMap::new();
        other.insert(
            "theirs".to_string(),
            LearningRecord {
                attempts: 7,
                successes: 7,
                last_used: None,
            },
        );
        std::fs::write(&path, serde_json::to_string(&other).unwrap()).unwrap();

        store.flush().unwrap();

        let on_disk = LearningStore::open(path, true).snapshot();
        assert_eq!(on_disk["theirs"].attempts, 7);
        assert_eq!(on_disk["mine"].attempts, 1);
    }

    #[test]
    fn disabled_store_is_inert() {
        let store = LearningStore::disabled();
        store.record("p", true);
        assert!(store.snapshot().is_empty());
        store.flush().unwrap();
        assert!(!store.is_enabled());
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = LearningStore::open(path, true);
        assert!(store.snapshot().is_empty());
    }
}

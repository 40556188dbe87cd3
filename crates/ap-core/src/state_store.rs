//! Crash-consistent persistence of a run's `AgentState` + `TodoList`.
//!
//! One live snapshot lives at `<dir>/state.json`. Every write goes to
//! `state.json.tmp` first, is fsynced, then renamed over the live file, so a
//! reader never observes a half-written snapshot.
//!
//! ## Compatibility
//!
//! A snapshot carries a SHA-256 of the originating intent. Resuming with a
//! different intent (or a list whose item IDs differ) is rejected with
//! [`StateStoreError::Incompatible`]; the caller must start fresh. Fields are
//! only ever added (`#[serde(default)]`), so older snapshots stay readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::{AgentState, TodoList, TodoStatus};

/// Bumped only on breaking layout changes; additive fields keep the version.
pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_FILE: &str = "state.json";
const ARCHIVE_DIR: &str = "archive";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Hex SHA-256 of the originating intent text.
    pub intent_hash: String,
    pub saved_at: DateTime<Utc>,
    pub agent_state: AgentState,
    pub todo_list: TodoList,
}

impl Snapshot {
    pub fn new(agent_state: &AgentState, todo_list: &TodoList) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            intent_hash: intent_hash(&todo_list.user_intent),
            saved_at: Utc::now(),
            agent_state: agent_state.clone(),
            todo_list: todo_list.clone(),
        }
    }
}

/// Hex-encoded SHA-256 of an intent string.
pub fn intent_hash(intent: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, intent.as_bytes());
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("no snapshot at {0}")]
    NotFound(PathBuf),
    #[error("incompatible snapshot: {0}")]
    Incompatible(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// File-system-backed snapshot persistence for a single run.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path().exists()
    }

    /// Atomically persist the run state.
    pub fn snapshot(&self, agent_state: &AgentState, todo_list: &TodoList) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let snapshot = Snapshot::new(agent_state, todo_list);
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let path = self.snapshot_path();
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        debug!(
            path = %path.display(),
            completed = todo_list.counts.completed,
            total = todo_list.total_todos,
            "snapshot written"
        );
        Ok(())
    }

    /// Read the live snapshot exactly as written.
    pub fn load(&self) -> Result<Snapshot> {
        let path = self.snapshot_path();
        let data = match std::fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateStoreError::NotFound(path));
            }
            Err(e) => return Err(e.into()),
        };
        let mut snapshot: Snapshot = serde_json::from_slice(&data)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(StateStoreError::Incompatible(format!(
                "snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        snapshot.todo_list.recount();
        Ok(snapshot)
    }

    /// Verify that `snapshot` belongs to `intent` and, when given, to exactly
    /// the item IDs in `expected_ids`.
    pub fn ensure_compatible(
        snapshot: &Snapshot,
        intent: &str,
        expected_ids: Option<&[String]>,
    ) -> Result<()> {
        if snapshot.intent_hash != intent_hash(intent) {
            return Err(StateStoreError::Incompatible(
                "intent does not match the snapshot being resumed".to_string(),
            ));
        }
        if snapshot.intent_hash != intent_hash(&snapshot.todo_list.user_intent) {
            return Err(StateStoreError::Incompatible(
                "snapshot todo list was produced for a different intent".to_string(),
            ));
        }
        if let Some(expected) = expected_ids {
            let want: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
            let have: BTreeSet<&str> = snapshot.todo_list.ids().collect();
            if want != have {
                let missing: Vec<&str> = want.difference(&have).copied().collect();
                let extra: Vec<&str> = have.difference(&want).copied().collect();
                return Err(StateStoreError::Incompatible(format!(
                    "item set differs (missing: [{}], unexpected: [{}])",
                    missing.join(", "),
                    extra.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Load, verify against `intent`, and reset crashed in-flight items.
    ///
    /// Items that were `InProgress` when the snapshot was taken go back to
    /// `Pending` with their attempt count preserved.
    pub fn resume(&self, intent: &str, expected_ids: Option<&[String]>) -> Result<Snapshot> {
        let mut snapshot = self.load()?;
        Self::ensure_compatible(&snapshot, intent, expected_ids)?;

        let in_flight: Vec<String> = snapshot
            .todo_list
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::InProgress)
            .map(|t| t.id.clone())
            .collect();
        for id in &in_flight {
            // Only InProgress ids were collected, so requeue cannot reject them.
            if let Err(e) = snapshot.todo_list.requeue(id) {
                return Err(StateStoreError::Incompatible(e.to_string()));
            }
        }
        snapshot.agent_state.set_current_todo(None);
        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "reset interrupted items to pending");
        }
        Ok(snapshot)
    }

    /// Move the live snapshot into `<dir>/archive/`. Returns the archive path,
    /// or `None` when there was nothing to archive.
    pub fn archive(&self) -> Result<Option<PathBuf>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let snapshot = self.load()?;
        let archive_dir = self.dir.join(ARCHIVE_DIR);
        std::fs::create_dir_all(&archive_dir)?;
        let target = archive_dir.join(format!(
            "{}-{}.json",
            snapshot.todo_list.id,
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        std::fs::rename(&path, &target)?;
        info!(path = %target.display(), "snapshot archived");
        Ok(Some(target))
    }

    /// Delete the live snapshot. Returns `true` if a file was removed.
    pub fn discard(&self) -> Result<bool> {
        let path = self.snapshot_path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionResult, Todo, TodoKind};

    fn temp_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = StateStore::new(dir.path().join("state"));
        (store, dir)
    }

    fn sample_list() -> TodoList {
        TodoList::new(
            "add a health endpoint",
            vec![
                Todo::new("inspect router", TodoKind::Analysis).with_id("a"),
                Todo::new("add route", TodoKind::CodeChange)
                    .with_id("b")
                    .with_dependencies(["a"]),
            ],
        )
    }

    #[test]
    fn intent_hash_is_stable_hex() {
        let h = intent_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn snapshot_and_load_roundtrip() {
        let (store, _dir) = temp_store();
        let mut list = sample_list();
        list.start("a").unwrap();
        list.complete("a", &ExecutionResult::success("ok")).unwrap();
        store.snapshot(&AgentState::new(), &list).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert_eq!(loaded.todo_list.status_of("a"), Some(TodoStatus::Completed));
        assert_eq!(loaded.todo_list.counts.completed, 1);
        assert!(!store.snapshot_path().with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_is_not_found() {
        let (store, _dir) = temp_store();
        assert!(matches!(store.load(), Err(StateStoreError::NotFound(_))));
    }

    #[test]
    fn resume_resets_in_progress_and_keeps_attempt() {
        let (store, _dir) = temp_store();
        let mut list = sample_list();
        list.start("a").unwrap();
        store.snapshot(&AgentState::new(), &list).unwrap();

        let snap = store.resume("add a health endpoint", None).unwrap();
        let a = snap.todo_list.get("a").unwrap();
        assert_eq!(a.status, TodoStatus::Pending);
        assert_eq!(a.attempt, 1);
        assert_eq!(snap.todo_list.counts.in_progress, 0);
    }

    #[test]
    fn resume_with_other_intent_is_incompatible() {
        let (store, _dir) = temp_store();
        store.snapshot(&AgentState::new(), &sample_list()).unwrap();
        let err = store.resume("something else", None).unwrap_err();
        assert!(matches!(err, StateStoreError::Incompatible(_)));
    }

    #[test]
    fn resume_with_other_item_set_is_incompatible() {
        let (store, _dir) = temp_store();
        store.snapshot(&AgentState::new(), &sample_list()).unwrap();
        let ids = vec!["a".to_string(), "c".to_string()];
        let err = store
            .resume("add a health endpoint", Some(&ids))
            .unwrap_err();
        assert!(err.to_string().contains("missing: [c]"));
    }

    #[test]
    fn newer_version_is_incompatible() {
        let (store, _dir) = temp_store();
        store.snapshot(&AgentState::new(), &sample_list()).unwrap();
        let path = store.snapshot_path();
        let mut value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        value["version"] = serde_json::json!(SNAPSHOT_VERSION + 1);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        assert!(matches!(store.load(), Err(StateStoreError::Incompatible(_))));
    }

    #[test]
    fn archive_moves_snapshot() {
        let (store, _dir) = temp_store();
        let list = sample_list();
        store.snapshot(&AgentState::new(), &list).unwrap();
        let archived = store.archive().unwrap().unwrap();
        assert!(archived.exists());
        assert!(archived
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&list.id));
        assert!(!store.exists());
        assert!(store.archive().unwrap().is_none());
    }

    #[test]
    fn discard_removes_snapshot() {
        let (store, _dir) = temp_store();
        store.snapshot(&AgentState::new(), &sample_list()).unwrap();
        assert!(store.discard().unwrap());
        assert!(!store.discard().unwrap());
    }
}

//! Task Ledger
//!
//! The durable record of task state and the single source of truth consulted
//! by the router, the hook pipeline, and the stop decision engine.
//!
//! Tasks live in an arena keyed by task id. Every task carries a version;
//! writes are optimistic compare-and-swap on that version, so concurrent step
//! execution can never silently lose an update. Reads never block writers out.
//!
//! Transition table: Pending -> InProgress, InProgress -> {Completed, Blocked},
//! Blocked -> InProgress (retry). Completed is terminal except for the
//! explicit administrative `reopen` override.

pub mod document;

use chrono::{DateTime, Utc};
use sdk::errors::ControllerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use document::{DocumentTask, LedgerDocument};

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// Checkbox marker used in the persisted document
    pub fn marker(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "[ ]",
            TaskStatus::InProgress => "[~]",
            TaskStatus::Completed => "[x]",
            TaskStatus::Blocked => "[!]",
        }
    }

    pub fn from_marker(marker: &str) -> Option<TaskStatus> {
        match marker {
            "[ ]" => Some(TaskStatus::Pending),
            "[~]" => Some(TaskStatus::InProgress),
            "[x]" => Some(TaskStatus::Completed),
            "[!]" => Some(TaskStatus::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specification for a new task
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub description: String,
    pub category: String,
    pub complexity: u8,
    pub dependencies: Vec<String>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
            complexity: 1,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// A task record owned by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub category: String,
    pub complexity: u8,
    pub status: TaskStatus,
    pub evidence: Option<String>,
    pub blocked_reason: Option<String>,
    pub retry_count: u32,
    pub notes: Vec<String>,
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency token; advances on every write
    pub version: u64,
}

/// Whether the transition table allows `from -> to`
fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::InProgress)
            | (TaskStatus::InProgress, TaskStatus::Completed)
            | (TaskStatus::InProgress, TaskStatus::Blocked)
            | (TaskStatus::Blocked, TaskStatus::InProgress)
    )
}

struct LedgerInner {
    tasks: HashMap<String, Task>,
    /// Creation order, so snapshots and documents are stable
    order: Vec<String>,
}

/// The task ledger: an arena of versioned tasks
pub struct TaskLedger {
    session_id: String,
    inner: RwLock<LedgerInner>,
    counter: AtomicU64,
}

impl TaskLedger {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            inner: RwLock::new(LedgerInner {
                tasks: HashMap::new(),
                order: Vec::new(),
            }),
            counter: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Create a task from a spec. Ids are sequential: task_1, task_2, ...
    pub fn create_task(&self, spec: TaskSpec) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("task_{}", n);
        let now = Utc::now();

        let task = Task {
            id: id.clone(),
            description: spec.description,
            category: spec.category,
            complexity: spec.complexity,
            status: TaskStatus::Pending,
            evidence: None,
            blocked_reason: None,
            retry_count: 0,
            notes: Vec::new(),
            dependencies: spec.dependencies,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.order.push(id.clone());
        inner.tasks.insert(id.clone(), task);
        id
    }

    /// Update a task's status with optimistic concurrency control.
    ///
    /// `expected_version` must match the stored version read alongside the
    /// prior `get`; a stale version is rejected with `Conflict` and the
    /// caller must re-read and retry. Completed requires non-empty evidence;
    /// Blocked requires a reason. A Blocked -> InProgress transition counts
    /// as a retry and increments `retry_count`.
    pub fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        evidence: Option<&str>,
        reason: Option<&str>,
        expected_version: u64,
    ) -> Result<Task, ControllerError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ControllerError::TaskNotFound(task_id.to_string()))?;

        if task.version != expected_version {
            return Err(ControllerError::Conflict {
                task_id: task_id.to_string(),
                expected: expected_version,
                actual: task.version,
            });
        }

        if !transition_allowed(task.status, new_status) {
            return Err(ControllerError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        match new_status {
            TaskStatus::Completed => {
                let evidence = evidence.map(str::trim).unwrap_or("");
                if evidence.is_empty() {
                    return Err(ControllerError::MissingEvidence(task_id.to_string()));
                }
                task.evidence = Some(evidence.to_string());
            }
            TaskStatus::Blocked => {
                let reason = reason.map(str::trim).unwrap_or("");
                if reason.is_empty() {
                    return Err(ControllerError::MissingBlockedReason(task_id.to_string()));
                }
                task.blocked_reason = Some(reason.to_string());
            }
            TaskStatus::InProgress => {
                if task.status == TaskStatus::Blocked {
                    task.retry_count += 1;
                    task.blocked_reason = None;
                }
            }
            TaskStatus::Pending => {}
        }

        task.status = new_status;
        task.updated_at = Utc::now();
        task.version += 1;

        Ok(task.clone())
    }

    /// Administrative override: take a Completed task back to InProgress.
    ///
    /// This is the only path out of Completed. The old evidence is kept as
    /// a note so the history survives.
    pub fn reopen(&self, task_id: &str) -> Result<Task, ControllerError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ControllerError::TaskNotFound(task_id.to_string()))?;

        if task.status != TaskStatus::Completed {
            return Err(ControllerError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.as_str().to_string(),
                to: "in_progress".to_string(),
            });
        }

        if let Some(evidence) = task.evidence.take() {
            task.notes.push(format!("reopened; prior evidence: {}", evidence));
        }
        task.status = TaskStatus::InProgress;
        task.updated_at = Utc::now();
        task.version += 1;

        Ok(task.clone())
    }

    /// Get a task by id
    pub fn get(&self, task_id: &str) -> Result<Task, ControllerError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| ControllerError::TaskNotFound(task_id.to_string()))
    }

    /// All tasks currently Pending, in creation order
    pub fn list_pending(&self) -> Vec<Task> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect()
    }

    /// True iff every task in the ledger is Completed.
    ///
    /// Blocked counts as not complete. An empty ledger is vacuously complete;
    /// the controller never consults the decision engine before tasks exist.
    pub fn all_complete(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .tasks
            .values()
            .all(|t| t.status == TaskStatus::Completed)
    }

    /// Snapshot of every task, in creation order
    pub fn snapshot(&self) -> Vec<Task> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .cloned()
            .collect()
    }

    /// Render the ledger as its persisted document form
    pub fn to_document(&self) -> LedgerDocument {
        let tasks = self
            .snapshot()
            .into_iter()
            .map(|t| DocumentTask {
                id: t.id,
                description: t.description,
                status: t.status,
                evidence: t.evidence,
                blocked_reason: t.blocked_reason,
                notes: t.notes,
            })
            .collect();

        LedgerDocument {
            session_id: self.session_id.clone(),
            updated_at: Some(Utc::now().to_rfc3339()),
            tasks,
        }
    }

    /// Persist the ledger document to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ControllerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_document().serialize())?;
        Ok(())
    }

    /// Rebuild a ledger from a persisted document.
    ///
    /// Hand edits are accepted as long as the document still parses; task
    /// versions restart at 1.
    pub fn load_from(path: &Path, session_fallback: &str) -> Result<Self, ControllerError> {
        let text = std::fs::read_to_string(path)?;
        let doc = LedgerDocument::parse(&text)?;

        let session_id = if doc.session_id.is_empty() {
            session_fallback.to_string()
        } else {
            doc.session_id.clone()
        };

        let ledger = TaskLedger::new(session_id);
        let now = Utc::now();
        {
            let mut inner = ledger.inner.write().unwrap_or_else(|e| e.into_inner());
            for (i, dt) in doc.tasks.iter().enumerate() {
                let task = Task {
                    id: dt.id.clone(),
                    description: dt.description.clone(),
                    category: String::new(),
                    complexity: 1,
                    status: dt.status,
                    evidence: dt.evidence.clone(),
                    blocked_reason: dt.blocked_reason.clone(),
                    retry_count: 0,
                    notes: dt.notes.clone(),
                    dependencies: Vec::new(),
                    created_at: now,
                    updated_at: now,
                    version: 1,
                };
                inner.order.push(dt.id.clone());
                inner.tasks.insert(dt.id.clone(), task);
                ledger.counter.store((i + 1) as u64, Ordering::SeqCst);
            }
        }
        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_task() -> (TaskLedger, String) {
        let ledger = TaskLedger::new("session-test");
        let id = ledger.create_task(TaskSpec::new("scrape headlines", "scrape"));
        (ledger, id)
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let ledger = TaskLedger::new("s");
        assert_eq!(ledger.create_task(TaskSpec::default()), "task_1");
        assert_eq!(ledger.create_task(TaskSpec::default()), "task_2");
        assert_eq!(ledger.create_task(TaskSpec::default()), "task_3");
    }

    #[test]
    fn test_happy_path_transitions() {
        let (ledger, id) = ledger_with_task();

        let t = ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 1)
            .unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.version, 2);

        let t = ledger
            .update_status(&id, TaskStatus::Completed, Some("5 headlines extracted"), None, 2)
            .unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.evidence.as_deref(), Some("5 headlines extracted"));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let (ledger, id) = ledger_with_task();

        // Pending -> Completed skips InProgress
        let err = ledger
            .update_status(&id, TaskStatus::Completed, Some("done"), None, 1)
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidTransition { .. }));

        // Pending -> Blocked is not in the table either
        let err = ledger
            .update_status(&id, TaskStatus::Blocked, None, Some("stuck"), 1)
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidTransition { .. }));
    }

    #[test]
    fn test_completed_is_terminal_without_override() {
        let (ledger, id) = ledger_with_task();
        ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 1)
            .unwrap();
        ledger
            .update_status(&id, TaskStatus::Completed, Some("done"), None, 2)
            .unwrap();

        let err = ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 3)
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidTransition { .. }));

        // The administrative override is the only way back
        let t = ledger.reopen(&id).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert!(t.notes.iter().any(|n| n.contains("prior evidence")));
    }

    #[test]
    fn test_completed_requires_evidence() {
        let (ledger, id) = ledger_with_task();
        ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 1)
            .unwrap();

        let err = ledger
            .update_status(&id, TaskStatus::Completed, None, None, 2)
            .unwrap_err();
        assert!(matches!(err, ControllerError::MissingEvidence(_)));

        let err = ledger
            .update_status(&id, TaskStatus::Completed, Some("   "), None, 2)
            .unwrap_err();
        assert!(matches!(err, ControllerError::MissingEvidence(_)));
    }

    #[test]
    fn test_blocked_requires_reason_and_retry_increments() {
        let (ledger, id) = ledger_with_task();
        ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 1)
            .unwrap();

        let err = ledger
            .update_status(&id, TaskStatus::Blocked, None, None, 2)
            .unwrap_err();
        assert!(matches!(err, ControllerError::MissingBlockedReason(_)));

        let t = ledger
            .update_status(&id, TaskStatus::Blocked, None, Some("connection refused"), 2)
            .unwrap();
        assert_eq!(t.blocked_reason.as_deref(), Some("connection refused"));
        assert_eq!(t.retry_count, 0);

        // Blocked -> InProgress is the retry edge
        let t = ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 3)
            .unwrap();
        assert_eq!(t.retry_count, 1);
        assert!(t.blocked_reason.is_none());
    }

    #[test]
    fn test_stale_version_conflicts() {
        let (ledger, id) = ledger_with_task();
        ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 1)
            .unwrap();

        // Writer still holding version 1 loses
        let err = ledger
            .update_status(&id, TaskStatus::Blocked, None, Some("stale"), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_concurrent_stale_writers_exactly_one_wins() {
        use std::sync::Arc;

        let ledger = Arc::new(TaskLedger::new("s"));
        let id = ledger.create_task(TaskSpec::new("shared", "execute"));
        ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 1)
            .unwrap();

        // Both writers read version 2 and race to complete the task
        let mut handles = Vec::new();
        for _ in 0..2 {
            let ledger = Arc::clone(&ledger);
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                ledger.update_status(&id, TaskStatus::Completed, Some("done"), None, 2)
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(ControllerError::Conflict { .. })))
            .count();

        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
    }

    #[test]
    fn test_all_complete() {
        let ledger = TaskLedger::new("s");
        let a = ledger.create_task(TaskSpec::new("a", "execute"));
        let b = ledger.create_task(TaskSpec::new("b", "execute"));

        assert!(!ledger.all_complete());

        for id in [&a, &b] {
            ledger
                .update_status(id, TaskStatus::InProgress, None, None, 1)
                .unwrap();
            ledger
                .update_status(id, TaskStatus::Completed, Some("done"), None, 2)
                .unwrap();
        }
        assert!(ledger.all_complete());
    }

    #[test]
    fn test_blocked_counts_as_incomplete() {
        let ledger = TaskLedger::new("s");
        let id = ledger.create_task(TaskSpec::new("a", "execute"));
        ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 1)
            .unwrap();
        ledger
            .update_status(&id, TaskStatus::Blocked, None, Some("stuck"), 2)
            .unwrap();
        assert!(!ledger.all_complete());
    }

    #[test]
    fn test_list_pending() {
        let ledger = TaskLedger::new("s");
        let a = ledger.create_task(TaskSpec::new("a", "execute"));
        let _b = ledger.create_task(TaskSpec::new("b", "execute"));

        ledger
            .update_status(&a, TaskStatus::InProgress, None, None, 1)
            .unwrap();

        let pending = ledger.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].description, "b");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("to-do.md");

        let (ledger, id) = ledger_with_task();
        ledger
            .update_status(&id, TaskStatus::InProgress, None, None, 1)
            .unwrap();
        ledger
            .update_status(&id, TaskStatus::Completed, Some("5 headlines extracted"), None, 2)
            .unwrap();
        ledger.save_to(&path).unwrap();

        let restored = TaskLedger::load_from(&path, "fallback").unwrap();
        assert_eq!(restored.session_id(), "session-test");
        let task = restored.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.evidence.as_deref(), Some("5 headlines extracted"));
    }
}

//! Append-only audit trail
//!
//! Every externally visible action (step execution, hook decision, approval
//! lifecycle, task update, security event) is appended to a JSONL file. The
//! log is never rewritten in place; the writer only appends and fsyncs at
//! session boundaries and before escalation hand-offs.

use chrono::{DateTime, Utc};
use sdk::errors::ControllerError;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Category of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    SessionStart,
    SessionEnd,
    IntentReceived,
    PlanCreated,
    StepExecution,
    HookDecision,
    ApprovalRequest,
    ApprovalResponse,
    TaskUpdate,
    Error,
    SecurityEvent,
}

/// One line of the audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub kind: AuditKind,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, session_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            event_id: String::new(),
            kind,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            task_id: None,
            action: action.into(),
            details: None,
            success: true,
            error: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Append-only JSONL audit log
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
    counter: AtomicU64,
}

impl AuditLog {
    /// Open the log at `path`, creating parent directories as needed.
    ///
    /// The event counter resumes from the number of existing lines so ids
    /// stay unique across process restarts.
    pub fn open(path: &Path) -> Result<Self, ControllerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let existing = match std::fs::read_to_string(path) {
            Ok(text) => text.lines().filter(|l| !l.trim().is_empty()).count() as u64,
            Err(_) => 0,
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            counter: AtomicU64::new(existing),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Assigns the event id and returns it.
    pub fn append(&self, mut event: AuditEvent) -> Result<String, ControllerError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        event.event_id = format!("evt_{:06}", n);

        let line = serde_json::to_string(&event)
            .map_err(|e| ControllerError::Config(format!("audit serialization failed: {e}")))?;

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(file, "{}", line)?;
        Ok(event.event_id)
    }

    /// Force buffered writes to disk. Called at session end and before the
    /// loop hands control to a human.
    pub fn flush(&self) -> Result<(), ControllerError> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.sync_all()?;
        Ok(())
    }

    /// All events recorded for a session, oldest first
    pub fn events_for_session(&self, session_id: &str) -> Result<Vec<AuditEvent>, ControllerError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line)
                .map_err(|e| ControllerError::Config(format!("corrupt audit line: {e}")))?;
            if event.session_id == session_id {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// The most recent `limit` events across all sessions
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>, ControllerError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line)
                .map_err(|e| ControllerError::Config(format!("corrupt audit line: {e}")))?;
            events.push(event);
        }
        let start = events.len().saturating_sub(limit);
        Ok(events.split_off(start))
    }
}

//! Ledger document codec
//!
//! The persisted form of the task ledger is a human-editable markdown
//! document with four status markers:
//!
//! ```text
//! # Task Ledger
//! Session: session-001
//! Updated: 2026-08-28T10:00:00+00:00
//!
//! ## Core Tasks
//! [ ] task_1: assemble context
//! [~] task_2: scrape headlines
//! [x] task_3: verify completion
//!     Evidence: all checks passed
//! [!] task_4: notify channel
//!     Blocked: rate limit exceeded
//!     - retried twice
//!
//! ## Notes
//! - Tasks may be expanded but never deleted
//! - Completed tasks must include evidence
//! ```
//!
//! The codec is a typed record with a dedicated serializer and parser, not ad
//! hoc text scanning. It satisfies the round-trip law: parse -> serialize ->
//! parse is a no-op. The parser tolerates hand edits: unrecognized indented
//! lines under a task become notes, and unrecognized top-level lines are
//! ignored.

use super::TaskStatus;
use sdk::errors::ControllerError;

const HEADER: &str = "# Task Ledger";
const TASKS_SECTION: &str = "## Core Tasks";
const NOTES_SECTION: &str = "## Notes";

/// One task as it appears in the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub evidence: Option<String>,
    pub blocked_reason: Option<String>,
    pub notes: Vec<String>,
}

/// The typed ledger document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDocument {
    pub session_id: String,
    /// Kept verbatim so a parse/serialize cycle does not rewrite history
    pub updated_at: Option<String>,
    pub tasks: Vec<DocumentTask>,
}

impl LedgerDocument {
    /// Parse a ledger document from text.
    ///
    /// Fails only on structurally broken task lines (a marker with no
    /// `id: description` after it); everything else degrades gracefully.
    pub fn parse(text: &str) -> Result<LedgerDocument, ControllerError> {
        let mut session_id = String::new();
        let mut updated_at = None;
        let mut tasks: Vec<DocumentTask> = Vec::new();
        let mut in_notes_section = false;

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim_end();
            if line.is_empty() || line == HEADER || line == TASKS_SECTION {
                continue;
            }
            if line == NOTES_SECTION {
                in_notes_section = true;
                continue;
            }
            if in_notes_section {
                // Footer notes are boilerplate, regenerated on serialize
                continue;
            }

            if let Some(rest) = line.strip_prefix("Session: ") {
                session_id = rest.trim().to_string();
                continue;
            }
            if let Some(rest) = line.strip_prefix("Updated: ") {
                updated_at = Some(rest.trim().to_string());
                continue;
            }

            // Indented lines attach to the task above them
            if raw.starts_with(' ') || raw.starts_with('\t') {
                let task = tasks.last_mut().ok_or_else(|| {
                    ControllerError::DocumentParse(format!(
                        "line {}: detail line with no task above it",
                        line_no + 1
                    ))
                })?;
                let detail = line.trim_start();
                if let Some(evidence) = detail.strip_prefix("Evidence: ") {
                    task.evidence = Some(evidence.to_string());
                } else if let Some(reason) = detail.strip_prefix("Blocked: ") {
                    task.blocked_reason = Some(reason.to_string());
                } else if let Some(note) = detail.strip_prefix("- ") {
                    task.notes.push(note.to_string());
                } else {
                    // Hand-edited detail line; keep it as a note
                    task.notes.push(detail.to_string());
                }
                continue;
            }

            // Task lines start with one of the four markers
            if line.len() >= 3 {
                if let Some(status) = TaskStatus::from_marker(&line[..3]) {
                    let rest = line[3..].trim_start();
                    let (id, description) = rest.split_once(':').ok_or_else(|| {
                        ControllerError::DocumentParse(format!(
                            "line {}: task line missing 'id: description'",
                            line_no + 1
                        ))
                    })?;
                    tasks.push(DocumentTask {
                        id: id.trim().to_string(),
                        description: description.trim().to_string(),
                        status,
                        evidence: None,
                        blocked_reason: None,
                        notes: Vec::new(),
                    });
                    continue;
                }
            }

            // Unknown top-level line from a hand edit; ignore it
        }

        Ok(LedgerDocument {
            session_id,
            updated_at,
            tasks,
        })
    }

    /// Serialize to the canonical document form
    pub fn serialize(&self) -> String {
        let mut lines = vec![HEADER.to_string(), format!("Session: {}", self.session_id)];
        if let Some(updated) = &self.updated_at {
            lines.push(format!("Updated: {}", updated));
        }
        lines.push(String::new());
        lines.push(TASKS_SECTION.to_string());

        for task in &self.tasks {
            lines.push(format!(
                "{} {}: {}",
                task.status.marker(),
                task.id,
                task.description
            ));
            if let Some(evidence) = &task.evidence {
                lines.push(format!("    Evidence: {}", evidence));
            }
            if let Some(reason) = &task.blocked_reason {
                lines.push(format!("    Blocked: {}", reason));
            }
            for note in &task.notes {
                lines.push(format!("    - {}", note));
            }
        }

        lines.push(String::new());
        lines.push(NOTES_SECTION.to_string());
        lines.push("- Tasks may be expanded but never deleted".to_string());
        lines.push("- Completed tasks must include evidence".to_string());
        lines.push(String::new());

        lines.join("\n")
    }
}

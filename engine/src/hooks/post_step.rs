//! Post-step verifier
//!
//! Takes the outcome of a capability invocation and applies it to the ledger.
//! Successful outcomes must carry evidence; a success without evidence is
//! reclassified as a failure rather than completing the task unproven.
//!
//! Applies are idempotent per execution attempt. Every capability invocation
//! carries an attempt id; a redelivered outcome for an attempt that already
//! landed is recognized and skipped, so retries at the transport layer can
//! never record cost or evidence twice. A fresh retry of a failed step is a
//! new attempt and applies normally. Stale ledger versions are re-read and
//! retried a bounded number of times.

use crate::audit::{AuditEvent, AuditKind, AuditLog};
use crate::escalation::EscalationManager;
use crate::ledger::{Task, TaskLedger, TaskStatus};
use sdk::errors::ControllerError;
use sdk::types::CapabilityOutcome;
use serde_json::json;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

/// Bounded CAS retries when another writer touched the task mid-apply
const MAX_APPLY_RETRIES: u32 = 3;

/// How the outcome landed in the ledger
#[derive(Debug, Clone)]
pub enum StepDisposition {
    /// The task completed with evidence
    Completed(Task),
    /// The task is blocked pending retry or escalation
    Failed { task: Task, message: String },
    /// The outcome was already applied; nothing was written
    Duplicate(Task),
}

/// The post-step hook: the only ledger writer on the execution path
pub struct PostStepHook {
    session_id: String,
    audit: Arc<AuditLog>,
    escalation: Arc<EscalationManager>,
    applied: Mutex<HashSet<u64>>,
}

impl PostStepHook {
    pub fn new(
        session_id: impl Into<String>,
        audit: Arc<AuditLog>,
        escalation: Arc<EscalationManager>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            audit,
            escalation,
            applied: Mutex::new(HashSet::new()),
        }
    }

    fn fingerprint(task_id: &str, attempt_id: &str) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        task_id.hash(&mut hasher);
        attempt_id.hash(&mut hasher);
        hasher.finish()
    }

    /// Apply one outcome to the ledger.
    ///
    /// The caller is expected to have moved the task to InProgress before
    /// execution; this hook moves it to Completed or Blocked. `attempt_id`
    /// identifies the execution attempt and scopes the idempotence guard.
    pub fn apply(
        &self,
        ledger: &TaskLedger,
        task_id: &str,
        attempt_id: &str,
        outcome: &CapabilityOutcome,
    ) -> Result<StepDisposition, ControllerError> {
        let fingerprint = Self::fingerprint(task_id, attempt_id);
        {
            let applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
            if applied.contains(&fingerprint) {
                tracing::debug!(task_id, "duplicate outcome delivery ignored");
                return Ok(StepDisposition::Duplicate(ledger.get(task_id)?));
            }
        }

        // Success without evidence does not complete the task
        let failure_message = if outcome.is_success() {
            if outcome.evidence.trim().is_empty() {
                Some("capability reported success without evidence".to_string())
            } else {
                None
            }
        } else {
            Some(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "unspecified failure".to_string()),
            )
        };

        let disposition = match failure_message {
            None => {
                let task = self.write_status(
                    ledger,
                    task_id,
                    TaskStatus::Completed,
                    Some(&outcome.evidence),
                    None,
                )?;
                StepDisposition::Completed(task)
            }
            Some(message) => {
                let task =
                    self.write_status(ledger, task_id, TaskStatus::Blocked, None, Some(&message))?;
                StepDisposition::Failed { task, message }
            }
        };

        // The attempt is claimed only once its write landed; a failed write
        // leaves the attempt eligible for redelivery
        {
            let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
            applied.insert(fingerprint);
        }
        self.escalation.record_cost(outcome.cost);

        let (status, error) = match &disposition {
            StepDisposition::Completed(t) | StepDisposition::Duplicate(t) => (t.status, None),
            StepDisposition::Failed { task, message } => (task.status, Some(message.clone())),
        };

        let mut event = AuditEvent::new(AuditKind::TaskUpdate, &self.session_id, "outcome applied")
            .with_task(task_id)
            .with_details(json!({
                "status": status.as_str(),
                "cost": outcome.cost,
                "artifacts": outcome.artifacts,
            }));
        if let Some(error) = error {
            event = event.failed(error);
        }
        self.audit.append(event)?;

        Ok(disposition)
    }

    /// CAS write with bounded re-reads on conflict
    fn write_status(
        &self,
        ledger: &TaskLedger,
        task_id: &str,
        status: TaskStatus,
        evidence: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Task, ControllerError> {
        let mut attempt = 0;
        loop {
            let current = ledger.get(task_id)?;
            match ledger.update_status(task_id, status, evidence, reason, current.version) {
                Ok(task) => return Ok(task),
                Err(ControllerError::Conflict { .. }) if attempt < MAX_APPLY_RETRIES => {
                    attempt += 1;
                    tracing::debug!(task_id, attempt, "conflicting ledger write, re-reading");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

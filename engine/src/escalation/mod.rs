//! Escalation Manager
//!
//! Tracks the session-level limits the stop decision engine enforces
//! (iterations, wall-clock time, budget), owns per-task retry counters, and
//! runs the human approval lifecycle. Approval requests time out into
//! `TimedOut`; a timeout is never treated as consent.
//!
//! Everything that passes through here lands in the audit trail before the
//! loop is allowed to proceed.

use crate::audit::{AuditEvent, AuditKind, AuditLog};
use chrono::{DateTime, Utc};
use sdk::errors::ControllerError;
use sdk::types::RiskLevel;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Resolution state of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::TimedOut => "timed_out",
        }
    }
}

/// A request for human sign-off on a risky action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub action_description: String,
    pub risk_level: RiskLevel,
    pub status: ApprovalStatus,
    pub timeout_secs: u64,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Hard limits configured for a session
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_iterations: u32,
    pub max_time: Duration,
    pub budget_cap: f64,
    pub retry_cap: u32,
    pub approval_timeout: Duration,
}

/// Point-in-time view of session counters, consumed by the decision engine
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub iteration_count: u32,
    pub elapsed: Duration,
    pub budget_spent: f64,
    pub max_iterations: u32,
    pub max_time: Duration,
    pub budget_cap: f64,
    pub permission_violation: bool,
}

/// The most recent unresolved step failure
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub task_id: String,
    pub message: String,
    pub risk: RiskLevel,
    pub retry_count: u32,
}

struct EscalationState {
    iterations: u32,
    budget_spent: f64,
    permission_violation: bool,
    retries: HashMap<String, u32>,
    last_failure: Option<FailureContext>,
    approvals: HashMap<String, ApprovalRequest>,
    deadlines: HashMap<String, Instant>,
    approval_counter: u64,
}

/// Session budget, retry, and approval bookkeeping
pub struct EscalationManager {
    session_id: String,
    started: Instant,
    limits: SessionLimits,
    state: Mutex<EscalationState>,
    audit: Arc<AuditLog>,
}

impl EscalationManager {
    pub fn new(session_id: impl Into<String>, limits: SessionLimits, audit: Arc<AuditLog>) -> Self {
        Self {
            session_id: session_id.into(),
            started: Instant::now(),
            limits,
            state: Mutex::new(EscalationState {
                iterations: 0,
                budget_spent: 0.0,
                permission_violation: false,
                retries: HashMap::new(),
                last_failure: None,
                approvals: HashMap::new(),
                deadlines: HashMap::new(),
                approval_counter: 0,
            }),
            audit,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Count one pass of the control loop
    pub fn record_iteration(&self) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.iterations += 1;
        state.iterations
    }

    /// Reject an action whose estimate would push spend past the cap.
    ///
    /// Checked before execution so the budget can never be exceeded by a
    /// single step; actual costs are recorded after the step runs.
    pub fn check_budget(&self, estimate: f64) -> Result<(), ControllerError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.budget_spent + estimate > self.limits.budget_cap {
            return Err(ControllerError::BudgetExceeded {
                spent: state.budget_spent,
                estimate,
                cap: self.limits.budget_cap,
            });
        }
        Ok(())
    }

    /// Record actual cost incurred by a completed step
    pub fn record_cost(&self, cost: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.budget_spent += cost;
    }

    /// Record a permission violation. Fatal for the session.
    pub fn record_violation(
        &self,
        task_id: &str,
        detail: &str,
    ) -> Result<(), ControllerError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.permission_violation = true;
        }
        self.audit.append(
            AuditEvent::new(AuditKind::SecurityEvent, &self.session_id, "permission violation")
                .with_task(task_id)
                .failed(detail),
        )?;
        Ok(())
    }

    /// Record a step failure: bumps the task's retry counter and stores the
    /// failure as the session's unresolved failure context.
    pub fn record_task_failure(
        &self,
        task_id: &str,
        message: &str,
        risk: RiskLevel,
    ) -> Result<FailureContext, ControllerError> {
        let context = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let retries = state.retries.entry(task_id.to_string()).or_insert(0);
            *retries += 1;
            let context = FailureContext {
                task_id: task_id.to_string(),
                message: message.to_string(),
                risk,
                retry_count: *retries,
            };
            state.last_failure = Some(context.clone());
            context
        };
        self.audit.append(
            AuditEvent::new(AuditKind::Error, &self.session_id, "step failed")
                .with_task(task_id)
                .failed(message),
        )?;
        Ok(context)
    }

    /// Clear the unresolved failure after a successful retry
    pub fn clear_task_failure(&self, task_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state
            .last_failure
            .as_ref()
            .is_some_and(|f| f.task_id == task_id)
        {
            state.last_failure = None;
        }
    }

    pub fn retry_count(&self, task_id: &str) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.retries.get(task_id).copied().unwrap_or(0)
    }

    pub fn last_failure(&self) -> Option<FailureContext> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_failure.clone()
    }

    /// Raise a new approval request and audit it
    pub fn raise_approval(
        &self,
        action_description: &str,
        risk_level: RiskLevel,
    ) -> Result<ApprovalRequest, ControllerError> {
        let request = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.approval_counter += 1;
            let id = format!("appr_{:04}", state.approval_counter);
            let request = ApprovalRequest {
                id: id.clone(),
                action_description: action_description.to_string(),
                risk_level,
                status: ApprovalStatus::Pending,
                timeout_secs: self.limits.approval_timeout.as_secs(),
                requested_at: Utc::now(),
                resolved_by: None,
                resolved_at: None,
            };
            state
                .deadlines
                .insert(id.clone(), Instant::now() + self.limits.approval_timeout);
            state.approvals.insert(id, request.clone());
            request
        };
        self.audit.append(
            AuditEvent::new(AuditKind::ApprovalRequest, &self.session_id, action_description)
                .with_details(json!({
                    "approval_id": request.id,
                    "risk_level": request.risk_level.as_str(),
                    "timeout_secs": request.timeout_secs,
                })),
        )?;
        Ok(request)
    }

    /// Resolve a pending approval as approved or rejected.
    ///
    /// A request that already timed out or was already resolved cannot be
    /// resolved again.
    pub fn resolve_approval(
        &self,
        approval_id: &str,
        approved: bool,
        resolved_by: &str,
    ) -> Result<ApprovalRequest, ControllerError> {
        let request = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let request = state
                .approvals
                .get_mut(approval_id)
                .ok_or_else(|| ControllerError::ApprovalNotFound(approval_id.to_string()))?;

            if request.status != ApprovalStatus::Pending {
                return Err(ControllerError::ApprovalAlreadyResolved {
                    id: approval_id.to_string(),
                    status: request.status.as_str().to_string(),
                });
            }

            request.status = if approved {
                ApprovalStatus::Approved
            } else {
                ApprovalStatus::Rejected
            };
            request.resolved_by = Some(resolved_by.to_string());
            request.resolved_at = Some(Utc::now());
            let request = request.clone();
            state.deadlines.remove(approval_id);
            request
        };
        self.audit.append(
            AuditEvent::new(AuditKind::ApprovalResponse, &self.session_id, "approval resolved")
                .with_details(json!({
                    "approval_id": request.id,
                    "status": request.status.as_str(),
                    "resolved_by": resolved_by,
                })),
        )?;
        Ok(request)
    }

    /// Expire pending approvals past their deadline. Returns the ids that
    /// timed out on this sweep. Timed-out requests are never auto-approved.
    pub fn sweep_timeouts(&self) -> Result<Vec<String>, ControllerError> {
        let now = Instant::now();
        let expired: Vec<(String, ApprovalRequest)> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = state
                .deadlines
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired = Vec::new();
            for id in ids {
                state.deadlines.remove(&id);
                if let Some(request) = state.approvals.get_mut(&id) {
                    if request.status == ApprovalStatus::Pending {
                        request.status = ApprovalStatus::TimedOut;
                        request.resolved_at = Some(Utc::now());
                        expired.push((id, request.clone()));
                    }
                }
            }
            expired
        };

        let mut ids = Vec::new();
        for (id, request) in expired {
            self.audit.append(
                AuditEvent::new(AuditKind::ApprovalResponse, &self.session_id, "approval timed out")
                    .with_details(json!({
                        "approval_id": request.id,
                        "status": "timed_out",
                    }))
                    .failed("no response within timeout"),
            )?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn get_approval(&self, approval_id: &str) -> Option<ApprovalRequest> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.approvals.get(approval_id).cloned()
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<ApprovalRequest> = state
            .approvals
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending
    }

    /// Snapshot the counters for the decision engine
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        SessionSnapshot {
            iteration_count: state.iterations,
            elapsed: self.started.elapsed(),
            budget_spent: state.budget_spent,
            max_iterations: self.limits.max_iterations,
            max_time: self.limits.max_time,
            budget_cap: self.limits.budget_cap,
            permission_violation: state.permission_violation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_timeout(timeout: Duration) -> (EscalationManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(&dir.path().join("audit.log")).unwrap());
        let manager = EscalationManager::new(
            "session-test",
            SessionLimits {
                max_iterations: 20,
                max_time: Duration::from_secs(600),
                budget_cap: 10.0,
                retry_cap: 3,
                approval_timeout: timeout,
            },
            audit,
        );
        (manager, dir)
    }

    fn manager() -> (EscalationManager, tempfile::TempDir) {
        manager_with_timeout(Duration::from_secs(300))
    }

    #[test]
    fn test_budget_check_and_record() {
        let (m, _dir) = manager();
        assert!(m.check_budget(5.0).is_ok());

        m.record_cost(9.5);
        let err = m.check_budget(1.0).unwrap_err();
        assert!(matches!(err, ControllerError::BudgetExceeded { .. }));

        // An estimate that still fits is allowed
        assert!(m.check_budget(0.4).is_ok());
    }

    #[test]
    fn test_failure_tracking_increments_retries() {
        let (m, _dir) = manager();

        let c = m
            .record_task_failure("task_2", "timeout connecting", RiskLevel::Low)
            .unwrap();
        assert_eq!(c.retry_count, 1);

        let c = m
            .record_task_failure("task_2", "timeout connecting", RiskLevel::Low)
            .unwrap();
        assert_eq!(c.retry_count, 2);
        assert_eq!(m.retry_count("task_2"), 2);
        assert_eq!(m.retry_count("task_9"), 0);

        assert!(m.last_failure().is_some());
        m.clear_task_failure("task_2");
        assert!(m.last_failure().is_none());
    }

    #[test]
    fn test_approval_lifecycle() {
        let (m, _dir) = manager();
        let request = m
            .raise_approval("drop staging schema", RiskLevel::High)
            .unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert_eq!(m.pending_approvals().len(), 1);

        let resolved = m.resolve_approval(&request.id, true, "operator").unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("operator"));
        assert!(m.pending_approvals().is_empty());

        // Double resolution is rejected
        let err = m.resolve_approval(&request.id, false, "operator").unwrap_err();
        assert!(matches!(err, ControllerError::ApprovalAlreadyResolved { .. }));
    }

    #[test]
    fn test_unknown_approval_id() {
        let (m, _dir) = manager();
        let err = m.resolve_approval("appr_9999", true, "operator").unwrap_err();
        assert!(matches!(err, ControllerError::ApprovalNotFound(_)));
    }

    #[test]
    fn test_timeout_never_auto_approves() {
        let (m, _dir) = manager_with_timeout(Duration::from_millis(0));
        let request = m
            .raise_approval("deploy release", RiskLevel::High)
            .unwrap();

        let expired = m.sweep_timeouts().unwrap();
        assert_eq!(expired, vec![request.id.clone()]);

        let request = m.get_approval(&request.id).unwrap();
        assert_eq!(request.status, ApprovalStatus::TimedOut);

        // A timed-out request cannot be flipped to approved afterwards
        let err = m.resolve_approval(&request.id, true, "operator").unwrap_err();
        assert!(matches!(err, ControllerError::ApprovalAlreadyResolved { .. }));
    }

    #[test]
    fn test_violation_flag_in_snapshot() {
        let (m, _dir) = manager();
        assert!(!m.snapshot().permission_violation);
        m.record_violation("task_3", "fs:write not granted").unwrap();
        assert!(m.snapshot().permission_violation);
    }

    #[test]
    fn test_iteration_counter() {
        let (m, _dir) = manager();
        assert_eq!(m.record_iteration(), 1);
        assert_eq!(m.record_iteration(), 2);
        assert_eq!(m.snapshot().iteration_count, 2);
    }
}

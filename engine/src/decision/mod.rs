//! Stop Decision Engine
//!
//! One pure function over the ledger snapshot and the session counters,
//! evaluated after every iteration. The rules are a strict priority list;
//! higher rules always win:
//!
//! 1. A hard limit is breached (iterations, wall clock, budget, or a
//!    permission violation) -> TerminateLimit.
//! 2. Work remains and nothing is failing -> Continue.
//! 3. Everything is complete and verified -> TerminateSuccess.
//! 4. The last failure matches the remediation catalog and the task is under
//!    its retry cap -> Continue, carrying the fix to apply.
//! 5. The retry cap is exhausted, the failure is high risk, or the failure is
//!    not cataloged -> Escalate to a human.
//! 6. Otherwise -> Continue.
//!
//! Success is never declared while any task is incomplete, and an
//! uncataloged failure escalates rather than looping blind.

pub mod remediation;

pub use remediation::{Remediation, RemediationCatalog};

use crate::escalation::{FailureContext, SessionSnapshot};
use crate::ledger::{Task, TaskStatus};
use sdk::types::RiskLevel;
use serde::Serialize;

/// What the control loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Continue,
    TerminateSuccess,
    TerminateLimit,
    Escalate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Continue => "continue",
            Verdict::TerminateSuccess => "terminate_success",
            Verdict::TerminateLimit => "terminate_limit",
            Verdict::Escalate => "escalate",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Continue)
    }
}

/// A verdict with its reason and, for cataloged failures, the fix to apply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,
}

impl Decision {
    fn of(verdict: Verdict, reason: &str) -> Self {
        Self {
            verdict,
            reason: reason.to_string(),
            remediation: None,
        }
    }
}

/// The decision engine
pub struct StopDecisionEngine {
    retry_cap: u32,
    catalog: RemediationCatalog,
}

impl StopDecisionEngine {
    pub fn new(retry_cap: u32, catalog: RemediationCatalog) -> Self {
        Self { retry_cap, catalog }
    }

    /// Evaluate the rules against the current session state.
    ///
    /// `tests_passing` reports whether the verification steps of the plan
    /// have all completed; success requires it in addition to task
    /// completion.
    pub fn decide(
        &self,
        tasks: &[Task],
        session: &SessionSnapshot,
        last_failure: Option<&FailureContext>,
        tests_passing: bool,
    ) -> Decision {
        // Rule 1: hard limits trump everything
        if session.permission_violation {
            return Decision::of(Verdict::TerminateLimit, "permission_violation");
        }
        if session.iteration_count >= session.max_iterations {
            return Decision::of(Verdict::TerminateLimit, "max_iterations_exceeded");
        }
        if session.elapsed >= session.max_time {
            return Decision::of(Verdict::TerminateLimit, "max_time_exceeded");
        }
        if session.budget_spent >= session.budget_cap {
            return Decision::of(Verdict::TerminateLimit, "budget_cap_exceeded");
        }

        let all_complete = tasks.iter().all(|t| t.status == TaskStatus::Completed);

        // Rule 2: keep going while work remains and nothing is failing
        if !all_complete && last_failure.is_none() {
            return Decision::of(Verdict::Continue, "tasks_remaining");
        }

        // Rule 3: done and verified
        if all_complete && tests_passing {
            return Decision::of(Verdict::TerminateSuccess, "all_tests_passed");
        }

        if let Some(failure) = last_failure {
            // Rule 4: a cataloged failure under the retry cap is retried
            if let Some(remediation) = self.catalog.lookup(&failure.message) {
                if failure.retry_count < self.retry_cap {
                    return Decision {
                        verdict: Verdict::Continue,
                        reason: "known_error_with_remediation".to_string(),
                        remediation: Some(remediation.clone()),
                    };
                }
                // Rule 5: cap exhausted even though the fix is known
                return Decision::of(Verdict::Escalate, "retry_cap_exhausted");
            }

            // Rule 5: high-risk or uncataloged failures go to a human
            if failure.risk == RiskLevel::High {
                return Decision::of(Verdict::Escalate, "high_risk_failure");
            }
            return Decision::of(Verdict::Escalate, "unknown_error");
        }

        // Rule 6
        Decision::of(Verdict::Continue, "default_continue")
    }
}

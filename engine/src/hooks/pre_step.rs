//! Pre-step gate
//!
//! Runs before every capability invocation. Checks, in order: granted
//! permissions, the session budget, the per-capability rate window, then the
//! approval triggers (high risk, cost at or past the threshold, destructive
//! wording in the step description).

use crate::escalation::EscalationManager;
use regex::Regex;
use sdk::errors::ControllerError;
use sdk::types::{RegistryEntry, RiskLevel, StepSpec};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outcome of the pre-step gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Proceed with execution
    Allow,
    /// Refuse execution. `violation` marks a security violation, which is
    /// fatal for the session rather than merely skipping the step.
    Deny { reason: String, violation: bool },
    /// Suspend the step until a human approves it
    RequireApproval(RiskLevel),
}

/// The pre-step hook
pub struct PreStepHook {
    granted_permissions: BTreeSet<String>,
    destructive: Regex,
    rate: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_calls: u32,
    window: Duration,
    cost_threshold: f64,
    escalation: Arc<EscalationManager>,
}

impl PreStepHook {
    pub fn new(
        granted_permissions: &[&str],
        max_calls: u32,
        window: Duration,
        cost_threshold: f64,
        escalation: Arc<EscalationManager>,
    ) -> Self {
        Self {
            granted_permissions: granted_permissions.iter().map(|p| p.to_string()).collect(),
            // Constant pattern, covered by the tests below
            #[allow(clippy::unwrap_used)]
            destructive: Regex::new(r"(?i)\b(delete|drop|remove|destroy|terminate|kill)\b")
                .unwrap(),
            rate: Mutex::new(HashMap::new()),
            max_calls,
            window,
            cost_threshold,
            escalation,
        }
    }

    pub fn grant_permission(&mut self, permission: &str) {
        self.granted_permissions.insert(permission.to_string());
    }

    /// Gate one step. Ordering matters: a permission violation must be
    /// reported even when the budget or rate window would also have refused
    /// the step.
    pub fn evaluate(
        &self,
        entry: &RegistryEntry,
        spec: &StepSpec,
        risk: RiskLevel,
    ) -> GateDecision {
        for permission in &entry.required_permissions {
            if !self.granted_permissions.contains(permission) {
                let err = ControllerError::PermissionDenied {
                    capability: entry.name.clone(),
                    permission: permission.clone(),
                };
                tracing::warn!(
                    capability = %entry.name,
                    permission = %permission,
                    "pre-step gate denied step"
                );
                return GateDecision::Deny {
                    reason: err.to_string(),
                    violation: true,
                };
            }
        }

        if let Err(err) = self.escalation.check_budget(entry.estimated_cost) {
            return GateDecision::Deny {
                reason: err.to_string(),
                violation: false,
            };
        }

        if let Some(count) = self.rate_exceeded(&entry.name) {
            let err = ControllerError::RateLimitExceeded {
                capability: entry.name.clone(),
                count,
                limit: self.max_calls,
                window_secs: self.window.as_secs(),
            };
            return GateDecision::Deny {
                reason: err.to_string(),
                violation: false,
            };
        }

        if risk == RiskLevel::High {
            return GateDecision::RequireApproval(risk);
        }
        if entry.estimated_cost >= self.cost_threshold {
            return GateDecision::RequireApproval(risk.escalate());
        }
        if self.destructive.is_match(&spec.description) {
            return GateDecision::RequireApproval(risk.escalate());
        }

        GateDecision::Allow
    }

    /// Record a call against the rate window; returns the current count when
    /// the window is already full.
    fn rate_exceeded(&self, capability: &str) -> Option<u32> {
        let now = Instant::now();
        let mut rate = self.rate.lock().unwrap_or_else(|e| e.into_inner());
        let calls = rate.entry(capability.to_string()).or_default();

        while calls
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            calls.pop_front();
        }

        if calls.len() as u32 >= self.max_calls {
            return Some(calls.len() as u32);
        }
        calls.push_back(now);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::escalation::SessionLimits;
    use sdk::types::CapabilityKind;

    fn hook(permissions: &[&str], max_calls: u32) -> (PreStepHook, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(&dir.path().join("audit.log")).unwrap());
        let escalation = Arc::new(EscalationManager::new(
            "session-test",
            SessionLimits {
                max_iterations: 20,
                max_time: Duration::from_secs(600),
                budget_cap: 10.0,
                retry_cap: 3,
                approval_timeout: Duration::from_secs(300),
            },
            audit,
        ));
        let hook = PreStepHook::new(
            permissions,
            max_calls,
            Duration::from_secs(60),
            1.0,
            escalation,
        );
        (hook, dir)
    }

    fn entry() -> RegistryEntry {
        RegistryEntry::new("web-scrape", CapabilityKind::Skill, &["scrape"], 10)
            .with_permissions(&["net:read"])
            .with_cost(0.1)
    }

    fn spec(description: &str) -> StepSpec {
        StepSpec::new("step_2", description)
    }

    #[test]
    fn test_allow_when_everything_checks_out() {
        let (hook, _dir) = hook(&["net:read"], 30);
        let d = hook.evaluate(&entry(), &spec("scrape headlines"), RiskLevel::Low);
        assert_eq!(d, GateDecision::Allow);
    }

    #[test]
    fn test_missing_permission_is_a_violation() {
        let (hook, _dir) = hook(&[], 30);
        match hook.evaluate(&entry(), &spec("scrape headlines"), RiskLevel::Low) {
            GateDecision::Deny { violation, reason } => {
                assert!(violation);
                assert!(reason.contains("net:read"));
            }
            other => panic!("expected Deny, got {other:?}"),
        }
    }

    #[test]
    fn test_budget_deny_is_not_a_violation() {
        let (hook, _dir) = hook(&["net:read"], 30);
        hook.escalation.record_cost(9.95);

        match hook.evaluate(&entry(), &spec("scrape headlines"), RiskLevel::Low) {
            GateDecision::Deny { violation, .. } => assert!(!violation),
            other => panic!("expected Deny, got {other:?}"),
        }
    }

    #[test]
    fn test_rate_window_denies_after_limit() {
        let (hook, _dir) = hook(&["net:read"], 2);
        let e = entry();
        let s = spec("scrape headlines");

        assert_eq!(hook.evaluate(&e, &s, RiskLevel::Low), GateDecision::Allow);
        assert_eq!(hook.evaluate(&e, &s, RiskLevel::Low), GateDecision::Allow);
        match hook.evaluate(&e, &s, RiskLevel::Low) {
            GateDecision::Deny { violation, reason } => {
                assert!(!violation);
                assert!(reason.contains("Rate limit"));
            }
            other => panic!("expected Deny, got {other:?}"),
        }
    }

    #[test]
    fn test_high_risk_requires_approval() {
        let (hook, _dir) = hook(&["net:read"], 30);
        let d = hook.evaluate(&entry(), &spec("run migration"), RiskLevel::High);
        assert_eq!(d, GateDecision::RequireApproval(RiskLevel::High));
    }

    #[test]
    fn test_costly_step_requires_approval() {
        let (hook, _dir) = hook(&["net:read"], 30);
        let costly = entry().with_cost(1.5);
        let d = hook.evaluate(&costly, &spec("scrape headlines"), RiskLevel::Low);
        assert_eq!(d, GateDecision::RequireApproval(RiskLevel::Medium));
    }

    #[test]
    fn test_destructive_wording_requires_approval() {
        let (hook, _dir) = hook(&["net:read"], 30);
        let d = hook.evaluate(&entry(), &spec("delete stale cache entries"), RiskLevel::Low);
        assert_eq!(d, GateDecision::RequireApproval(RiskLevel::Medium));
    }

    #[test]
    fn test_permission_check_precedes_approval_triggers() {
        let (hook, _dir) = hook(&[], 30);
        // High risk and missing permission: the violation wins
        match hook.evaluate(&entry(), &spec("drop schema"), RiskLevel::High) {
            GateDecision::Deny { violation, .. } => assert!(violation),
            other => panic!("expected Deny, got {other:?}"),
        }
    }
}

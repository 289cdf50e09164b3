//! Property-based tests for the SDK contract types

use proptest::prelude::*;
use sdk::types::{
    CapabilityInvocation, CapabilityOutcome, OutcomeStatus, RiskLevel, StepSpec,
};

fn risk_from_index(i: u8) -> RiskLevel {
    match i % 3 {
        0 => RiskLevel::Low,
        1 => RiskLevel::Medium,
        _ => RiskLevel::High,
    }
}

proptest! {
    /// Escalation never lowers risk and is capped at High
    #[test]
    fn escalate_is_monotonic(index in 0u8..3) {
        let risk = risk_from_index(index);
        let escalated = risk.escalate();
        prop_assert!(escalated >= risk);
        prop_assert_eq!(RiskLevel::High.escalate(), RiskLevel::High);
    }

    /// Invocations survive a JSON round trip byte-for-byte in meaning
    #[test]
    fn invocation_serde_round_trip(
        task_id in "task_[0-9]{1,3}",
        step_id in "step_[0-9]{1,3}",
        description in "[a-z ]{1,40}",
        value in "[a-z0-9]{1,20}",
    ) {
        let invocation = CapabilityInvocation::new(
            task_id,
            StepSpec::new(step_id, description).with_param("url", serde_json::json!(value)),
        );
        let text = serde_json::to_string(&invocation).unwrap();
        let parsed: CapabilityInvocation = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(parsed, invocation);
    }

    /// Outcome constructors keep status and payload consistent
    #[test]
    fn outcome_constructors_are_consistent(
        evidence in "[a-z ]{1,40}",
        error in "[a-z ]{1,40}",
        cost in 0.0f64..10.0,
    ) {
        let ok = CapabilityOutcome::success(evidence.clone()).with_cost(cost);
        prop_assert_eq!(ok.status, OutcomeStatus::Success);
        prop_assert_eq!(ok.evidence, evidence);
        prop_assert!(ok.error.is_none());

        let bad = CapabilityOutcome::failure(error.clone());
        prop_assert_eq!(bad.status, OutcomeStatus::Failure);
        prop_assert_eq!(bad.error.as_deref(), Some(error.as_str()));
        prop_assert!(bad.evidence.is_empty());
    }
}

//! Plan and step types
//!
//! A plan is an ordered decomposition of an intent into steps bound to
//! concrete capabilities. Plans are read-only once emitted: re-planning
//! creates a new plan, never mutates an existing one.

use chrono::{DateTime, Utc};
use sdk::types::RiskLevel;
use serde::Serialize;

/// One executable unit of a plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    /// Position in the plan; dependencies refer to these indices
    pub index: usize,
    pub id: String,
    pub description: String,
    /// The category tag this step was routed under
    pub category: String,
    /// Name of the capability bound to this step
    pub capability: String,
    pub risk_level: RiskLevel,
    /// Indices of steps that must be Completed first
    pub dependencies: Vec<usize>,
    pub expected_outcome: String,
}

/// An ordered, possibly partially parallel plan
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Deterministic id derived from the intent and step bindings
    pub id: String,
    pub intent: String,
    pub created_at: DateTime<Utc>,
    steps: Vec<Step>,
}

impl Plan {
    pub(crate) fn new(intent: impl Into<String>, steps: Vec<Step>) -> Self {
        let intent = intent.into();

        // The id is a stable function of the routing result, so identical
        // intent and registry snapshots produce identical plans
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        intent.hash(&mut hasher);
        for step in &steps {
            step.capability.hash(&mut hasher);
            step.category.hash(&mut hasher);
        }

        Self {
            id: format!("plan-{:016x}", hasher.finish()),
            intent,
            created_at: Utc::now(),
            steps,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps whose dependencies are all contained in `completed`
    pub fn ready_steps<'a>(&'a self, completed: &[usize]) -> Vec<&'a Step> {
        self.steps
            .iter()
            .filter(|s| !completed.contains(&s.index))
            .filter(|s| s.dependencies.iter().all(|d| completed.contains(d)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize, capability: &str, deps: Vec<usize>) -> Step {
        Step {
            index,
            id: format!("step_{}", index + 1),
            description: "test".to_string(),
            category: "execute".to_string(),
            capability: capability.to_string(),
            risk_level: RiskLevel::Low,
            dependencies: deps,
            expected_outcome: "done".to_string(),
        }
    }

    #[test]
    fn test_plan_id_deterministic() {
        let a = Plan::new("scrape bbc", vec![step(0, "web-scrape", vec![])]);
        let b = Plan::new("scrape bbc", vec![step(0, "web-scrape", vec![])]);
        assert_eq!(a.id, b.id);

        let c = Plan::new("scrape bbc", vec![step(0, "other-scraper", vec![])]);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_ready_steps_respects_dependencies() {
        let plan = Plan::new(
            "x",
            vec![
                step(0, "loader", vec![]),
                step(1, "runner", vec![0]),
                step(2, "verifier", vec![1]),
            ],
        );

        let ready = plan.ready_steps(&[]);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].index, 0);

        let ready = plan.ready_steps(&[0]);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].index, 1);

        let ready = plan.ready_steps(&[0, 1, 2]);
        assert!(ready.is_empty());
    }
}

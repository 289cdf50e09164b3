//! Capability invocation contract and registry types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Risk classification for a step or action.
///
/// `Low` runs unattended, `Medium` runs unattended but is surfaced in the
/// audit trail, `High` requires human approval before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Escalate to the next higher risk level (High stays High)
    pub fn escalate(&self) -> RiskLevel {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium | RiskLevel::High => RiskLevel::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of external collaborator behind a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Autonomous agent with its own reasoning loop
    Agent,
    /// Deterministic, single-purpose routine
    Skill,
    /// Bridge to an external service
    ExternalIntegration,
}

/// A capability as registered with the router.
///
/// `priority` breaks competition between capabilities sharing a category tag;
/// `requirements` name the tools or integrations that must be available
/// before the capability is considered satisfiable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub kind: CapabilityKind,
    pub category_tags: Vec<String>,
    pub priority: i32,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub estimated_cost: f64,
}

impl RegistryEntry {
    /// Create an entry with no requirements or permissions
    pub fn new(name: impl Into<String>, kind: CapabilityKind, tags: &[&str], priority: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            category_tags: tags.iter().map(|t| t.to_string()).collect(),
            priority,
            requirements: Vec::new(),
            required_permissions: Vec::new(),
            estimated_cost: 0.0,
        }
    }

    /// Add requirements that must be satisfiable at routing time
    pub fn with_requirements(mut self, requirements: &[&str]) -> Self {
        self.requirements = requirements.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Add permissions the session must hold before execution
    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.required_permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set the estimated cost per invocation
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.category_tags.iter().any(|t| t == tag)
    }
}

/// The step specification handed to a capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_id: String,
    pub description: String,
    pub category: String,
    pub expected_outcome: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl StepSpec {
    pub fn new(step_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            description: description.into(),
            category: String::new(),
            expected_outcome: String::new(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Get a string parameter, if present
    pub fn param_str(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}

/// Input to a capability invocation: `{task_id, step_spec}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInvocation {
    pub task_id: String,
    pub step_spec: StepSpec,
}

impl CapabilityInvocation {
    pub fn new(task_id: impl Into<String>, step_spec: StepSpec) -> Self {
        Self {
            task_id: task_id.into(),
            step_spec,
        }
    }
}

/// Terminal status of a capability invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Output of a capability invocation: `{status, evidence, artifacts, cost}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutcome {
    pub status: OutcomeStatus,
    /// Proof of what was done. Required non-empty on success.
    pub evidence: String,
    /// References to produced artifacts (paths, URLs, record ids)
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Cost incurred by this invocation, in session budget units
    #[serde(default)]
    pub cost: f64,
    /// Failure detail, set when status is Failure
    #[serde(default)]
    pub error: Option<String>,
}

impl CapabilityOutcome {
    /// A successful outcome carrying evidence
    pub fn success(evidence: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            evidence: evidence.into(),
            artifacts: Vec::new(),
            cost: 0.0,
            error: None,
        }
    }

    /// A failed outcome carrying the error detail
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            evidence: String::new(),
            artifacts: Vec::new(),
            cost: 0.0,
            error: Some(error.into()),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_artifacts(mut self, artifacts: &[&str]) -> Self {
        self.artifacts = artifacts.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

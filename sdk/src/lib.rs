//! Foreman SDK
//!
//! Shared library providing the capability contract, registry types, and
//! error taxonomy for Foreman components. This crate is used by the engine
//! and by capability authors.

/// Capability trait
pub mod capability;

/// Error types and handling
pub mod errors;

/// Invocation contract and registry types
pub mod types;

// Re-export commonly used types
pub use capability::Capability;
pub use errors::{ControllerError, ForemanErrorExt};
pub use types::{
    CapabilityInvocation, CapabilityKind, CapabilityOutcome, OutcomeStatus, RegistryEntry,
    RiskLevel, StepSpec,
};

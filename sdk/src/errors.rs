//! Error types and handling
//!
//! This module provides the error types used throughout the Foreman controller.
//! All errors implement the `ForemanErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Propagation policy
//!
//! - `Conflict` and transient capability failures are retried locally with
//!   backoff, up to the per-task retry cap.
//! - `MissingCapability` and `PermissionDenied` surface immediately and are
//!   never silently bypassed.
//! - `RemediationExhausted` always routes to escalation and
//!   `FatalLimitReached` always routes to limit termination, never back to
//!   a plain continue.

use thiserror::Error;

/// Trait for Foreman error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All controller errors implement it.
pub trait ForemanErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors end the session or require human intervention.
    fn is_recoverable(&self) -> bool;
}

/// Main controller error type
///
/// Each variant carries the context a caller needs to decide between retry,
/// escalation, and termination. No variant exposes secrets or internal paths.
#[derive(Debug, Error)]
pub enum ControllerError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Ledger errors
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Evidence is required to mark task {0} completed")]
    MissingEvidence(String),

    #[error("A reason is required to mark task {0} blocked")]
    MissingBlockedReason(String),

    #[error("Conflicting write to task {task_id}: expected version {expected}, found {actual}")]
    Conflict {
        task_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Ledger document parse error: {0}")]
    DocumentParse(String),

    // Router errors
    #[error("No satisfiable capability for tag: {0}")]
    MissingCapability(String),

    // Hook pipeline errors
    #[error("Permission denied for {capability}: missing {permission}")]
    PermissionDenied {
        capability: String,
        permission: String,
    },

    #[error("Budget exceeded: spent {spent:.2} + estimate {estimate:.2} > cap {cap:.2}")]
    BudgetExceeded {
        spent: f64,
        estimate: f64,
        cap: f64,
    },

    #[error("Rate limit exceeded for {capability}: {count}/{limit} calls in {window_secs}s")]
    RateLimitExceeded {
        capability: String,
        count: u32,
        limit: u32,
        window_secs: u64,
    },

    // Escalation errors
    #[error("Approval request {0} timed out")]
    ApprovalTimeout(String),

    #[error("Approval request not found: {0}")]
    ApprovalNotFound(String),

    #[error("Approval request {id} already resolved: {status}")]
    ApprovalAlreadyResolved { id: String, status: String },

    #[error("Remediation exhausted for task {task_id} after {retries} retries")]
    RemediationExhausted { task_id: String, retries: u32 },

    #[error("Fatal limit reached: {0}")]
    FatalLimitReached(String),

    // Capability execution errors
    #[error("Capability {name} failed: {message}")]
    CapabilityFailed { name: String, message: String },

    #[error("Step timeout after {0}s")]
    StepTimeout(u64),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanErrorExt for ControllerError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::InvalidTransition { .. } => "Task is not in a state that allows this update",
            Self::MissingEvidence(_) => "Attach evidence before completing a task",
            Self::MissingBlockedReason(_) => "State why the task is blocked",
            Self::Conflict { .. } => "Another writer updated this task. Re-read and retry",
            Self::TaskNotFound(_) => "The task id is not in the ledger",
            Self::DocumentParse(_) => "The ledger file is malformed. Fix it by hand or recreate",

            Self::MissingCapability(_) => {
                "No registered capability can handle this. Provision one or escalate"
            }

            Self::PermissionDenied { .. } => "This session lacks the required permission",
            Self::BudgetExceeded { .. } => "Session budget exhausted. Raise the cap or stop",
            Self::RateLimitExceeded { .. } => {
                "Rate limit exceeded. Please wait before trying again"
            }

            Self::ApprovalTimeout(_) => "Nobody answered the approval request in time",
            Self::ApprovalNotFound(_) => "Unknown approval request id",
            Self::ApprovalAlreadyResolved { .. } => "This approval was already decided",
            Self::RemediationExhausted { .. } => {
                "Automatic retries are exhausted. A human must take over"
            }
            Self::FatalLimitReached(_) => "A hard session limit was hit. The session ended",

            Self::CapabilityFailed { .. } => "The external capability reported a failure",
            Self::StepTimeout(_) => "The step took too long. It may be retried",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable: these must end automatic execution
            Self::PermissionDenied { .. }
            | Self::RemediationExhausted { .. }
            | Self::FatalLimitReached(_)
            | Self::MissingCapability(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

//! Hook Pipeline
//!
//! Two interception points wrap every capability invocation:
//!
//! - Pre-step: permission, budget, and rate-limit gating. Emits Allow, Deny
//!   with a reason, or RequireApproval with a risk level. A Deny for a
//!   missing permission is a security violation and fatal for the session.
//! - Post-step: verifies the outcome, classifies failures, and applies the
//!   ledger write. Writes are idempotent; a redelivered outcome never records
//!   cost or evidence twice.
//!
//! Capabilities never write the ledger directly; the post-step hook is the
//! only writer on the execution path.

pub mod post_step;
pub mod pre_step;

pub use post_step::{PostStepHook, StepDisposition};
pub use pre_step::{GateDecision, PreStepHook};

//! Foreman Engine Library
//!
//! This library provides the core functionality of the Foreman controller.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Append-only audit trail
pub mod audit;

/// Task ledger and its persisted document form
pub mod ledger;

/// Capability router and plan types
pub mod router;

/// Pre-step and post-step hook pipeline
pub mod hooks;

/// Stop decision engine and remediation catalog
pub mod decision;

/// Escalation, limits, and approval lifecycle
pub mod escalation;

/// Key-value memory with lifetimes
pub mod memory;

/// The session controller loop
pub mod controller;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

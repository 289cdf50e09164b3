//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: execute a session for an intent, resolving approvals interactively
//! - status: show the persisted task ledger
//! - history: show the last N audit trail events

use anyhow::{Context, Result};
use serde_json::json;
use std::io::Write;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::controller::Controller;
use crate::decision::Verdict;
use crate::ledger::document::LedgerDocument;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Run a session for an intent
///
/// Raised approval requests are resolved at the terminal, or granted
/// automatically when `approve_all` is set. The loop resumes after each
/// resolution until the decision engine terminates the session.
pub async fn handle_run(
    intent: String,
    approve_all: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let controller = Controller::new(config.clone()).context("Failed to build controller")?;

    let mut report = controller
        .run(&intent)
        .await
        .context("Session failed to run")?;

    while report.verdict == Verdict::Escalate && report.reason == "awaiting_approval" {
        let mut any_resolved = false;
        for request in &report.pending_approvals {
            let approved = if approve_all {
                true
            } else {
                prompt_approval(&request.action_description, request.risk_level.as_str())?
            };
            controller
                .escalation()
                .resolve_approval(&request.id, approved, "cli")
                .context("Failed to resolve approval")?;
            any_resolved = true;
        }
        if !any_resolved {
            break;
        }
        report = controller.resume().await.context("Session failed to resume")?;
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("Session:    {}", report.session_id);
            println!("Verdict:    {} ({})", report.verdict.as_str(), report.reason);
            println!("Iterations: {}", report.iterations);
            println!("Budget:     {:.2}", report.budget_spent);
            println!();
            for task in controller.ledger().snapshot() {
                println!("{} {}: {}", task.status.marker(), task.id, task.description);
                if let Some(evidence) = &task.evidence {
                    println!("    Evidence: {}", evidence);
                }
                if let Some(reason) = &task.blocked_reason {
                    println!("    Blocked: {}", reason);
                }
            }
        }
    }

    Ok(())
}

/// Ask the operator to approve or reject one action
fn prompt_approval(description: &str, risk: &str) -> Result<bool> {
    print!("Approve \"{}\" (risk: {})? [y/N] ", description, risk);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Show the persisted task ledger
pub fn handle_status(config: &Config, format: OutputFormat) -> Result<()> {
    let path = config.ledger_path();
    if !path.exists() {
        match format {
            OutputFormat::Json => println!("{}", json!({"tasks": []})),
            OutputFormat::Text => println!("No ledger found. Run an intent first."),
        }
        return Ok(());
    }

    let text = std::fs::read_to_string(&path).context("Failed to read ledger")?;
    match format {
        OutputFormat::Json => {
            let doc = LedgerDocument::parse(&text).context("Failed to parse ledger")?;
            let tasks: Vec<_> = doc
                .tasks
                .iter()
                .map(|t| {
                    json!({
                        "id": t.id,
                        "description": t.description,
                        "status": t.status.as_str(),
                        "evidence": t.evidence,
                        "blocked_reason": t.blocked_reason,
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "session_id": doc.session_id,
                    "tasks": tasks,
                }))?
            );
        }
        OutputFormat::Text => print!("{}", text),
    }

    Ok(())
}

/// Show the last N audit trail events
pub fn handle_history(limit: usize, config: &Config, format: OutputFormat) -> Result<()> {
    let path = config.audit_path();
    if !path.exists() {
        match format {
            OutputFormat::Json => println!("{}", json!({"events": []})),
            OutputFormat::Text => println!("No audit trail found."),
        }
        return Ok(());
    }

    let log = AuditLog::open(&path).context("Failed to open audit trail")?;
    let events = log.recent(limit).context("Failed to read audit trail")?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        OutputFormat::Text => {
            for event in events {
                let marker = if event.success { "ok " } else { "ERR" };
                println!(
                    "{} {} [{}] {}",
                    event.event_id,
                    event.timestamp.to_rfc3339(),
                    marker,
                    event.action
                );
            }
        }
    }

    Ok(())
}

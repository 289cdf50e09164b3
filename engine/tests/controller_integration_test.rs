//! Controller integration tests
//!
//! Full sessions through the public API: routing, ledger materialization,
//! hook gating, approvals, and the stop decision engine, with real files
//! under a temporary data directory.

use async_trait::async_trait;
use foreman_engine::audit::AuditKind;
use foreman_engine::config::Config;
use foreman_engine::controller::Controller;
use foreman_engine::decision::Verdict;
use foreman_engine::ledger::document::LedgerDocument;
use foreman_engine::ledger::TaskStatus;
use sdk::capability::Capability;
use sdk::errors::ControllerError;
use sdk::types::{CapabilityInvocation, CapabilityKind, CapabilityOutcome, RegistryEntry};
use std::sync::Arc;

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default_config();
    config.core.data_dir = dir.path().to_path_buf();
    config
}

struct Scripted {
    name: &'static str,
    outcome: CapabilityOutcome,
}

impl Scripted {
    fn succeeding(name: &'static str, evidence: &str) -> Self {
        Self {
            name,
            outcome: CapabilityOutcome::success(evidence).with_cost(0.1),
        }
    }
}

#[async_trait]
impl Capability for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Skill
    }

    async fn execute(
        &self,
        _invocation: CapabilityInvocation,
    ) -> Result<CapabilityOutcome, ControllerError> {
        Ok(self.outcome.clone())
    }
}

#[tokio::test]
async fn test_scrape_session_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut controller = Controller::new(test_config(&dir)).unwrap();
    controller.register_capability(
        RegistryEntry::new("web-scrape", CapabilityKind::Skill, &["scrape"], 10),
        Arc::new(Scripted::succeeding("web-scrape", "5 headlines extracted")),
    );

    let report = controller
        .run("scrape the top headlines from bbc.com")
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::TerminateSuccess);
    assert_eq!(report.reason, "all_tests_passed");
    assert!(report.pending_approvals.is_empty());

    // The persisted document has three completed tasks and round-trips
    let text = std::fs::read_to_string(dir.path().join("to-do.md")).unwrap();
    let doc = LedgerDocument::parse(&text).unwrap();
    assert_eq!(doc.tasks.len(), 3);
    assert!(doc.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert!(doc
        .tasks
        .iter()
        .any(|t| t.evidence.as_deref() == Some("5 headlines extracted")));
    assert_eq!(LedgerDocument::parse(&doc.serialize()).unwrap(), doc);

    // The audit trail covers the session lifecycle
    let events = controller
        .audit()
        .events_for_session(controller.session_id())
        .unwrap();
    let kinds: Vec<AuditKind> = events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&AuditKind::SessionStart));
    assert!(kinds.contains(&AuditKind::PlanCreated));
    assert!(kinds.contains(&AuditKind::StepExecution));
    assert!(kinds.contains(&AuditKind::TaskUpdate));
    assert!(kinds.contains(&AuditKind::SessionEnd));
}

#[tokio::test]
async fn test_independent_step_runs_while_approval_pends() {
    let dir = tempfile::tempdir().unwrap();
    let mut controller = Controller::new(test_config(&dir)).unwrap();
    controller.register_capability(
        RegistryEntry::new("web-scrape", CapabilityKind::Skill, &["scrape"], 10),
        Arc::new(Scripted::succeeding("web-scrape", "5 headlines extracted")),
    );
    controller.register_capability(
        RegistryEntry::new("deployer", CapabilityKind::ExternalIntegration, &["deploy"], 10),
        Arc::new(Scripted::succeeding("deployer", "release rolled out")),
    );

    let report = controller
        .run("scrape headlines and deploy the release")
        .await
        .unwrap();
    assert_eq!(report.verdict, Verdict::Escalate);
    assert_eq!(report.reason, "awaiting_approval");
    assert_eq!(report.pending_approvals.len(), 1);

    // The scrape step did not wait on the deploy approval
    let tasks = controller.ledger().snapshot();
    let scrape = tasks.iter().find(|t| t.category == "scrape").unwrap();
    let deploy = tasks.iter().find(|t| t.category == "deploy").unwrap();
    assert_eq!(scrape.status, TaskStatus::Completed);
    assert_eq!(deploy.status, TaskStatus::Pending);

    // Approving unblocks the rest of the plan
    let approval_id = report.pending_approvals[0].id.clone();
    controller
        .escalation()
        .resolve_approval(&approval_id, true, "operator")
        .unwrap();
    let report = controller.resume().await.unwrap();
    assert_eq!(report.verdict, Verdict::TerminateSuccess);
}

#[tokio::test]
async fn test_approval_timeout_escalates_without_consent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.approval.timeout_secs = 0;

    let mut controller = Controller::new(config).unwrap();
    controller.register_capability(
        RegistryEntry::new("db-admin", CapabilityKind::ExternalIntegration, &["database"], 10),
        Arc::new(Scripted::succeeding("db-admin", "migration applied")),
    );

    let report = controller.run("run the database migration").await.unwrap();
    assert_eq!(report.verdict, Verdict::Escalate);
    assert_eq!(report.reason, "approval_timeout");

    // The gated step never executed
    let task = controller
        .ledger()
        .snapshot()
        .into_iter()
        .find(|t| t.category == "database")
        .unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(task.blocked_reason.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_budget_gate_refuses_overweight_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.session.budget_cap = 1.0;
    // Keep the cost threshold above the cap so the budget check fires before
    // the approval trigger
    config.approval.cost_threshold = 100.0;

    let mut controller = Controller::new(config).unwrap();
    controller.register_capability(
        RegistryEntry::new("web-scrape", CapabilityKind::Skill, &["scrape"], 10).with_cost(5.0),
        Arc::new(Scripted::succeeding("web-scrape", "5 headlines extracted")),
    );

    let report = controller.run("scrape headlines from bbc.com").await.unwrap();
    assert_eq!(report.verdict, Verdict::Escalate);

    let task = controller
        .ledger()
        .snapshot()
        .into_iter()
        .find(|t| t.category == "scrape")
        .unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(task
        .blocked_reason
        .as_deref()
        .unwrap()
        .contains("Budget exceeded"));
}

#[tokio::test]
async fn test_session_memory_cleared_on_terminal_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let controller = Controller::new(config).unwrap();
    controller
        .memory()
        .put(
            foreman_engine::memory::MemoryKind::Session,
            "scratch",
            "value",
        )
        .unwrap();

    let report = controller.run("tidy up the workshop").await.unwrap();
    assert_eq!(report.verdict, Verdict::TerminateSuccess);
    assert_eq!(
        controller
            .memory()
            .get(foreman_engine::memory::MemoryKind::Session, "scratch"),
        None
    );
}

//! Controller loop
//!
//! Owns a session end to end: route the intent into a plan, materialize the
//! plan as ledger tasks, then iterate. Each iteration executes every ready
//! step (dependencies complete, not suspended on approval) in parallel
//! through the hook pipeline, then consults the stop decision engine.
//!
//! Steps gated on approval suspend only their dependents; independent steps
//! keep executing unless `all_blocking_approval` is set. When nothing can run
//! without a pending approval the loop escalates to a human and `resume`
//! re-enters after the approval is resolved.
//!
//! Cancellation is cooperative: in-flight steps get a bounded grace period,
//! then remaining work is aborted, interrupted tasks are marked blocked, and
//! the audit trail is flushed before the loop returns.

pub mod local;

use crate::audit::{AuditEvent, AuditKind, AuditLog};
use crate::config::Config;
use crate::decision::{Decision, StopDecisionEngine, RemediationCatalog, Verdict};
use crate::escalation::{ApprovalRequest, ApprovalStatus, EscalationManager, SessionLimits};
use crate::hooks::{GateDecision, PostStepHook, PreStepHook};
use crate::ledger::{TaskLedger, TaskSpec, TaskStatus};
use crate::memory::MemoryStore;
use crate::router::{CapabilityRegistry, Plan, Router, Step, TAG_VERIFY_COMPLETION};
use sdk::capability::Capability;
use sdk::errors::ControllerError;
use sdk::types::{CapabilityInvocation, CapabilityOutcome, RiskLevel, StepSpec};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Bounded CAS retries for controller-side ledger writes
const MAX_WRITE_RETRIES: u32 = 3;

/// Final report of a session run
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub verdict: Verdict,
    pub reason: String,
    pub iterations: u32,
    pub budget_spent: f64,
    pub pending_approvals: Vec<ApprovalRequest>,
}

struct RunState {
    plan: Option<Plan>,
    /// Ledger task id for each plan step, indexed by step index
    task_ids: Vec<String>,
    /// Steps suspended on an approval: step index -> approval id
    suspended: HashMap<usize, String>,
    /// Steps whose approval was granted; the gate's approval trigger is
    /// satisfied for these
    approved: HashSet<usize>,
}

/// The session controller
pub struct Controller {
    session_id: String,
    config: Config,
    router: Router,
    registry: CapabilityRegistry,
    capabilities: HashMap<String, Arc<dyn Capability>>,
    ledger: Arc<TaskLedger>,
    audit: Arc<AuditLog>,
    escalation: Arc<EscalationManager>,
    memory: Arc<MemoryStore>,
    pre_step: PreStepHook,
    post_step: PostStepHook,
    decision: StopDecisionEngine,
    cancel_tx: watch::Sender<bool>,
    state: Mutex<RunState>,
}

impl Controller {
    /// Build a controller from configuration. Opens the audit trail and the
    /// memory store under the data directory and registers the built-in
    /// capabilities.
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        let session_id = format!("session-{}", Uuid::new_v4());

        let audit = Arc::new(AuditLog::open(&config.audit_path())?);
        let memory = Arc::new(MemoryStore::open(&config.memory_path())?);

        let limits = SessionLimits {
            max_iterations: config.session.max_iterations,
            max_time: config.max_time(),
            budget_cap: config.session.budget_cap,
            retry_cap: config.session.retry_cap,
            approval_timeout: Duration::from_secs(config.approval.timeout_secs),
        };
        let escalation = Arc::new(EscalationManager::new(
            &session_id,
            limits,
            Arc::clone(&audit),
        ));

        let pre_step = PreStepHook::new(
            &[],
            config.hooks.rate_limit_max_calls,
            Duration::from_secs(config.hooks.rate_limit_window_secs),
            config.approval.cost_threshold,
            Arc::clone(&escalation),
        );
        let post_step = PostStepHook::new(&session_id, Arc::clone(&audit), Arc::clone(&escalation));
        let decision = StopDecisionEngine::new(
            config.session.retry_cap,
            RemediationCatalog::with_defaults(),
        );

        let mut registry = CapabilityRegistry::new();
        local::register_builtins(&mut registry);

        let mut capabilities: HashMap<String, Arc<dyn Capability>> = HashMap::new();
        capabilities.insert("context-loader".to_string(), Arc::new(local::ContextLoader));
        capabilities.insert("task-runner".to_string(), Arc::new(local::TaskRunner));
        capabilities.insert("verifier".to_string(), Arc::new(local::Verifier));

        let (cancel_tx, _) = watch::channel(false);

        Ok(Self {
            ledger: Arc::new(TaskLedger::new(&session_id)),
            session_id,
            config,
            router: Router::new(),
            registry,
            capabilities,
            audit,
            escalation,
            memory,
            pre_step,
            post_step,
            decision,
            cancel_tx,
            state: Mutex::new(RunState {
                plan: None,
                task_ids: Vec::new(),
                suspended: HashMap::new(),
                approved: HashSet::new(),
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn escalation(&self) -> &EscalationManager {
        &self.escalation
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Register a capability and its routing entry
    pub fn register_capability(
        &mut self,
        entry: sdk::types::RegistryEntry,
        capability: Arc<dyn Capability>,
    ) {
        self.capabilities.insert(entry.name.clone(), capability);
        self.registry.register(entry);
    }

    /// Mark a routing requirement as available
    pub fn mark_requirement_available(&mut self, requirement: &str) {
        self.registry.mark_requirement_available(requirement);
    }

    /// Grant a permission to this session
    pub fn grant_permission(&mut self, permission: &str) {
        self.pre_step.grant_permission(permission);
    }

    /// Request cooperative cancellation of a running session
    pub fn cancel(&self) {
        // send_replace stores the flag even when no receiver is subscribed
        // yet; the loop also polls it directly between iterations
        self.cancel_tx.send_replace(true);
    }

    /// Run a session for the given intent until the decision engine stops it
    pub async fn run(&self, intent: &str) -> Result<SessionReport, ControllerError> {
        self.audit.append(AuditEvent::new(
            AuditKind::SessionStart,
            &self.session_id,
            "session started",
        ))?;
        self.audit.append(
            AuditEvent::new(AuditKind::IntentReceived, &self.session_id, intent)
                .with_details(json!({"intent": intent})),
        )?;

        let plan = self.router.route(intent, &self.registry)?;
        self.audit.append(
            AuditEvent::new(AuditKind::PlanCreated, &self.session_id, "plan created")
                .with_details(json!({
                    "plan_id": plan.id,
                    "steps": plan.len(),
                })),
        )?;

        // Materialize one ledger task per step, dependencies included
        let mut task_ids: Vec<String> = Vec::with_capacity(plan.len());
        for step in plan.steps() {
            let deps = step
                .dependencies
                .iter()
                .map(|i| task_ids[*i].clone())
                .collect();
            let id = self.ledger.create_task(
                TaskSpec::new(&step.description, &step.category).with_dependencies(deps),
            );
            task_ids.push(id);
        }

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.plan = Some(plan);
            state.task_ids = task_ids;
            state.suspended.clear();
            state.approved.clear();
        }

        self.run_loop().await
    }

    /// Re-enter the loop after pending approvals were resolved
    pub async fn resume(&self) -> Result<SessionReport, ControllerError> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.plan.is_none() {
                return Err(ControllerError::Config(
                    "no session to resume; run an intent first".to_string(),
                ));
            }
        }
        self.run_loop().await
    }

    async fn run_loop(&self) -> Result<SessionReport, ControllerError> {
        loop {
            if *self.cancel_tx.borrow() {
                return self.finish_cancelled().await;
            }

            self.escalation.sweep_timeouts()?;
            if let Some(report) = self.settle_approvals()? {
                return Ok(report);
            }

            let (ready, suspended_count) = self.ready_steps();
            if ready.is_empty() && suspended_count > 0 {
                return self.finish(Verdict::Escalate, "awaiting_approval");
            }

            if !ready.is_empty() {
                let cancelled = self.execute_batch(ready).await?;
                if cancelled {
                    return self.finish_cancelled().await;
                }
            }

            self.escalation.record_iteration();
            let decision = self.decide();
            self.audit.append(
                AuditEvent::new(AuditKind::HookDecision, &self.session_id, "stop decision")
                    .with_details(json!({
                        "verdict": decision.verdict.as_str(),
                        "reason": decision.reason,
                    })),
            )?;

            match decision.verdict {
                Verdict::Continue => {
                    if let Some(remediation) = &decision.remediation {
                        tracing::info!(
                            pattern = %remediation.pattern,
                            fix = %remediation.fix,
                            "applying cataloged remediation before retry"
                        );
                        self.memory
                            .record_known_fix(&remediation.pattern, &remediation.fix)?;
                    }
                    // A stalled loop with nothing runnable cannot make
                    // progress; hand it to a human instead of spinning
                    let (ready, suspended_count) = self.ready_steps();
                    if ready.is_empty() && suspended_count == 0 && !self.ledger.all_complete() {
                        return self.finish(Verdict::Escalate, "no_ready_steps");
                    }
                }
                verdict => return self.finish(verdict, &decision.reason),
            }
        }
    }

    /// Apply resolved approvals to suspended steps. Returns a report when a
    /// rejection or timeout ends the run.
    fn settle_approvals(&self) -> Result<Option<SessionReport>, ControllerError> {
        let suspended: Vec<(usize, String)> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.suspended.iter().map(|(i, id)| (*i, id.clone())).collect()
        };

        for (index, approval_id) in suspended {
            let Some(request) = self.escalation.get_approval(&approval_id) else {
                continue;
            };
            match request.status {
                ApprovalStatus::Pending => {}
                ApprovalStatus::Approved => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.suspended.remove(&index);
                    state.approved.insert(index);
                }
                ApprovalStatus::Rejected => {
                    self.block_step(index, "approval rejected")?;
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.suspended.remove(&index);
                    }
                    return self.finish(Verdict::Escalate, "approval_rejected").map(Some);
                }
                ApprovalStatus::TimedOut => {
                    let reason = ControllerError::ApprovalTimeout(approval_id.clone()).to_string();
                    self.block_step(index, &reason)?;
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.suspended.remove(&index);
                    }
                    return self.finish(Verdict::Escalate, "approval_timeout").map(Some);
                }
            }
        }
        Ok(None)
    }

    /// Steps runnable this iteration and the number still suspended
    fn ready_steps(&self) -> (Vec<Step>, usize) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(plan) = &state.plan else {
            return (Vec::new(), 0);
        };

        let completed: Vec<usize> = state
            .task_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| {
                self.ledger
                    .get(id)
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();

        let suspended_count = state.suspended.len();
        if self.config.session.all_blocking_approval && suspended_count > 0 {
            return (Vec::new(), suspended_count);
        }

        let ready = plan
            .ready_steps(&completed)
            .into_iter()
            .filter(|s| !state.suspended.contains_key(&s.index))
            .cloned()
            .collect();
        (ready, suspended_count)
    }

    /// Execute one batch of ready steps in parallel. Returns true when the
    /// batch was interrupted by cancellation.
    async fn execute_batch(&self, ready: Vec<Step>) -> Result<bool, ControllerError> {
        // Gate the whole batch before dispatching anything, so an approval
        // raised by a later step can still hold back steps that gated clean
        let mut launches: Vec<(Step, String, StepSpec, Arc<dyn Capability>)> = Vec::new();
        let mut raised_approval = false;

        for step in ready {
            let task_id = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.task_ids[step.index].clone()
            };

            let Some(entry) = self.registry.get(&step.capability).cloned() else {
                return Err(ControllerError::MissingCapability(step.category.clone()));
            };

            let spec = StepSpec {
                step_id: step.id.clone(),
                description: step.description.clone(),
                category: step.category.clone(),
                expected_outcome: step.expected_outcome.clone(),
                params: HashMap::new(),
            };

            let already_approved = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.approved.contains(&step.index)
            };

            match self.pre_step.evaluate(&entry, &spec, step.risk_level) {
                GateDecision::Allow => {}
                GateDecision::RequireApproval(_) if already_approved => {}
                GateDecision::Deny { reason, violation } => {
                    self.mark_in_progress(&task_id)?;
                    self.block_task(&task_id, &reason)?;
                    if violation {
                        self.escalation.record_violation(&task_id, &reason)?;
                    } else {
                        self.escalation
                            .record_task_failure(&task_id, &reason, step.risk_level)?;
                        self.memory.record_failure(&reason)?;
                    }
                    continue;
                }
                GateDecision::RequireApproval(risk) => {
                    let request = self.escalation.raise_approval(&step.description, risk)?;
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.suspended.insert(step.index, request.id);
                    raised_approval = true;
                    continue;
                }
            }

            let Some(capability) = self.capabilities.get(&step.capability).cloned() else {
                return Err(ControllerError::MissingCapability(step.category.clone()));
            };
            launches.push((step, task_id, spec, capability));
        }

        if raised_approval && self.config.session.all_blocking_approval {
            // Whole-session suspension: undispatched steps stay Pending
            // until the approval resolves
            return Ok(false);
        }

        let mut set: JoinSet<(
            String,
            String,
            String,
            RiskLevel,
            Result<Result<CapabilityOutcome, ControllerError>, tokio::time::error::Elapsed>,
        )> = JoinSet::new();

        for (step, task_id, spec, capability) in launches {
            self.mark_in_progress(&task_id)?;
            self.audit.append(
                AuditEvent::new(AuditKind::StepExecution, &self.session_id, &step.description)
                    .with_task(&task_id)
                    .with_details(json!({
                        "step_id": step.id,
                        "capability": step.capability,
                        "risk_level": step.risk_level.as_str(),
                    })),
            )?;

            let invocation = CapabilityInvocation::new(&task_id, spec);
            let timeout = self.config.step_timeout();
            let risk = step.risk_level;
            let name = step.capability.clone();
            // Each execution is a distinct attempt; the post-step hook keys
            // its idempotence guard on this id
            let attempt_id = Uuid::new_v4().to_string();
            set.spawn(async move {
                let result = tokio::time::timeout(timeout, capability.execute(invocation)).await;
                (task_id, attempt_id, name, risk, result)
            });
        }

        let mut cancel_rx = self.cancel_tx.subscribe();
        if *cancel_rx.borrow() {
            // A cancel that landed before we subscribed must still fire
            cancel_rx.mark_changed();
        }
        let grace = Duration::from_secs(self.config.session.cancel_grace_secs);

        loop {
            tokio::select! {
                joined = set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok((task_id, attempt_id, name, risk, result))) => {
                            self.apply_result(&task_id, &attempt_id, &name, risk, result)?;
                        }
                        Some(Err(join_err)) => {
                            tracing::warn!(error = %join_err, "step task aborted unexpectedly");
                        }
                    }
                }
                _ = cancel_rx.changed() => {
                    // Bounded grace for in-flight steps, then abort the rest
                    let drain = async {
                        while let Some(joined) = set.join_next().await {
                            if let Ok((task_id, attempt_id, name, risk, result)) = joined {
                                self.apply_result(&task_id, &attempt_id, &name, risk, result)?;
                            }
                        }
                        Ok::<(), ControllerError>(())
                    };
                    let _ = tokio::time::timeout(grace, drain).await;
                    set.abort_all();
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Normalize an execution result into an outcome and push it through the
    /// post-step hook.
    fn apply_result(
        &self,
        task_id: &str,
        attempt_id: &str,
        capability: &str,
        risk: RiskLevel,
        result: Result<Result<CapabilityOutcome, ControllerError>, tokio::time::error::Elapsed>,
    ) -> Result<(), ControllerError> {
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => CapabilityOutcome::failure(
                ControllerError::CapabilityFailed {
                    name: capability.to_string(),
                    message: err.to_string(),
                }
                .to_string(),
            ),
            Err(_) => CapabilityOutcome::failure(
                ControllerError::StepTimeout(self.config.session.step_timeout_secs).to_string(),
            ),
        };

        match self.post_step.apply(&self.ledger, task_id, attempt_id, &outcome)? {
            crate::hooks::StepDisposition::Completed(_) => {
                self.escalation.clear_task_failure(task_id);
            }
            crate::hooks::StepDisposition::Failed { message, .. } => {
                self.escalation.record_task_failure(task_id, &message, risk)?;
                self.memory.record_failure(&message)?;
            }
            crate::hooks::StepDisposition::Duplicate(_) => {}
        }
        Ok(())
    }

    fn decide(&self) -> Decision {
        let tasks = self.ledger.snapshot();
        let session = self.escalation.snapshot();
        let last_failure = self.escalation.last_failure();

        let verify: Vec<_> = tasks
            .iter()
            .filter(|t| t.category == TAG_VERIFY_COMPLETION)
            .collect();
        let tests_passing = if verify.is_empty() {
            tasks.iter().all(|t| t.status == TaskStatus::Completed)
        } else {
            verify.iter().all(|t| t.status == TaskStatus::Completed)
        };

        self.decision
            .decide(&tasks, &session, last_failure.as_ref(), tests_passing)
    }

    /// CAS helper: move a task to InProgress (first run or retry)
    fn mark_in_progress(&self, task_id: &str) -> Result<(), ControllerError> {
        let mut attempt = 0;
        loop {
            let task = self.ledger.get(task_id)?;
            if task.status == TaskStatus::InProgress {
                return Ok(());
            }
            match self
                .ledger
                .update_status(task_id, TaskStatus::InProgress, None, None, task.version)
            {
                Ok(_) => return Ok(()),
                Err(ControllerError::Conflict { .. }) if attempt < MAX_WRITE_RETRIES => {
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// CAS helper: block a task with a reason
    fn block_task(&self, task_id: &str, reason: &str) -> Result<(), ControllerError> {
        let mut attempt = 0;
        loop {
            let task = self.ledger.get(task_id)?;
            if task.status == TaskStatus::Blocked {
                return Ok(());
            }
            match self.ledger.update_status(
                task_id,
                TaskStatus::Blocked,
                None,
                Some(reason),
                task.version,
            ) {
                Ok(_) => return Ok(()),
                Err(ControllerError::Conflict { .. }) if attempt < MAX_WRITE_RETRIES => {
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Block the task behind a plan step, moving it through InProgress if it
    /// never started
    fn block_step(&self, index: usize, reason: &str) -> Result<(), ControllerError> {
        let task_id = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.task_ids.get(index).cloned()
        };
        if let Some(task_id) = task_id {
            self.mark_in_progress(&task_id)?;
            self.block_task(&task_id, reason)?;
        }
        Ok(())
    }

    async fn finish_cancelled(&self) -> Result<SessionReport, ControllerError> {
        // Interrupted work is marked blocked so the ledger tells the truth
        for task in self.ledger.snapshot() {
            if task.status == TaskStatus::InProgress {
                self.block_task(&task.id, "cancelled")?;
            }
        }
        self.finish(Verdict::TerminateLimit, "cancelled")
    }

    fn finish(&self, verdict: Verdict, reason: &str) -> Result<SessionReport, ControllerError> {
        let session = self.escalation.snapshot();

        if verdict == Verdict::TerminateLimit && reason != "cancelled" {
            self.audit.append(
                AuditEvent::new(AuditKind::Error, &self.session_id, "hard limit reached")
                    .failed(ControllerError::FatalLimitReached(reason.to_string()).to_string()),
            )?;
        }
        if verdict == Verdict::Escalate && reason == "retry_cap_exhausted" {
            if let Some(failure) = self.escalation.last_failure() {
                self.audit.append(
                    AuditEvent::new(
                        AuditKind::Error,
                        &self.session_id,
                        "automatic retries exhausted",
                    )
                    .with_task(&failure.task_id)
                    .failed(
                        ControllerError::RemediationExhausted {
                            task_id: failure.task_id.clone(),
                            retries: failure.retry_count,
                        }
                        .to_string(),
                    ),
                )?;
            }
        }

        self.audit.append(
            AuditEvent::new(AuditKind::SessionEnd, &self.session_id, "session ended")
                .with_details(json!({
                    "verdict": verdict.as_str(),
                    "reason": reason,
                    "iterations": session.iteration_count,
                    "budget_spent": session.budget_spent,
                })),
        )?;
        self.audit.flush()?;

        if verdict != Verdict::Escalate {
            // Escalated sessions stay resumable; their scratch memory lives on
            self.memory.end_session()?;
        }
        self.ledger.save_to(&self.config.ledger_path())?;

        tracing::info!(
            verdict = verdict.as_str(),
            reason,
            iterations = session.iteration_count,
            "session finished"
        );

        Ok(SessionReport {
            session_id: self.session_id.clone(),
            verdict,
            reason: reason.to_string(),
            iterations: session.iteration_count,
            budget_spent: session.budget_spent,
            pending_approvals: self.escalation.pending_approvals(),
        })
    }
}

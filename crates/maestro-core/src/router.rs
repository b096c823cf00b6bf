//! The workflow state machine.
//!
//! `Idle -> Dispatching -> AwaitingReport -> Evaluating -> {Dispatching |
//! Blocked | Terminated}`. The router owns the [`StateStore`]; every report
//! is parsed, validated and merged before the next dispatch is decided, and
//! awaiting a dispatch is the only suspension point.

use crate::config::RouterConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{MaestroError, Result};
use crate::mode::{Mode, ModeRegistry};
use crate::parser;
use crate::report::HandoffReport;
use crate::routing::{self, NextStep, RouteContext, RouteTable, RoutingDecision};
use crate::state::{HistoryEvent, StateStore, WorkflowState, WorkflowStatus};
use crate::task::{Task, TaskContext};
use crate::types::BlockCause;
use crate::validator;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// A new piece of work for an idle workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub text: String,
    pub category: String,
    /// Explicit first mode; otherwise chosen by capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Objective {
    pub fn new(text: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            category: category.into(),
            mode: None,
            constraints: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }
}

/// Instruction that moves a blocked workflow forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Directive {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            instruction: None,
            category: None,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// One parallel sub-task of a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub mode: String,
    pub instruction: String,
    pub category: String,
}

impl Branch {
    pub fn new(
        mode: impl Into<String>,
        instruction: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            mode: mode.into(),
            instruction: instruction.into(),
            category: category.into(),
        }
    }
}

/// Where a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Terminated { task_id: String },
    Blocked { cause: BlockCause, reason: String },
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancels whatever the router is currently awaiting. Cloneable and usable
/// from other tasks.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CancelHandle {
    pub fn cancel(&self, reason: impl Into<String>) {
        self.tx.send_replace(Some(reason.into()));
    }
}

async fn cancellation(rx: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(reason) = current {
            return reason;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Internal results
// ---------------------------------------------------------------------------

enum Verdict {
    Accepted(HandoffReport),
    Rejected { cause: BlockCause, message: String },
}

enum Attempt {
    Accepted(HandoffReport),
    Blocked { cause: BlockCause, reason: String },
}

enum Waited {
    Done(Result<String>),
    Cancelled(String),
}

enum BranchEvent {
    Finished(String, Result<String>),
    Cancelled(String),
}

fn boundary_cause(err: &MaestroError) -> Option<BlockCause> {
    match err {
        MaestroError::DispatchTimeout { .. } => Some(BlockCause::DispatchTimeout),
        MaestroError::ModeExecution { .. } => Some(BlockCause::ModeExecution),
        _ => None,
    }
}

fn ensure_covers(mode: &Mode, category: &str) -> Result<()> {
    if mode.accepts(category) {
        Ok(())
    } else {
        Err(MaestroError::RoutingMismatch {
            mode: mode.name.clone(),
            category: category.to_string(),
            reason: "the mode does not declare this capability".to_string(),
        })
    }
}

fn hold_instruction(task_id: &str) -> String {
    format!(
        "The design from {task_id} is awaiting stakeholder approval. Obtain approval, \
         address any feedback and resubmit the Design Handoff with an Approval section \
         (Status: Approved, By: <stakeholder>)."
    )
}

// ---------------------------------------------------------------------------
// Fan-out join
// ---------------------------------------------------------------------------

fn join_rank(next: &NextStep) -> u8 {
    match next {
        NextStep::Block { .. } => 0,
        NextStep::HoldForApproval { .. } => 1,
        NextStep::Dispatch { .. } => 2,
        NextStep::Terminate => 3,
    }
}

/// Pick the decision a fan-out continues with. Block beats a held design,
/// which beats further work, which beats termination, so the workflow only
/// terminates when every branch does. Among blocks and holds the earliest
/// accepted wins; among dispatches and terminations the latest.
fn join_decisions(decisions: &[(String, RoutingDecision)]) -> Option<&(String, RoutingDecision)> {
    decisions
        .iter()
        .enumerate()
        .min_by_key(|(i, (_, d))| {
            let rank = join_rank(&d.next);
            let order = *i as i64;
            (rank, if rank <= 1 { order } else { -order })
        })
        .map(|(_, entry)| entry)
}

fn join_branches<'a>(
    branches: &'a [(Mode, Branch)],
    field: impl Fn(&'a Branch) -> &'a str,
    sep: &str,
) -> String {
    branches
        .iter()
        .map(|(_, b)| field(b))
        .collect::<Vec<_>>()
        .join(sep)
}

/// Cancel tasks left open by a block or a crash.
fn cancel_orphans(state: &mut WorkflowState, reason: &str) {
    for task in state.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
        if task.cancel(reason).is_ok() {
            tracing::debug!(task = %task.id, "cancelled orphaned task");
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    registry: ModeRegistry,
    dispatcher: Dispatcher,
    store: StateStore,
    config: RouterConfig,
    table: RouteTable,
    cancel_tx: Arc<watch::Sender<Option<String>>>,
    cancel_rx: watch::Receiver<Option<String>>,
}

impl Router {
    pub fn new(
        registry: ModeRegistry,
        dispatcher: Dispatcher,
        store: StateStore,
        config: RouterConfig,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            registry,
            dispatcher,
            store,
            config,
            table: RouteTable::default(),
            cancel_tx: Arc::new(tx),
            cancel_rx: rx,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &ModeRegistry {
        &self.registry
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Start an idle workflow on `objective` and drive it until it blocks
    /// or terminates.
    pub async fn run(&mut self, objective: Objective) -> Result<RunOutcome> {
        let status = &self.store.state().status;
        if *status != WorkflowStatus::Idle {
            return Err(MaestroError::InvalidTransition {
                from: status.label(),
                to: "running".to_string(),
                reason: "a workflow can only be started once; resume it instead".to_string(),
            });
        }

        let mode = match objective.mode {
            Some(ref name) => {
                let mode = self.registry.lookup(name)?;
                ensure_covers(mode, &objective.category)?;
                mode
            }
            None => routing::select_first_mode(
                &self.registry,
                &objective.category,
                self.config.prefer_design_first,
            )?,
        }
        .name
        .clone();

        self.reset_cancel();
        let Objective {
            text,
            category,
            constraints,
            ..
        } = objective;
        self.store.update(|s| {
            s.objective = Some(text.clone());
            s.category = Some(category.clone());
            s.constraints = constraints;
            s.status = WorkflowStatus::Running;
            s.push_event(HistoryEvent::Started {
                objective: text.clone(),
                category: category.clone(),
                mode: mode.clone(),
            });
        })?;
        tracing::info!(%mode, %category, "workflow started");

        self.drive(
            NextStep::Dispatch {
                mode,
                instruction: text,
                category,
            },
            None,
            0,
        )
        .await
    }

    /// Continue a blocked workflow with the mode named by `directive`.
    pub async fn resume(&mut self, directive: Directive) -> Result<RunOutcome> {
        let state = self.store.state();
        match state.status {
            WorkflowStatus::Blocked { .. } | WorkflowStatus::Running => {}
            ref other => {
                return Err(MaestroError::InvalidTransition {
                    from: other.label(),
                    to: "running".to_string(),
                    reason: "only a blocked workflow can be resumed".to_string(),
                })
            }
        }
        let category = directive
            .category
            .clone()
            .or_else(|| state.category.clone())
            .ok_or_else(|| MaestroError::InvalidTransition {
                from: state.status.label(),
                to: "running".to_string(),
                reason: "the workflow has no category; name one".to_string(),
            })?;
        let instruction = directive
            .instruction
            .clone()
            .or_else(|| state.objective.clone())
            .unwrap_or_default();
        let last_task = state.tasks.last().map(|t| t.id.clone());

        let mode = self.registry.lookup(&directive.mode)?;
        ensure_covers(mode, &category)?;
        let mode = mode.name.clone();

        self.reset_cancel();
        self.store.update(|s| {
            cancel_orphans(s, "superseded by resume");
            s.status = WorkflowStatus::Running;
            s.push_event(HistoryEvent::Resumed {
                mode: mode.clone(),
                instruction: directive.instruction.clone(),
            });
        })?;
        tracing::info!(%mode, %category, "workflow resumed");

        self.drive(
            NextStep::Dispatch {
                mode,
                instruction,
                category,
            },
            last_task,
            0,
        )
        .await
    }

    /// Dispatch independent branches concurrently against one snapshot and
    /// merge their reports in completion order, then continue with the
    /// branch decision picked by [`join_decisions`]. Branches are not
    /// retried.
    pub async fn fan_out(&mut self, branches: Vec<Branch>) -> Result<RunOutcome> {
        let status = &self.store.state().status;
        if *status == WorkflowStatus::Terminated || branches.is_empty() {
            return Err(MaestroError::InvalidTransition {
                from: status.label(),
                to: "fan_out".to_string(),
                reason: if branches.is_empty() {
                    "no branches given".to_string()
                } else {
                    "the workflow has terminated".to_string()
                },
            });
        }

        let mut resolved = Vec::with_capacity(branches.len());
        for branch in branches {
            let mode = self.registry.lookup(&branch.mode)?.clone();
            ensure_covers(&mode, &branch.category)?;
            resolved.push((mode, branch));
        }

        self.reset_cancel();
        self.store.update(|s| {
            if s.status == WorkflowStatus::Idle {
                let objective = join_branches(&resolved, |b| b.instruction.as_str(), "; ");
                let category = resolved[0].1.category.clone();
                s.objective.get_or_insert_with(|| objective.clone());
                s.category.get_or_insert_with(|| category.clone());
                s.push_event(HistoryEvent::Started {
                    objective,
                    category,
                    mode: join_branches(&resolved, |b| b.mode.as_str(), ", "),
                });
            } else {
                cancel_orphans(s, "superseded by fan-out");
            }
            s.status = WorkflowStatus::Running;
        })?;
        let snapshot = self.store.snapshot();

        let mut inflight = FuturesUnordered::new();
        let mut open: BTreeMap<String, (Task, Mode)> = BTreeMap::new();
        let mut aborts = Vec::new();
        for (mode, branch) in resolved {
            let mut task = self.create_task(&mode.name, branch.instruction, branch.category)?;
            let handle = self.dispatcher.dispatch(&mut task, &mode, &snapshot)?;
            self.save_task(&task)?;
            aborts.push(handle.abort_handle());
            inflight.push(async move {
                let id = handle.task_id().to_string();
                (id, handle.wait().await)
            });
            open.insert(task.id.clone(), (task, mode));
        }
        let dispatched = open.len() as u32;
        tracing::info!(branches = dispatched, version = snapshot.version, "fan-out dispatched");

        let mut decisions: Vec<(String, RoutingDecision)> = Vec::new();
        while !inflight.is_empty() {
            let event = tokio::select! {
                Some((id, result)) = inflight.next() => BranchEvent::Finished(id, result),
                reason = cancellation(&mut self.cancel_rx) => BranchEvent::Cancelled(reason),
            };
            match event {
                BranchEvent::Cancelled(reason) => {
                    for abort in &aborts {
                        abort.abort();
                    }
                    let mut last = None;
                    for (id, (mut task, _)) in std::mem::take(&mut open) {
                        self.cancel_task(&mut task, reason.clone())?;
                        last = Some(id);
                    }
                    return self.block(last, BlockCause::Cancelled, reason);
                }
                BranchEvent::Finished(id, result) => {
                    let Some((mut task, mode)) = open.remove(&id) else {
                        continue;
                    };
                    let decision = self.settle_branch(&mut task, &mode, result)?;
                    self.store.record(HistoryEvent::Routed {
                        task_id: id.clone(),
                        decision: decision.clone(),
                    })?;
                    decisions.push((id, decision));
                }
            }
        }

        let winner = join_decisions(&decisions).cloned();
        let winner_id = winner.as_ref().map(|(id, _)| id.clone());
        // Holds the join does not follow still go on record.
        for (id, decision) in &decisions {
            if let NextStep::HoldForApproval { ref mode } = decision.next {
                if winner_id.as_deref() != Some(id.as_str()) {
                    self.store.record(HistoryEvent::HeldForApproval {
                        task_id: id.clone(),
                        mode: mode.clone(),
                    })?;
                }
            }
        }
        match winner {
            Some((task_id, decision)) => {
                tracing::info!(task = %task_id, rationale = %decision.rationale, "fan-out joined");
                self.drive(decision.next, Some(task_id), dispatched).await
            }
            None => self.block(
                None,
                BlockCause::ModeExecution,
                "fan-out finished without a decision".to_string(),
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    async fn drive(
        &mut self,
        mut next: NextStep,
        mut last_task: Option<String>,
        mut steps: u32,
    ) -> Result<RunOutcome> {
        loop {
            let (mode_name, instruction, category) = match next {
                NextStep::Dispatch {
                    mode,
                    instruction,
                    category,
                } => (mode, instruction, category),
                NextStep::HoldForApproval { mode } => {
                    let task_id = last_task.clone().unwrap_or_default();
                    let category = self.category_of(last_task.as_deref());
                    self.store.record(HistoryEvent::HeldForApproval {
                        task_id: task_id.clone(),
                        mode: mode.clone(),
                    })?;
                    tracing::info!(task = %task_id, %mode, "design held for approval");
                    (mode, hold_instruction(&task_id), category)
                }
                NextStep::Terminate => return self.terminate(last_task),
                NextStep::Block { cause, reason } => return self.block(last_task, cause, reason),
            };

            let mode = match self.registry.lookup(&mode_name).cloned() {
                Ok(mode) => mode,
                Err(e) => return self.block(last_task, BlockCause::ModeNotFound, e.to_string()),
            };
            let mut task = self.create_task(&mode.name, instruction, category)?;
            last_task = Some(task.id.clone());

            match self.execute(&mut task, &mode, &mut steps).await? {
                Attempt::Accepted(report) => {
                    let decision = self.route(&report, &mode, &task.category);
                    tracing::info!(task = %task.id, rationale = %decision.rationale, "routed");
                    self.store.record(HistoryEvent::Routed {
                        task_id: task.id.clone(),
                        decision: decision.clone(),
                    })?;
                    next = decision.next;
                }
                Attempt::Blocked { cause, reason } => return self.block(last_task, cause, reason),
            }
        }
    }

    /// Dispatch `task` until a report is accepted or a retry budget runs out.
    async fn execute(&mut self, task: &mut Task, mode: &Mode, steps: &mut u32) -> Result<Attempt> {
        let mut rejections = 0;
        let mut boundary_failures = 0;
        loop {
            if *steps >= self.config.max_steps {
                let reason = format!("step limit of {} dispatches reached", self.config.max_steps);
                task.fail(reason.clone())?;
                self.save_task(task)?;
                return Ok(Attempt::Blocked {
                    cause: BlockCause::StepLimit,
                    reason,
                });
            }
            *steps += 1;

            let snapshot = self.store.snapshot();
            let handle = self.dispatcher.dispatch(task, mode, &snapshot)?;
            self.save_task(task)?;
            let abort = handle.abort_handle();
            let waited = tokio::select! {
                result = handle.wait() => Waited::Done(result),
                reason = cancellation(&mut self.cancel_rx) => {
                    abort.abort();
                    Waited::Cancelled(reason)
                }
            };

            let raw = match waited {
                Waited::Cancelled(reason) => return self.cancel_task(task, reason),
                Waited::Done(Ok(raw)) => raw,
                Waited::Done(Err(e)) => {
                    let Some(cause) = boundary_cause(&e) else {
                        task.fail(e.to_string())?;
                        self.save_task(task)?;
                        return Err(e);
                    };
                    boundary_failures += 1;
                    tracing::warn!(
                        task = %task.id,
                        mode = %mode.name,
                        attempt = task.attempts,
                        error = %e,
                        "dispatch failed"
                    );
                    if boundary_failures > self.config.boundary_retry_limit {
                        task.fail(e.to_string())?;
                        self.save_task(task)?;
                        return Ok(Attempt::Blocked {
                            cause,
                            reason: e.to_string(),
                        });
                    }
                    task.requeue()?;
                    self.save_task(task)?;
                    continue;
                }
            };

            match self.accept(task, mode, &raw)? {
                Verdict::Accepted(report) => return Ok(Attempt::Accepted(report)),
                Verdict::Rejected { cause, message } => {
                    rejections += 1;
                    tracing::warn!(
                        task = %task.id,
                        mode = %mode.name,
                        attempt = task.attempts,
                        %message,
                        "report rejected"
                    );
                    if rejections > self.config.retry_limit {
                        task.fail(message.clone())?;
                        self.save_task(task)?;
                        return Ok(Attempt::Blocked {
                            cause,
                            reason: message,
                        });
                    }
                    task.add_correction(message)?;
                    self.save_task(task)?;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Parse, check and merge one raw report. Rejections are returned, not
    /// raised; only store failures are errors.
    fn accept(&mut self, task: &mut Task, mode: &Mode, raw: &str) -> Result<Verdict> {
        let report = match parser::parse(raw) {
            Ok(report) => report,
            Err(e) => {
                return Ok(Verdict::Rejected {
                    cause: BlockCause::ParseError,
                    message: format!("malformed report: {e}"),
                })
            }
        };

        let mut reasons = Vec::new();
        if report.task_id.trim() != task.id {
            reasons.push(format!(
                "report answers task '{}' but {} was dispatched",
                report.task_id, task.id
            ));
        }
        if let Err(e) = validator::validate(&report) {
            reasons.extend(e.reasons);
        }
        if let Err(e) = validator::check_emitter(&report, mode) {
            reasons.extend(e.reasons);
        }
        if !reasons.is_empty() {
            return Ok(Verdict::Rejected {
                cause: BlockCause::ValidationError,
                message: format!("report rejected: {}", reasons.join("; ")),
            });
        }

        self.store.apply_report(&report, &mode.name)?;
        task.complete()?;
        self.save_task(task)?;
        Ok(Verdict::Accepted(report))
    }

    fn route(&self, report: &HandoffReport, mode: &Mode, category: &str) -> RoutingDecision {
        let ctx = RouteContext {
            report,
            mode,
            registry: &self.registry,
            category,
        };
        self.table.route(&ctx)
    }

    fn settle_branch(
        &mut self,
        task: &mut Task,
        mode: &Mode,
        result: Result<String>,
    ) -> Result<RoutingDecision> {
        let failure = match result {
            Ok(raw) => match self.accept(task, mode, &raw)? {
                Verdict::Accepted(report) => return Ok(self.route(&report, mode, &task.category)),
                Verdict::Rejected { cause, message } => (cause, message),
            },
            Err(e) => (
                boundary_cause(&e).unwrap_or(BlockCause::ModeExecution),
                e.to_string(),
            ),
        };
        let (cause, reason) = failure;
        tracing::warn!(task = %task.id, mode = %mode.name, %reason, "fan-out branch failed");
        task.fail(reason.clone())?;
        self.save_task(task)?;
        Ok(RoutingDecision::block(cause, reason))
    }

    // -----------------------------------------------------------------------
    // State helpers
    // -----------------------------------------------------------------------

    fn create_task(&mut self, mode: &str, objective: String, category: String) -> Result<Task> {
        self.store.update(|s| {
            let id = s.allocate_task_id();
            let context = TaskContext {
                prior_artifacts: s.artifact_paths(),
                open_questions: s.open_issues.clone(),
                constraints: s.constraints.clone(),
                corrections: Vec::new(),
            };
            let task = Task::new(id, mode, objective, category, context);
            s.upsert_task(&task);
            task
        })
    }

    fn save_task(&mut self, task: &Task) -> Result<()> {
        self.store.update(|s| s.upsert_task(task))
    }

    fn category_of(&self, task_id: Option<&str>) -> String {
        let state = self.store.state();
        task_id
            .and_then(|id| state.task(id).ok())
            .map(|t| t.category.clone())
            .or_else(|| state.category.clone())
            .unwrap_or_default()
    }

    fn cancel_task(&mut self, task: &mut Task, reason: String) -> Result<Attempt> {
        tracing::warn!(task = %task.id, %reason, "dispatch cancelled");
        task.cancel(reason.clone())?;
        self.save_task(task)?;
        self.store.record(HistoryEvent::Cancelled {
            task_id: task.id.clone(),
            reason: reason.clone(),
        })?;
        Ok(Attempt::Blocked {
            cause: BlockCause::Cancelled,
            reason,
        })
    }

    fn reset_cancel(&mut self) {
        self.cancel_tx.send_replace(None);
        self.cancel_rx.borrow_and_update();
    }

    fn block(
        &mut self,
        task_id: Option<String>,
        cause: BlockCause,
        reason: String,
    ) -> Result<RunOutcome> {
        tracing::warn!(
            task = task_id.as_deref().unwrap_or("-"),
            %cause,
            %reason,
            "workflow blocked"
        );
        self.store.update(|s| {
            s.status = WorkflowStatus::Blocked {
                cause,
                reason: reason.clone(),
            };
            s.push_event(HistoryEvent::Blocked {
                task_id,
                cause,
                reason: reason.clone(),
            });
        })?;
        Ok(RunOutcome::Blocked { cause, reason })
    }

    fn terminate(&mut self, task_id: Option<String>) -> Result<RunOutcome> {
        let task_id = task_id.unwrap_or_default();
        tracing::info!(task = %task_id, "workflow terminated");
        self.store.update(|s| {
            s.status = WorkflowStatus::Terminated;
            s.push_event(HistoryEvent::Terminated {
                task_id: task_id.clone(),
            });
        })?;
        Ok(RunOutcome::Terminated { task_id })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

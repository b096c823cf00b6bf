//! Workflow state and its store.
//!
//! `WorkflowState` is the single long-lived record of a workflow: facts,
//! artifact log, audit history, open issues and the task log. It is only
//! ever mutated through [`StateStore`], which applies each change to a copy,
//! persists it and then swaps it in, so a partial merge is never observable.

use crate::document;
use crate::error::{MaestroError, Result};
use crate::io;
use crate::paths;
use crate::report::HandoffReport;
use crate::routing::RoutingDecision;
use crate::task::{self, Task};
use crate::types::BlockCause;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowStatus {
    Idle,
    Running,
    Blocked { cause: BlockCause, reason: String },
    Terminated,
}

impl WorkflowStatus {
    pub fn label(&self) -> String {
        match self {
            WorkflowStatus::Idle => "idle".to_string(),
            WorkflowStatus::Running => "running".to_string(),
            WorkflowStatus::Blocked { cause, .. } => format!("blocked ({cause})"),
            WorkflowStatus::Terminated => "terminated".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    Started {
        objective: String,
        category: String,
        mode: String,
    },
    ReportAccepted {
        task_id: String,
        mode: String,
        report: HandoffReport,
    },
    Routed {
        task_id: String,
        decision: RoutingDecision,
    },
    HeldForApproval {
        task_id: String,
        mode: String,
    },
    Blocked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        cause: BlockCause,
        reason: String,
    },
    Resumed {
        mode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instruction: Option<String>,
    },
    Cancelled {
        task_id: String,
        reason: String,
    },
    Terminated {
        task_id: String,
    },
}

impl HistoryEvent {
    /// One-line description used by the workflow document and the CLI.
    pub fn summary(&self) -> String {
        match self {
            HistoryEvent::Started {
                objective,
                category,
                mode,
            } => format!("started '{objective}' ({category}) with {mode}"),
            HistoryEvent::ReportAccepted {
                task_id,
                mode,
                report,
            } => format!(
                "{task_id} {mode} {} {}: {}",
                report.kind,
                report.status,
                first_line(&report.summary)
            ),
            HistoryEvent::Routed { task_id, decision } => {
                format!("{task_id} routed: {}", decision.rationale)
            }
            HistoryEvent::HeldForApproval { task_id, mode } => {
                format!("{task_id} held for approval, returned to {mode}")
            }
            HistoryEvent::Blocked {
                task_id,
                cause,
                reason,
            } => match task_id {
                Some(id) => format!("{id} blocked ({cause}): {reason}"),
                None => format!("blocked ({cause}): {reason}"),
            },
            HistoryEvent::Resumed { mode, .. } => format!("resumed with {mode}"),
            HistoryEvent::Cancelled { task_id, reason } => {
                format!("{task_id} cancelled: {reason}")
            }
            HistoryEvent::Terminated { task_id } => format!("{task_id} terminated the workflow"),
        }
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub event: HistoryEvent,
}

impl HistoryEntry {
    pub fn now(event: HistoryEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Constraints from the objective, handed to every task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub artifact_log: Vec<ArtifactEntry>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub open_issues: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub next_task_seq: u64,
    /// Bumped by every committed mutation.
    #[serde(default)]
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            objective: None,
            category: None,
            constraints: Vec::new(),
            status: WorkflowStatus::Idle,
            facts: BTreeMap::new(),
            artifact_log: Vec::new(),
            history: Vec::new(),
            open_issues: Vec::new(),
            tasks: Vec::new(),
            next_task_seq: 0,
            version: 0,
            last_updated: Utc::now(),
        }
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::state_path(root);
        if !path.exists() {
            return Err(MaestroError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let state: WorkflowState = serde_yaml::from_str(&data)?;
        Ok(state)
    }

    /// Write `state.yaml` and the rendered `workflow_state.md`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::state_path(root), data.as_bytes())?;
        io::atomic_write(
            &paths::workflow_doc_path(root),
            document::render(self).as_bytes(),
        )
    }

    // ---------------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------------

    pub fn has_accepted(&self, task_id: &str) -> bool {
        self.accepted_reports().any(|(id, _, _)| id == task_id)
    }

    /// Accepted reports in acceptance order: `(task_id, mode, report)`.
    pub fn accepted_reports(&self) -> impl Iterator<Item = (&str, &str, &HandoffReport)> {
        self.history.iter().filter_map(|e| match &e.event {
            HistoryEvent::ReportAccepted {
                task_id,
                mode,
                report,
            } => Some((task_id.as_str(), mode.as_str(), report)),
            _ => None,
        })
    }

    pub fn last_report(&self) -> Option<&HandoffReport> {
        self.accepted_reports().last().map(|(_, _, r)| r)
    }

    pub fn task(&self, id: &str) -> Result<&Task> {
        self.tasks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| MaestroError::TaskNotFound(id.to_string()))
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.status, WorkflowStatus::Blocked { .. })
    }

    pub fn artifact_paths(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.artifact_log
            .iter()
            .filter(|a| seen.insert(a.path.as_str()))
            .map(|a| a.path.clone())
            .collect()
    }

    /// Facts visible to a mode holding `capabilities`. Keys without a
    /// `<capability>.` prefix are global; prefixed keys are only visible to
    /// modes that hold that capability.
    pub fn relevant_facts(&self, capabilities: &BTreeSet<String>) -> BTreeMap<String, String> {
        self.facts
            .iter()
            .filter(|(key, _)| match key.split_once('.') {
                Some((scope, _)) => capabilities.contains(scope),
                None => true,
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // ---------------------------------------------------------------------------
    // Mutations (reachable only through StateStore)
    // ---------------------------------------------------------------------------

    pub(crate) fn allocate_task_id(&mut self) -> String {
        self.next_task_seq += 1;
        task::task_id(self.next_task_seq)
    }

    pub(crate) fn upsert_task(&mut self, task: &Task) {
        match self.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => self.tasks.push(task.clone()),
        }
    }

    pub(crate) fn push_event(&mut self, event: HistoryEvent) {
        self.history.push(HistoryEntry::now(event));
    }

    fn merge_report(&mut self, report: &HandoffReport, mode: &str) {
        for fact in report.facts() {
            self.facts.insert(fact.key.clone(), fact.value.clone());
        }
        for path in &report.artifacts {
            self.artifact_log.push(ArtifactEntry {
                path: path.clone(),
                task_id: report.task_id.clone(),
            });
        }
        for issue in report.resolved_issues() {
            self.open_issues.retain(|open| open != issue);
        }
        for question in &report.open_questions {
            if !self.open_issues.contains(question) {
                self.open_issues.push(question.clone());
            }
        }
        self.push_event(HistoryEvent::ReportAccepted {
            task_id: report.task_id.clone(),
            mode: mode.to_string(),
            report: report.clone(),
        });
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Immutable shared read view of workflow state.
pub type Snapshot = Arc<WorkflowState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { version: u64 },
    /// The report's task was already accepted; nothing changed.
    Duplicate,
}

#[derive(Debug)]
pub struct StateStore {
    current: Snapshot,
    root: Option<PathBuf>,
}

impl StateStore {
    pub fn in_memory(state: WorkflowState) -> Self {
        Self {
            current: Arc::new(state),
            root: None,
        }
    }

    /// Open the persisted workflow under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let state = WorkflowState::load(root)?;
        Ok(Self {
            current: Arc::new(state),
            root: Some(root.to_path_buf()),
        })
    }

    /// Open the persisted workflow, creating an empty one if none exists.
    pub fn open_or_init(root: &Path, project: &str) -> Result<Self> {
        match Self::open(root) {
            Err(MaestroError::NotInitialized) => {
                let state = WorkflowState::new(project);
                state.save(root)?;
                Ok(Self {
                    current: Arc::new(state),
                    root: Some(root.to_path_buf()),
                })
            }
            other => other,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.current)
    }

    pub fn state(&self) -> &WorkflowState {
        &self.current
    }

    pub fn version(&self) -> u64 {
        self.current.version
    }

    /// Apply `mutate` to a copy of the state and commit it as one version.
    pub fn update<T>(&mut self, mutate: impl FnOnce(&mut WorkflowState) -> T) -> Result<T> {
        let mut next = (*self.current).clone();
        let out = mutate(&mut next);
        self.commit(next)?;
        Ok(out)
    }

    /// Merge an accepted report. Re-delivering a report whose task was
    /// already accepted is a no-op.
    pub fn apply_report(&mut self, report: &HandoffReport, mode: &str) -> Result<ApplyOutcome> {
        if self.current.has_accepted(&report.task_id) {
            tracing::debug!(task = %report.task_id, "report already accepted, skipping merge");
            return Ok(ApplyOutcome::Duplicate);
        }
        let mut next = (*self.current).clone();
        next.merge_report(report, mode);
        let version = self.commit(next)?;
        tracing::info!(
            task = %report.task_id,
            mode,
            kind = %report.kind,
            status = %report.status,
            version,
            "report accepted"
        );
        Ok(ApplyOutcome::Applied { version })
    }

    pub fn record(&mut self, event: HistoryEvent) -> Result<u64> {
        let mut next = (*self.current).clone();
        next.push_event(event);
        self.commit(next)
    }

    fn commit(&mut self, mut next: WorkflowState) -> Result<u64> {
        next.version = self.current.version + 1;
        next.last_updated = Utc::now();
        if let Some(ref root) = self.root {
            next.save(root)?;
        }
        self.current = Arc::new(next);
        Ok(self.current.version)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

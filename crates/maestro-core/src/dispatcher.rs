//! Task dispatch: package a task for its mode and run it across the
//! execution boundary.
//!
//! The dispatcher never retries. Timeouts and executor failures come back as
//! errors and the router decides what to do with them.

use crate::error::{MaestroError, Result};
use crate::mode::Mode;
use crate::state::WorkflowState;
use crate::task::Task;
use crate::types::ReportKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

// ---------------------------------------------------------------------------
// DispatchRequest
// ---------------------------------------------------------------------------

/// Everything a mode receives for one task. Never the full workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: String,
    pub mode: String,
    pub objective: String,
    pub category: String,
    #[serde(default)]
    pub relevant_facts: BTreeMap<String, String>,
    #[serde(default)]
    pub prior_artifacts: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub corrections: Vec<String>,
    /// Report kinds the mode may answer with.
    #[serde(default)]
    pub report_kinds: Vec<ReportKind>,
}

impl DispatchRequest {
    /// Render the markdown dispatch packet handed to a mode.
    pub fn to_directive(&self) -> String {
        let mut doc = String::new();

        doc.push_str(&format!("# Directive: {}\n\n", self.task_id));
        doc.push_str(&format!("**Mode:** {}\n", self.mode));
        doc.push_str(&format!("**Category:** {}\n\n", self.category));

        doc.push_str("## Objective\n\n");
        doc.push_str(self.objective.trim());
        doc.push('\n');

        push_list(&mut doc, "Constraints", &self.constraints);

        if !self.corrections.is_empty() {
            doc.push_str("\n## Corrections\n\n");
            doc.push_str("Your previous report was rejected. Fix the following and resubmit:\n");
            for (i, c) in self.corrections.iter().enumerate() {
                doc.push_str(&format!("{}. {c}\n", i + 1));
            }
        }

        if !self.relevant_facts.is_empty() {
            doc.push_str("\n## Known Facts\n\n");
            for (key, value) in &self.relevant_facts {
                doc.push_str(&format!("- **{key}:** {value}\n"));
            }
        }

        push_list(&mut doc, "Prior Artifacts", &self.prior_artifacts);
        push_list(&mut doc, "Open Questions", &self.open_questions);

        doc.push_str("\n## Report\n\n");
        doc.push_str(&format!(
            "Answer with a `# Handoff Report` for task {}. Allowed kinds:\n",
            self.task_id
        ));
        for kind in &self.report_kinds {
            let schema = kind.schema();
            doc.push_str(&format!("- `{kind}` (`## {}`", schema.heading));
            if !schema.fields.is_empty() {
                doc.push_str(&format!("; fields: {}", schema.fields.join(", ")));
            }
            doc.push_str(&format!("; sections: {})\n", schema.sections.join(", ")));
        }

        doc
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn push_list(doc: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    doc.push_str(&format!("\n## {title}\n\n"));
    for item in items {
        doc.push_str(&format!("- {item}\n"));
    }
}

// ---------------------------------------------------------------------------
// ModeExecutor
// ---------------------------------------------------------------------------

/// The execution boundary. Returns the mode's raw report text.
#[async_trait]
pub trait ModeExecutor: Send + Sync {
    async fn execute(&self, mode: &Mode, request: &DispatchRequest) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn ModeExecutor>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn ModeExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    pub fn package(task: &Task, mode: &Mode, snapshot: &WorkflowState) -> DispatchRequest {
        DispatchRequest {
            task_id: task.id.clone(),
            mode: mode.name.clone(),
            objective: task.objective.clone(),
            category: task.category.clone(),
            relevant_facts: snapshot.relevant_facts(&mode.capabilities),
            prior_artifacts: task.context.prior_artifacts.clone(),
            open_questions: task.context.open_questions.clone(),
            constraints: task.context.constraints.clone(),
            corrections: task.context.corrections.clone(),
            report_kinds: mode.report_kinds.iter().copied().collect(),
        }
    }

    /// Mark `task` dispatched and start it on the runtime. Must be called
    /// from within a tokio runtime.
    pub fn dispatch(
        &self,
        task: &mut Task,
        mode: &Mode,
        snapshot: &WorkflowState,
    ) -> Result<DispatchHandle> {
        task.mark_dispatched()?;
        let request = Self::package(task, mode, snapshot);
        tracing::info!(
            task = %task.id,
            mode = %mode.name,
            attempt = task.attempts,
            "dispatching task"
        );

        let executor = Arc::clone(&self.executor);
        let mode = mode.clone();
        let timeout = self.timeout;
        let task_id = task.id.clone();
        let mode_name = mode.name.clone();

        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, executor.execute(&mode, &request)).await {
                Ok(result) => result,
                Err(_) => Err(MaestroError::DispatchTimeout {
                    task: request.task_id.clone(),
                    after: timeout,
                }),
            }
        });

        Ok(DispatchHandle {
            task_id,
            mode: mode_name,
            handle,
        })
    }
}

// ---------------------------------------------------------------------------
// DispatchHandle
// ---------------------------------------------------------------------------

pub struct DispatchHandle {
    task_id: String,
    mode: String,
    handle: JoinHandle<Result<String>>,
}

impl DispatchHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Detached abort for use while [`wait`](Self::wait) owns the handle.
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Wait for the raw report text.
    pub async fn wait(self) -> Result<String> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(MaestroError::Cancelled(self.task_id)),
            Err(e) => Err(MaestroError::ModeExecution {
                mode: self.mode,
                reason: format!("executor task failed: {e}"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

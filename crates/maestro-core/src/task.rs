use crate::error::{MaestroError, Result};
use crate::types::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// References into workflow state handed to a mode along with its objective.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    /// Corrective instructions appended after a rejected attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub target_mode: String,
    pub objective: String,
    pub category: String,
    #[serde(default)]
    pub context: TaskContext,
    pub status: TaskStatus,
    /// Number of times this task has crossed the execution boundary.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        target_mode: impl Into<String>,
        objective: impl Into<String>,
        category: impl Into<String>,
        context: TaskContext,
    ) -> Self {
        Self {
            id: id.into(),
            target_mode: target_mode.into(),
            objective: objective.into(),
            category: category.into(),
            context,
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            dispatched_at: None,
            finished_at: None,
            failure: None,
        }
    }

    pub fn mark_dispatched(&mut self) -> Result<()> {
        self.ensure_open("dispatched")?;
        self.status = TaskStatus::Dispatched;
        self.attempts += 1;
        self.dispatched_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.ensure_open("completed")?;
        self.status = TaskStatus::Completed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_open("failed")?;
        self.status = TaskStatus::Failed;
        self.failure = Some(reason.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_open("cancelled")?;
        self.status = TaskStatus::Cancelled;
        self.failure = Some(reason.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Queue another attempt with a corrective instruction. The task returns
    /// to `Pending` so the next dispatch is legal.
    pub fn add_correction(&mut self, instruction: impl Into<String>) -> Result<()> {
        self.ensure_open("pending")?;
        self.context.corrections.push(instruction.into());
        self.status = TaskStatus::Pending;
        Ok(())
    }

    /// Return an in-flight task to `Pending` without a correction, for a
    /// plain retry after a boundary failure.
    pub fn requeue(&mut self) -> Result<()> {
        self.ensure_open("pending")?;
        self.status = TaskStatus::Pending;
        Ok(())
    }

    fn ensure_open(&self, to: &str) -> Result<()> {
        if self.status.is_terminal() {
            return Err(MaestroError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
                reason: format!("task {} is already finished", self.id),
            });
        }
        Ok(())
    }
}

/// Sequential task ids: `T1`, `T2`, ...
pub fn task_id(seq: u64) -> String {
    format!("T{seq}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            task_id(1),
            "debugger",
            "fix intermittent auth failure",
            "debug",
            TaskContext::default(),
        )
    }

    #[test]
    fn task_lifecycle() {
        let mut t = task();
        assert_eq!(t.status, TaskStatus::Pending);

        t.mark_dispatched().unwrap();
        assert_eq!(t.status, TaskStatus::Dispatched);
        assert_eq!(t.attempts, 1);
        assert!(t.dispatched_at.is_some());

        t.complete().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn corrections_requeue_and_count_attempts() {
        let mut t = task();
        t.mark_dispatched().unwrap();
        t.add_correction("Summary section is missing").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        t.mark_dispatched().unwrap();
        assert_eq!(t.attempts, 2);
        assert_eq!(t.context.corrections.len(), 1);
    }

    #[test]
    fn finished_tasks_reject_transitions() {
        let mut t = task();
        t.mark_dispatched().unwrap();
        t.fail("boundary unresponsive").unwrap();
        assert_eq!(t.failure.as_deref(), Some("boundary unresponsive"));
        assert!(matches!(
            t.mark_dispatched(),
            Err(MaestroError::InvalidTransition { .. })
        ));
        assert!(t.cancel("superseded").is_err());
    }

    #[test]
    fn task_ids_are_sequential() {
        assert_eq!(task_id(1), "T1");
        assert_eq!(task_id(42), "T42");
    }
}

use crate::parser::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowercase and strip separators so `ResolutionReport`, `resolution_report`
/// and `resolution-report` compare equal.
fn normalize_tag(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

// ---------------------------------------------------------------------------
// ReportKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    ExecutiveSummary,
    ProgressUpdate,
    ResolutionReport,
    UnresolvedIssueReport,
    DesignHandoff,
    ImplementationHandoff,
}

/// Static wire schema for one report kind: the `##` heading of its body
/// section, the `Key: value` fields that body must carry and the `###`
/// subsections it must contain.
#[derive(Debug)]
pub struct KindSchema {
    pub heading: &'static str,
    pub fields: &'static [&'static str],
    pub sections: &'static [&'static str],
}

const EXECUTIVE_SUMMARY: KindSchema = KindSchema {
    heading: "Executive Summary",
    fields: &["Bug ID", "Severity", "Status"],
    sections: &[
        "Root Cause",
        "Solution",
        "Verification",
        "Next Steps",
        "Implications",
    ],
};

const PROGRESS_UPDATE: KindSchema = KindSchema {
    heading: "Progress Update",
    fields: &[],
    sections: &["Completed Work", "Remaining Work"],
};

const RESOLUTION_REPORT: KindSchema = KindSchema {
    heading: "Bug Resolution Report",
    fields: &["Bug Status"],
    sections: &[
        "Root Cause",
        "Solution",
        "Code Changes",
        "Testing",
        "Prevention",
        "Follow-up",
    ],
};

const UNRESOLVED_ISSUE_REPORT: KindSchema = KindSchema {
    heading: "Unresolved Issue Report",
    fields: &["Current Status"],
    sections: &[
        "Current Understanding",
        "Attempted Approaches",
        "Partial Findings",
        "Recommended Next Steps",
        "Alternative Approaches",
    ],
};

const DESIGN_HANDOFF: KindSchema = KindSchema {
    heading: "Design Handoff",
    fields: &[],
    sections: &["Design Decisions", "Specifications"],
};

const IMPLEMENTATION_HANDOFF: KindSchema = KindSchema {
    heading: "Implementation Handoff",
    fields: &[],
    sections: &["Changes", "Verification"],
};

impl ReportKind {
    pub fn all() -> &'static [ReportKind] {
        &[
            ReportKind::ExecutiveSummary,
            ReportKind::ProgressUpdate,
            ReportKind::ResolutionReport,
            ReportKind::UnresolvedIssueReport,
            ReportKind::DesignHandoff,
            ReportKind::ImplementationHandoff,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::ExecutiveSummary => "executive_summary",
            ReportKind::ProgressUpdate => "progress_update",
            ReportKind::ResolutionReport => "resolution_report",
            ReportKind::UnresolvedIssueReport => "unresolved_issue_report",
            ReportKind::DesignHandoff => "design_handoff",
            ReportKind::ImplementationHandoff => "implementation_handoff",
        }
    }

    pub fn schema(self) -> &'static KindSchema {
        match self {
            ReportKind::ExecutiveSummary => &EXECUTIVE_SUMMARY,
            ReportKind::ProgressUpdate => &PROGRESS_UPDATE,
            ReportKind::ResolutionReport => &RESOLUTION_REPORT,
            ReportKind::UnresolvedIssueReport => &UNRESOLVED_ISSUE_REPORT,
            ReportKind::DesignHandoff => &DESIGN_HANDOFF,
            ReportKind::ImplementationHandoff => &IMPLEMENTATION_HANDOFF,
        }
    }

    /// Handoff kinds always pass work to a next mode, so a Completed report
    /// of these kinds cannot close the workflow on its own.
    pub fn can_close_workflow(self) -> bool {
        !matches!(
            self,
            ReportKind::DesignHandoff | ReportKind::ImplementationHandoff
        )
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReportKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_tag(s);
        ReportKind::all()
            .iter()
            .copied()
            .find(|k| normalize_tag(k.as_str()) == wanted)
            .ok_or_else(|| ParseError::UnknownKind(s.trim().to_string()))
    }
}

// ---------------------------------------------------------------------------
// ReportStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    PartiallyCompleted,
    Blocked,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Completed => "completed",
            ReportStatus::PartiallyCompleted => "partially_completed",
            ReportStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReportStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_tag(s).as_str() {
            "completed" => Ok(ReportStatus::Completed),
            "partiallycompleted" => Ok(ReportStatus::PartiallyCompleted),
            "blocked" => Ok(ReportStatus::Blocked),
            _ => Err(ParseError::InvalidStatus(s.trim().to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Pending,
    Rejected,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_tag(s).as_str() {
            "approved" => Ok(ApprovalStatus::Approved),
            "pending" => Ok(ApprovalStatus::Pending),
            "rejected" => Ok(ApprovalStatus::Rejected),
            _ => Err(ParseError::MalformedField {
                section: "Approval".to_string(),
                field: "Status".to_string(),
                reason: format!("'{}' is not approved, pending or rejected", s.trim()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_tag(s).as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(()),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// BlockCause
// ---------------------------------------------------------------------------

/// Why a workflow entered `Blocked`. Recorded in history for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCause {
    /// The mode itself reported `status = Blocked`.
    ReportBlocked,
    ParseError,
    ValidationError,
    DispatchTimeout,
    ModeExecution,
    RoutingMismatch,
    ModeNotFound,
    StepLimit,
    Cancelled,
}

impl BlockCause {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockCause::ReportBlocked => "report_blocked",
            BlockCause::ParseError => "parse_error",
            BlockCause::ValidationError => "validation_error",
            BlockCause::DispatchTimeout => "dispatch_timeout",
            BlockCause::ModeExecution => "mode_execution_error",
            BlockCause::RoutingMismatch => "routing_mismatch",
            BlockCause::ModeNotFound => "mode_not_found",
            BlockCause::StepLimit => "step_limit",
            BlockCause::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BlockCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

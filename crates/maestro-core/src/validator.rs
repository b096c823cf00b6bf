//! Cross-field contract checks on a parsed [`HandoffReport`].
//!
//! Validation is a pure function of the report and the static kind schema.
//! All violated rules are collected so a corrective instruction can name
//! every problem at once.

use crate::mode::Mode;
use crate::paths;
use crate::report::HandoffReport;
use crate::types::{ApprovalStatus, ReportKind, ReportStatus};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .reasons.join("; "))]
pub struct ValidationError {
    pub reasons: Vec<String>,
}

impl ValidationError {
    fn single(reason: impl Into<String>) -> Self {
        Self {
            reasons: vec![reason.into()],
        }
    }
}

pub fn validate(report: &HandoffReport) -> Result<(), ValidationError> {
    let mut reasons = Vec::new();

    if report.task_id.trim().is_empty() {
        reasons.push("task id is empty".to_string());
    }
    if report.summary.trim().is_empty() {
        reasons.push("summary is empty".to_string());
    }

    match report.status {
        ReportStatus::Blocked if report.open_questions.is_empty() => {
            reasons.push("a blocked report must raise at least one open question".to_string());
        }
        ReportStatus::Completed
            if report.recommendation.is_none() && !report.kind.can_close_workflow() =>
        {
            reasons.push(format!(
                "a completed {} must recommend the next mode",
                report.kind
            ));
        }
        _ => {}
    }

    if let Some(ref rec) = report.recommendation {
        if !paths::is_valid_name(rec.mode.trim()) {
            reasons.push(format!(
                "recommended mode '{}' is not a valid mode name",
                rec.mode
            ));
        }
        if rec.instruction.trim().is_empty() {
            reasons.push("recommendation has an empty instruction".to_string());
        }
        if let Some(ref category) = rec.category {
            if !paths::is_valid_name(category.trim()) {
                reasons.push(format!(
                    "recommended category '{category}' is not a valid category name"
                ));
            }
        }
    }

    check_kind_rules(report, &mut reasons);
    check_artifacts(report, &mut reasons);
    check_facts(report, &mut reasons);

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { reasons })
    }
}

fn check_kind_rules(report: &HandoffReport, reasons: &mut Vec<String>) {
    match report.kind {
        ReportKind::ResolutionReport => {
            if report.artifacts.is_empty() {
                reasons.push("a resolution report must name at least one modified artifact".into());
            }
            if report.status == ReportStatus::Blocked {
                reasons.push(
                    "a blocked resolution report must be sent as an unresolved issue report"
                        .into(),
                );
            }
        }
        ReportKind::UnresolvedIssueReport => {
            if report.status == ReportStatus::Completed {
                reasons.push("an unresolved issue report cannot be completed".into());
            }
        }
        ReportKind::DesignHandoff => {
            if let Some(ref approval) = report.approval {
                let named = approval
                    .by
                    .as_deref()
                    .is_some_and(|by| !by.trim().is_empty());
                if approval.status == ApprovalStatus::Approved && !named {
                    reasons.push("an approved design must name its approver".into());
                }
            }
        }
        _ => {}
    }
    if report.kind != ReportKind::DesignHandoff && report.approval.is_some() {
        reasons.push(format!(
            "approval is only meaningful on a design handoff, not a {}",
            report.kind
        ));
    }
}

fn check_artifacts(report: &HandoffReport, reasons: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for path in &report.artifacts {
        if path.trim().is_empty() {
            reasons.push("artifact list contains an empty entry".to_string());
        } else if !seen.insert(path.as_str()) {
            reasons.push(format!("artifact '{path}' is listed twice"));
        }
    }
}

fn check_facts(report: &HandoffReport, reasons: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for fact in &report.state_facts {
        if fact.key.trim().is_empty() {
            reasons.push("state fact with an empty key".to_string());
            continue;
        }
        if fact.is_resolution() {
            if fact.value.trim().is_empty() {
                reasons.push("resolved fact does not name an issue".to_string());
            }
            continue;
        }
        if !seen.insert(fact.key.as_str()) {
            reasons.push(format!("state fact '{}' is set twice", fact.key));
        }
    }
}

/// The emitting mode must declare the report's kind.
pub fn check_emitter(report: &HandoffReport, mode: &Mode) -> Result<(), ValidationError> {
    if mode.can_emit(report.kind) {
        Ok(())
    } else {
        Err(ValidationError::single(format!(
            "mode '{}' may not emit a {}",
            mode.name, report.kind
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ModeRegistry;

    fn resolution() -> HandoffReport {
        HandoffReport::new(
            "T1",
            ReportKind::ResolutionReport,
            ReportStatus::Completed,
            "Fixed the token refresh race",
        )
        .with_artifact("src/auth/session.rs")
        .with_fact("bug_status", "Fixed")
    }

    #[test]
    fn valid_terminal_resolution() {
        validate(&resolution()).unwrap();
    }

    #[test]
    fn blocked_requires_open_question() {
        let mut report = HandoffReport::new(
            "T1",
            ReportKind::UnresolvedIssueReport,
            ReportStatus::Blocked,
            "Cannot reproduce",
        );
        let err = validate(&report).unwrap_err();
        assert_eq!(
            err.reasons,
            vec!["a blocked report must raise at least one open question"]
        );

        report = report.with_open_question("Which tenant saw the failure?");
        validate(&report).unwrap();
    }

    #[test]
    fn completed_handoff_needs_recommendation() {
        let report = HandoffReport::new(
            "T2",
            ReportKind::ImplementationHandoff,
            ReportStatus::Completed,
            "Built the page",
        );
        assert!(validate(&report).is_err());
        validate(&report.recommend("tester", "Verify the page")).unwrap();
    }

    #[test]
    fn resolution_rules() {
        let mut report = resolution();
        report.artifacts.clear();
        report.status = ReportStatus::Blocked;
        report.open_questions.push("why?".into());
        let err = validate(&report).unwrap_err();
        assert_eq!(err.reasons.len(), 2);
        assert!(err.to_string().contains("at least one modified artifact"));
    }

    #[test]
    fn unresolved_issue_cannot_complete() {
        let report = HandoffReport::new(
            "T1",
            ReportKind::UnresolvedIssueReport,
            ReportStatus::Completed,
            "gave up",
        );
        assert!(validate(&report).is_err());
    }

    #[test]
    fn malformed_recommendation() {
        let report = resolution().recommend("Not A Mode", "  ");
        let err = validate(&report).unwrap_err();
        assert_eq!(err.reasons.len(), 2);
    }

    #[test]
    fn approval_rules() {
        let design = HandoffReport::new(
            "T1",
            ReportKind::DesignHandoff,
            ReportStatus::Completed,
            "Checkout flow",
        )
        .recommend("frontend-developer", "Build it");
        // Unapproved designs are valid; the router holds them.
        validate(&design).unwrap();
        assert!(validate(
            &design
                .clone()
                .with_approval(ApprovalStatus::Approved, None)
        )
        .is_err());
        validate(&design.with_approval(ApprovalStatus::Approved, Some("cto"))).unwrap();

        let misplaced = resolution().with_approval(ApprovalStatus::Approved, Some("cto"));
        assert!(validate(&misplaced).is_err());
    }

    #[test]
    fn duplicate_artifacts_and_facts() {
        let report = resolution()
            .with_artifact("src/auth/session.rs")
            .with_fact("bug_status", "Verified")
            .resolving("a")
            .resolving("b");
        let err = validate(&report).unwrap_err();
        assert_eq!(err.reasons.len(), 2);
    }

    #[test]
    fn emitter_must_declare_kind() {
        let registry = ModeRegistry::default();
        let report = resolution();
        check_emitter(&report, registry.lookup("debugger").unwrap()).unwrap();
        let err = check_emitter(&report, registry.lookup("designer").unwrap()).unwrap_err();
        assert!(err.to_string().contains("may not emit"));
    }
}

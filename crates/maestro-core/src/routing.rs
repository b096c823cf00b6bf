//! Pure routing rules: given an accepted report, decide what happens next.
//!
//! Rules are evaluated in order and the first whose condition holds decides.
//! Nothing here touches workflow state; the [`crate::router::Router`] applies
//! the decision.

use crate::error::{MaestroError, Result};
use crate::mode::{Mode, ModeRegistry};
use crate::report::HandoffReport;
use crate::types::{BlockCause, ReportKind, ReportStatus};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RoutingDecision (output)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum NextStep {
    Dispatch {
        mode: String,
        instruction: String,
        category: String,
    },
    /// Unapproved design: back to the same mode, never forwarded.
    HoldForApproval { mode: String },
    Terminate,
    Block { cause: BlockCause, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub next: NextStep,
    pub rationale: String,
}

impl RoutingDecision {
    pub fn block(cause: BlockCause, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            rationale: format!("blocked: {reason}"),
            next: NextStep::Block { cause, reason },
        }
    }
}

// ---------------------------------------------------------------------------
// RouteContext / RouteRule
// ---------------------------------------------------------------------------

pub struct RouteContext<'a> {
    pub report: &'a HandoffReport,
    /// The mode that emitted `report`.
    pub mode: &'a Mode,
    pub registry: &'a ModeRegistry,
    /// Category of the task the report answers.
    pub category: &'a str,
}

pub struct RouteRule {
    pub id: &'static str,
    pub condition: fn(&RouteContext) -> bool,
    pub decide: fn(&RouteContext) -> RoutingDecision,
}

pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    pub fn route(&self, ctx: &RouteContext) -> RoutingDecision {
        for rule in &self.rules {
            if (rule.condition)(ctx) {
                tracing::debug!(rule = rule.id, task = %ctx.report.task_id, "route rule matched");
                return (rule.decide)(ctx);
            }
        }
        continue_same_mode(ctx)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(default_route_rules())
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

pub fn default_route_rules() -> Vec<RouteRule> {
    vec![
        RouteRule {
            id: "report-blocked",
            condition: |ctx| ctx.report.status == ReportStatus::Blocked,
            decide: |ctx| {
                RoutingDecision::block(
                    BlockCause::ReportBlocked,
                    format!(
                        "{} reported blocked: {}",
                        ctx.mode.name,
                        ctx.report.open_questions.join("; ")
                    ),
                )
            },
        },
        RouteRule {
            id: "design-awaiting-approval",
            condition: |ctx| {
                ctx.report.kind == ReportKind::DesignHandoff && !ctx.report.is_approved()
            },
            decide: |ctx| RoutingDecision {
                next: NextStep::HoldForApproval {
                    mode: ctx.mode.name.clone(),
                },
                rationale: format!(
                    "design from {} is not approved; held for stakeholder approval",
                    ctx.mode.name
                ),
            },
        },
        RouteRule {
            id: "follow-recommendation",
            condition: |ctx| ctx.report.recommendation.is_some(),
            decide: follow_recommendation,
        },
        RouteRule {
            id: "terminal-report",
            condition: |ctx| ctx.report.status == ReportStatus::Completed,
            decide: |ctx| RoutingDecision {
                next: NextStep::Terminate,
                rationale: format!(
                    "{} completed with no further recommendation",
                    ctx.report.task_id
                ),
            },
        },
    ]
}

/// Recommendations are untrusted: the named mode must exist and must cover
/// the remaining work's category. A category the recommendation supplies
/// must be one the registry knows, and a change from the task's category
/// is logged and noted in the rationale.
fn follow_recommendation(ctx: &RouteContext) -> RoutingDecision {
    let Some(ref rec) = ctx.report.recommendation else {
        return continue_same_mode(ctx);
    };
    let target = match ctx.registry.lookup(rec.mode.trim()) {
        Ok(mode) => mode,
        Err(_) => {
            return RoutingDecision::block(
                BlockCause::ModeNotFound,
                format!("recommended mode '{}' is not registered", rec.mode),
            )
        }
    };
    let category = rec
        .category
        .as_deref()
        .map(str::trim)
        .unwrap_or(ctx.category);
    if ctx.registry.find_by_capability(category).is_empty() {
        return RoutingDecision::block(
            BlockCause::RoutingMismatch,
            format!("recommended category '{category}' is not declared by any mode"),
        );
    }
    if !target.accepts(category) {
        return RoutingDecision::block(
            BlockCause::RoutingMismatch,
            format!(
                "recommended mode '{}' lacks capability '{category}'",
                target.name
            ),
        );
    }
    let mut rationale = format!("{} recommended {} for {category}", ctx.mode.name, target.name);
    if category != ctx.category {
        tracing::warn!(
            task = %ctx.report.task_id,
            from = %ctx.category,
            to = %category,
            "recommendation reclassified the remaining work"
        );
        rationale.push_str(&format!(" (reclassified from {})", ctx.category));
    }
    RoutingDecision {
        next: NextStep::Dispatch {
            mode: target.name.clone(),
            instruction: rec.instruction.trim().to_string(),
            category: category.to_string(),
        },
        rationale,
    }
}

fn continue_same_mode(ctx: &RouteContext) -> RoutingDecision {
    RoutingDecision {
        next: NextStep::Dispatch {
            mode: ctx.mode.name.clone(),
            instruction: format!("Continue the remaining work from {}", ctx.report.task_id),
            category: ctx.category.to_string(),
        },
        rationale: format!("{} partially completed; continuing", ctx.report.task_id),
    }
}

// ---------------------------------------------------------------------------
// First mode selection
// ---------------------------------------------------------------------------

/// Pick the mode that starts a workflow in `category`. With
/// `prefer_design_first`, modes that can emit a design handoff go first;
/// declaration order breaks remaining ties.
pub fn select_first_mode<'a>(
    registry: &'a ModeRegistry,
    category: &str,
    prefer_design_first: bool,
) -> Result<&'a Mode> {
    let candidates = registry.find_by_capability(category);
    let chosen = if prefer_design_first {
        candidates
            .iter()
            .find(|m| m.is_design_mode())
            .or_else(|| candidates.first())
    } else {
        candidates.first()
    };
    chosen
        .copied()
        .ok_or_else(|| MaestroError::NoModeForCapability(category.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApprovalStatus;

    fn route(report: &HandoffReport, mode: &str, category: &str) -> RoutingDecision {
        let registry = ModeRegistry::default();
        let ctx = RouteContext {
            report,
            mode: registry.lookup(mode).unwrap(),
            registry: &registry,
            category,
        };
        RouteTable::default().route(&ctx)
    }

    fn report(kind: ReportKind, status: ReportStatus) -> HandoffReport {
        HandoffReport::new("T1", kind, status, "work")
    }

    #[test]
    fn blocked_report_blocks() {
        let r = report(ReportKind::UnresolvedIssueReport, ReportStatus::Blocked)
            .with_open_question("Which tenant?");
        let d = route(&r, "debugger", "debug");
        assert!(matches!(
            d.next,
            NextStep::Block {
                cause: BlockCause::ReportBlocked,
                ..
            }
        ));
    }

    #[test]
    fn completed_without_recommendation_terminates() {
        let r = report(ReportKind::ResolutionReport, ReportStatus::Completed);
        assert_eq!(route(&r, "debugger", "debug").next, NextStep::Terminate);
    }

    #[test]
    fn partial_progress_continues_same_mode() {
        let r = report(ReportKind::ProgressUpdate, ReportStatus::PartiallyCompleted);
        match route(&r, "backend-developer", "implement").next {
            NextStep::Dispatch { mode, category, .. } => {
                assert_eq!(mode, "backend-developer");
                assert_eq!(category, "implement");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unapproved_design_is_held() {
        let r = report(ReportKind::DesignHandoff, ReportStatus::Completed)
            .recommend("frontend-developer", "Build the checkout page");
        assert_eq!(
            route(&r, "designer", "design").next,
            NextStep::HoldForApproval {
                mode: "designer".into()
            }
        );

        let approved = r.with_approval(ApprovalStatus::Approved, Some("product-owner"));
        let d = route(&approved, "designer", "implement-frontend");
        assert!(matches!(d.next, NextStep::Dispatch { ref mode, .. } if mode == "frontend-developer"));
    }

    #[test]
    fn recommendation_category_falls_back_to_task_category() {
        let r = report(ReportKind::ResolutionReport, ReportStatus::Completed)
            .recommend("tester", "Verify the fix");
        let d = route(&r, "debugger", "debug");
        assert_eq!(
            d.next,
            NextStep::Block {
                cause: BlockCause::RoutingMismatch,
                reason: "recommended mode 'tester' lacks capability 'debug'".into()
            }
        );

        let scoped = report(ReportKind::ResolutionReport, ReportStatus::Completed)
            .recommend_for("tester", "test", "Verify the fix");
        assert!(matches!(
            route(&scoped, "debugger", "debug").next,
            NextStep::Dispatch { ref category, .. } if category == "test"
        ));
    }

    #[test]
    fn recommended_category_must_be_known() {
        let r = report(ReportKind::ResolutionReport, ReportStatus::Completed)
            .recommend_for("tester", "anything-goes", "Verify the fix");
        assert_eq!(
            route(&r, "debugger", "debug").next,
            NextStep::Block {
                cause: BlockCause::RoutingMismatch,
                reason: "recommended category 'anything-goes' is not declared by any mode".into()
            }
        );
    }

    #[test]
    fn reclassified_category_is_noted() {
        let r = report(ReportKind::ResolutionReport, ReportStatus::Completed)
            .recommend_for("tester", "test", "Verify the fix");
        let d = route(&r, "debugger", "debug");
        assert_eq!(d.rationale, "debugger recommended tester for test (reclassified from debug)");

        let same = report(ReportKind::ProgressUpdate, ReportStatus::Completed)
            .recommend_for("frontend-developer", "implement", "Wire the page");
        let d = route(&same, "backend-developer", "implement");
        assert_eq!(d.rationale, "backend-developer recommended frontend-developer for implement");
    }

    #[test]
    fn unknown_recommended_mode_blocks() {
        let r = report(ReportKind::ResolutionReport, ReportStatus::Completed)
            .recommend("wizard", "Do magic");
        assert!(matches!(
            route(&r, "debugger", "debug").next,
            NextStep::Block {
                cause: BlockCause::ModeNotFound,
                ..
            }
        ));
    }

    #[test]
    fn first_mode_prefers_design() {
        let registry = ModeRegistry::new(vec![
            Mode::new("builder", "", &["implement"], &[ReportKind::ImplementationHandoff]),
            Mode::new("sketcher", "", &["implement"], &[ReportKind::DesignHandoff]),
        ])
        .unwrap();
        assert_eq!(
            select_first_mode(&registry, "implement", true).unwrap().name,
            "sketcher"
        );
        assert_eq!(
            select_first_mode(&registry, "implement", false).unwrap().name,
            "builder"
        );
    }

    #[test]
    fn first_mode_from_default_catalog() {
        let registry = ModeRegistry::default();
        assert_eq!(
            select_first_mode(&registry, "debug", true).unwrap().name,
            "debugger"
        );
        assert_eq!(
            select_first_mode(&registry, "implement-frontend", true)
                .unwrap()
                .name,
            "designer"
        );
        assert!(matches!(
            select_first_mode(&registry, "astrology", true),
            Err(MaestroError::NoModeForCapability(_))
        ));
    }
}

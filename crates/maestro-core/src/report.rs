//! Typed handoff report: the structured result a mode returns for one task.

use crate::types::{ApprovalStatus, ReportKind, ReportStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State-fact key that marks an open issue as resolved instead of setting a fact.
pub const RESOLVED_FACT_KEY: &str = "resolved";

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub mode: String,
    pub instruction: String,
    /// Category of the remaining work. Defaults to the workflow category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFact {
    pub key: String,
    pub value: String,
}

impl StateFact {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn is_resolution(&self) -> bool {
        self.key == RESOLVED_FACT_KEY
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
}

/// Kind-specific body: `Key: value` fields and `###` subsections, keyed by
/// their titles as they appear on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportBody {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
}

impl ReportBody {
    /// A body carrying every field and section `kind` requires, each set to
    /// `TBD`. Modes fill this in.
    pub fn template(kind: ReportKind) -> Self {
        let schema = kind.schema();
        Self {
            fields: schema
                .fields
                .iter()
                .map(|f| (f.to_string(), "TBD".to_string()))
                .collect(),
            sections: schema
                .sections
                .iter()
                .map(|s| (s.to_string(), "TBD".to_string()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// HandoffReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffReport {
    pub task_id: String,
    pub kind: ReportKind,
    pub status: ReportStatus,
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub decisions_and_assumptions: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
    #[serde(default)]
    pub state_facts: Vec<StateFact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
    #[serde(default)]
    pub body: ReportBody,
}

impl HandoffReport {
    pub fn new(
        task_id: impl Into<String>,
        kind: ReportKind,
        status: ReportStatus,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            status,
            summary: summary.into(),
            artifacts: Vec::new(),
            decisions_and_assumptions: Vec::new(),
            open_questions: Vec::new(),
            recommendation: None,
            state_facts: Vec::new(),
            approval: None,
            body: ReportBody::template(kind),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.body.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_section(mut self, title: &str, text: impl Into<String>) -> Self {
        self.body.sections.insert(title.to_string(), text.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.artifacts.push(path.into());
        self
    }

    pub fn with_decision(mut self, entry: impl Into<String>) -> Self {
        self.decisions_and_assumptions.push(entry.into());
        self
    }

    pub fn with_open_question(mut self, question: impl Into<String>) -> Self {
        self.open_questions.push(question.into());
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state_facts.push(StateFact::new(key, value));
        self
    }

    pub fn resolving(self, issue: impl Into<String>) -> Self {
        self.with_fact(RESOLVED_FACT_KEY, issue)
    }

    pub fn recommend(mut self, mode: impl Into<String>, instruction: impl Into<String>) -> Self {
        self.recommendation = Some(Recommendation {
            mode: mode.into(),
            instruction: instruction.into(),
            category: None,
        });
        self
    }

    pub fn recommend_for(
        mut self,
        mode: impl Into<String>,
        category: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        self.recommendation = Some(Recommendation {
            mode: mode.into(),
            instruction: instruction.into(),
            category: Some(category.into()),
        });
        self
    }

    pub fn with_approval(mut self, status: ApprovalStatus, by: Option<&str>) -> Self {
        self.approval = Some(Approval {
            status,
            by: by.map(str::to_string),
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.body.fields.get(name).map(String::as_str)
    }

    pub fn is_approved(&self) -> bool {
        matches!(
            self.approval,
            Some(Approval {
                status: ApprovalStatus::Approved,
                ..
            })
        )
    }

    /// Facts to merge into workflow state (resolution markers excluded).
    pub fn facts(&self) -> impl Iterator<Item = &StateFact> {
        self.state_facts.iter().filter(|f| !f.is_resolution())
    }

    /// Open issues this report marks resolved.
    pub fn resolved_issues(&self) -> impl Iterator<Item = &str> {
        self.state_facts
            .iter()
            .filter(|f| f.is_resolution())
            .map(|f| f.value.as_str())
    }

    /// Render the report in the markdown wire format accepted by
    /// [`crate::parser::parse`].
    pub fn to_markdown(&self) -> String {
        let mut doc = String::new();
        doc.push_str("# Handoff Report\n");
        doc.push_str(&format!("Task: {}\n", self.task_id));
        doc.push_str(&format!("Kind: {}\n", self.kind));
        doc.push_str(&format!("Status: {}\n", self.status));

        doc.push_str("\n## Summary\n");
        doc.push_str(self.summary.trim());
        doc.push('\n');

        let schema = self.kind.schema();
        doc.push_str(&format!("\n## {}\n", schema.heading));
        for (name, value) in &self.body.fields {
            doc.push_str(&format!("{name}: {value}\n"));
        }
        for (title, text) in &self.body.sections {
            doc.push_str(&format!("### {title}\n{}\n", text.trim()));
        }

        push_list(&mut doc, "Artifacts", &self.artifacts);
        push_list(
            &mut doc,
            "Decisions and Assumptions",
            &self.decisions_and_assumptions,
        );
        push_list(&mut doc, "Open Questions", &self.open_questions);

        if let Some(ref rec) = self.recommendation {
            doc.push_str("\n## Recommendation\n");
            doc.push_str(&format!("Mode: {}\n", rec.mode));
            if let Some(ref category) = rec.category {
                doc.push_str(&format!("Category: {category}\n"));
            }
            doc.push_str(&format!("Instruction: {}\n", rec.instruction));
        }

        if !self.state_facts.is_empty() {
            doc.push_str("\n## State Facts\n");
            for fact in &self.state_facts {
                doc.push_str(&format!("- {}: {}\n", fact.key, fact.value));
            }
        }

        if let Some(ref approval) = self.approval {
            doc.push_str("\n## Approval\n");
            doc.push_str(&format!("Status: {}\n", approval.status));
            if let Some(ref by) = approval.by {
                doc.push_str(&format!("By: {by}\n"));
            }
        }

        doc
    }
}

fn push_list(doc: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    doc.push_str(&format!("\n## {title}\n"));
    for item in items {
        doc.push_str(&format!("- {item}\n"));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_covers_schema() {
        let body = ReportBody::template(ReportKind::UnresolvedIssueReport);
        assert!(body.fields.contains_key("Current Status"));
        assert_eq!(body.sections.len(), 5);
        assert!(body.sections.contains_key("Alternative Approaches"));
    }

    #[test]
    fn resolution_facts_are_split_from_state_facts() {
        let report = HandoffReport::new(
            "T3",
            ReportKind::ResolutionReport,
            ReportStatus::Completed,
            "Fixed token refresh race",
        )
        .with_fact("bug_status", "Fixed")
        .resolving("Why do sessions expire early?");

        let facts: Vec<_> = report.facts().map(|f| f.key.as_str()).collect();
        assert_eq!(facts, vec!["bug_status"]);
        let resolved: Vec<_> = report.resolved_issues().collect();
        assert_eq!(resolved, vec!["Why do sessions expire early?"]);
    }

    #[test]
    fn approval_helpers() {
        let base = HandoffReport::new(
            "T1",
            ReportKind::DesignHandoff,
            ReportStatus::Completed,
            "Checkout flow",
        );
        assert!(!base.is_approved());
        let pending = base.clone().with_approval(ApprovalStatus::Pending, None);
        assert!(!pending.is_approved());
        let approved = base.with_approval(ApprovalStatus::Approved, Some("product-owner"));
        assert!(approved.is_approved());
    }

    #[test]
    fn markdown_rendering_names_every_section() {
        let report = HandoffReport::new(
            "T2",
            ReportKind::ImplementationHandoff,
            ReportStatus::Completed,
            "Checkout page built",
        )
        .with_artifact("web/src/Checkout.tsx")
        .recommend_for("tester", "test", "Run the checkout acceptance suite");
        let md = report.to_markdown();
        assert!(md.starts_with("# Handoff Report\nTask: T2\n"));
        assert!(md.contains("## Implementation Handoff\n"));
        assert!(md.contains("### Verification\n"));
        assert!(md.contains("- web/src/Checkout.tsx\n"));
        assert!(md.contains("Mode: tester\nCategory: test\n"));
    }
}

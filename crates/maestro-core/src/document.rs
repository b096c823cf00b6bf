//! Human-readable `workflow_state.md` rendered from [`WorkflowState`].
//!
//! `state.yaml` stays canonical. The document can still be read back with
//! [`parse`] for inspection and for tooling that only sees the markdown.

use crate::state::{ArtifactEntry, WorkflowState};
use std::collections::BTreeMap;

const FACTS: &str = "Facts";
const ARTIFACT_LOG: &str = "Artifact Log";
const HISTORY: &str = "History";
const OPEN_ISSUES: &str = "Open Issues";

/// Separator between an artifact path and the task that produced it.
const ARTIFACT_SEP: &str = " — ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowDocument {
    pub facts: BTreeMap<String, String>,
    pub artifact_log: Vec<ArtifactEntry>,
    pub history: Vec<String>,
    pub open_issues: Vec<String>,
}

pub fn render(state: &WorkflowState) -> String {
    let mut doc = format!("# Workflow State: {}\n\n", state.project);
    doc.push_str(&format!("Status: {}\n", state.status.label()));
    if let Some(ref objective) = state.objective {
        doc.push_str(&format!("Objective: {objective}\n"));
    }
    if let Some(ref category) = state.category {
        doc.push_str(&format!("Category: {category}\n"));
    }
    doc.push_str(&format!("Version: {}\n", state.version));

    doc.push_str(&format!("\n## {FACTS}\n"));
    for (key, value) in &state.facts {
        doc.push_str(&format!("{key}: {}\n", single_line(value)));
    }

    doc.push_str(&format!("\n## {ARTIFACT_LOG}\n"));
    for entry in &state.artifact_log {
        doc.push_str(&format!("- {}{ARTIFACT_SEP}{}\n", entry.path, entry.task_id));
    }

    doc.push_str(&format!("\n## {HISTORY}\n"));
    for (i, entry) in state.history.iter().enumerate() {
        doc.push_str(&format!(
            "{}. [{}] {}\n",
            i + 1,
            entry.at.format("%Y-%m-%d %H:%M:%S"),
            single_line(&entry.event.summary())
        ));
    }

    doc.push_str(&format!("\n## {OPEN_ISSUES}\n"));
    for issue in &state.open_issues {
        doc.push_str(&format!("- {}\n", single_line(issue)));
    }
    doc
}

fn single_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Read a rendered document back. Later `key: value` lines in `Facts`
/// overwrite earlier ones. Unknown sections are ignored.
pub fn parse(text: &str) -> WorkflowDocument {
    let mut doc = WorkflowDocument::default();
    let mut section: Option<&str> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(title) = trimmed.strip_prefix("## ") {
            section = Some(title.trim());
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with("# ") {
            continue;
        }
        match section {
            Some(FACTS) => {
                if let Some((key, value)) = trimmed.split_once(':') {
                    doc.facts
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
            }
            Some(ARTIFACT_LOG) => {
                let item = strip_bullet(trimmed);
                let (path, task_id) = match item.rsplit_once(ARTIFACT_SEP) {
                    Some((path, task)) => (path.trim(), task.trim()),
                    None => (item, ""),
                };
                doc.artifact_log.push(ArtifactEntry {
                    path: path.to_string(),
                    task_id: task_id.to_string(),
                });
            }
            Some(HISTORY) => doc.history.push(strip_number(trimmed).to_string()),
            Some(OPEN_ISSUES) => doc.open_issues.push(strip_bullet(trimmed).to_string()),
            _ => {}
        }
    }
    doc
}

fn strip_bullet(line: &str) -> &str {
    line.strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .unwrap_or(line)
        .trim()
}

fn strip_number(line: &str) -> &str {
    match line.split_once(". ") {
        Some((n, rest)) if n.chars().all(|c| c.is_ascii_digit()) => rest.trim(),
        _ => line,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::HandoffReport;
    use crate::state::StateStore;
    use crate::types::{ReportKind, ReportStatus};

    #[test]
    fn rendered_document_reads_back() {
        let mut store = StateStore::in_memory(WorkflowState::new("shop"));
        let report = HandoffReport::new(
            "T1",
            ReportKind::ResolutionReport,
            ReportStatus::Completed,
            "Fixed token refresh race",
        )
        .with_artifact("src/auth/session.rs")
        .with_artifact("src/auth/token.rs")
        .with_fact("bug_status", "Fixed")
        .with_open_question("Should refresh be jittered?");
        store.apply_report(&report, "debugger").unwrap();

        let text = render(store.state());
        assert!(text.contains("- src/auth/session.rs — T1\n"));

        let doc = parse(&text);
        assert_eq!(doc.facts["bug_status"], "Fixed");
        assert_eq!(doc.artifact_log.len(), 2);
        assert_eq!(doc.artifact_log[1].path, "src/auth/token.rs");
        assert_eq!(doc.artifact_log[1].task_id, "T1");
        assert_eq!(doc.history.len(), 1);
        assert!(doc.history[0].contains("T1 debugger resolution_report completed"));
        assert_eq!(doc.open_issues, vec!["Should refresh be jittered?"]);
    }

    #[test]
    fn later_fact_lines_win() {
        let text = "## Facts\nbug_status: Fixed\nowner: auth\nbug_status: Verified\n";
        let doc = parse(text);
        assert_eq!(doc.facts["bug_status"], "Verified");
        assert_eq!(doc.facts.len(), 2);
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let doc = parse("## Notes\n- scratch\n## Open Issues\n- flaky CI\n");
        assert_eq!(doc.open_issues, vec!["flaky CI"]);
        assert!(doc.artifact_log.is_empty());
    }
}

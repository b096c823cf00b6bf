//! Structural decoding of raw mode output into a [`HandoffReport`].
//!
//! Two encodings are accepted: the markdown wire format (header lines, then
//! `##` sections) and a JSON encoding of the same record. Decoding is purely
//! structural and keyed by the declared `Kind`; cross-field rules live in
//! [`crate::validator`].

use crate::report::{Approval, HandoffReport, Recommendation, ReportBody, StateFact};
use crate::types::{ApprovalStatus, ReportKind, ReportStatus, Severity};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("report is empty")]
    Empty,

    #[error("report header missing {0} line")]
    MissingHeader(&'static str),

    #[error("unknown report kind '{0}'")]
    UnknownKind(String),

    #[error("invalid report status '{0}'")]
    InvalidStatus(String),

    #[error("missing {0} section")]
    MissingSection(String),

    #[error("duplicate {0} section")]
    DuplicateSection(String),

    #[error("{section} missing {field} field")]
    MissingField { section: String, field: String },

    #[error("{section} has malformed {field} field: {reason}")]
    MalformedField {
        section: String,
        field: String,
        reason: String,
    },

    #[error("{section} missing {subsection} subsection")]
    MissingSubsection { section: String, subsection: String },

    #[error("{section} section is malformed: {reason}")]
    MalformedSection { section: String, reason: String },

    #[error("invalid JSON report: {0}")]
    Json(String),
}

type ParseResult<T> = std::result::Result<T, ParseError>;

const SUMMARY: &str = "Summary";
const ARTIFACTS: &str = "Artifacts";
const DECISIONS: &str = "Decisions and Assumptions";
const OPEN_QUESTIONS: &str = "Open Questions";
const RECOMMENDATION: &str = "Recommendation";
const STATE_FACTS: &str = "State Facts";
const APPROVAL: &str = "Approval";

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn parse(raw: &str) -> ParseResult<HandoffReport> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }
    if text.starts_with('{') {
        return parse_json(text);
    }
    parse_markdown(text)
}

fn parse_json(text: &str) -> ParseResult<HandoffReport> {
    let mut value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ParseError::Json(e.to_string()))?;
    if let Some(fields) = value.as_object_mut() {
        let kind: ReportKind = json_tag(fields, "kind", "Kind")?.parse()?;
        fields.insert("kind".to_string(), kind.as_str().into());
        let status: ReportStatus = json_tag(fields, "status", "Status")?.parse()?;
        fields.insert("status".to_string(), status.as_str().into());
    }
    let report: HandoffReport =
        serde_json::from_value(value).map_err(|e| ParseError::Json(e.to_string()))?;
    check_body(report.kind, &report.body)?;
    Ok(report)
}

/// `kind` and `status` take the same spellings as the markdown header.
fn json_tag<'a>(
    fields: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
    header: &'static str,
) -> ParseResult<&'a str> {
    match fields.get(key) {
        None | Some(serde_json::Value::Null) => Err(ParseError::MissingHeader(header)),
        Some(serde_json::Value::String(tag)) => Ok(tag),
        Some(other) => Err(ParseError::Json(format!("'{key}' must be a string, got {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Line model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Line<'a> {
    text: &'a str,
    /// Inside a ``` fence: never treated as a heading.
    fenced: bool,
}

#[derive(Debug)]
struct Section<'a> {
    title: &'a str,
    lines: Vec<Line<'a>>,
}

fn lines(text: &str) -> Vec<Line<'_>> {
    let mut in_fence = false;
    text.lines()
        .map(|l| {
            let is_fence = l.trim_start().starts_with("```");
            let fenced = in_fence || is_fence;
            if is_fence {
                in_fence = !in_fence;
            }
            Line { text: l, fenced }
        })
        .collect()
}

/// Returns the heading title if `line` is a markdown heading of exactly `level`.
fn heading(line: Line<'_>, level: usize) -> Option<&str> {
    if line.fenced {
        return None;
    }
    let trimmed = line.text.trim();
    let hashes = trimmed.len() - trimmed.trim_start_matches('#').len();
    if hashes != level {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some(rest.trim())
}

fn split_sections<'a>(all: &[Line<'a>]) -> (Vec<Line<'a>>, Vec<Section<'a>>) {
    let mut preamble = Vec::new();
    let mut sections: Vec<Section<'a>> = Vec::new();
    for &line in all {
        if let Some(title) = heading(line, 2) {
            sections.push(Section {
                title,
                lines: Vec::new(),
            });
            continue;
        }
        match sections.last_mut() {
            Some(s) => s.lines.push(line),
            None => preamble.push(line),
        }
    }
    (preamble, sections)
}

/// `Key: value` with a plain-word key. Bullets and headings never match.
fn parse_kv(line: &str) -> Option<(&str, &str)> {
    let t = line.trim();
    if t.starts_with('-') || t.starts_with('*') || t.starts_with('#') {
        return None;
    }
    let (key, value) = t.split_once(':')?;
    let key = key.trim();
    let plain = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '/'));
    plain.then_some((key, value.trim()))
}

fn is_none_marker(t: &str) -> bool {
    matches!(t.to_ascii_lowercase().as_str(), "none" | "n/a" | "na")
}

fn collect_text(lines: &[Line<'_>]) -> String {
    lines
        .iter()
        .map(|l| l.text)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Map a title onto its canonical schema spelling when it matches ignoring case.
fn canonical(name: &str, known: &[&'static str]) -> String {
    known
        .iter()
        .find(|k| k.eq_ignore_ascii_case(name))
        .map(|k| k.to_string())
        .unwrap_or_else(|| name.to_string())
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

fn parse_markdown(text: &str) -> ParseResult<HandoffReport> {
    let all = lines(text);
    let (preamble, sections) = split_sections(&all);

    let mut header: BTreeMap<String, String> = BTreeMap::new();
    for line in &preamble {
        if let Some((k, v)) = parse_kv(line.text) {
            header.insert(k.to_ascii_lowercase(), v.to_string());
        }
    }
    let task_id = header
        .remove("task")
        .ok_or(ParseError::MissingHeader("Task"))?;
    let kind: ReportKind = header
        .get("kind")
        .ok_or(ParseError::MissingHeader("Kind"))?
        .parse()?;
    let status: ReportStatus = header
        .get("status")
        .ok_or(ParseError::MissingHeader("Status"))?
        .parse()?;

    let mut by_title: BTreeMap<String, &Section<'_>> = BTreeMap::new();
    for section in &sections {
        let key = section.title.to_ascii_lowercase();
        if by_title.insert(key, section).is_some() {
            return Err(ParseError::DuplicateSection(section.title.to_string()));
        }
    }
    let find = |title: &str| by_title.get(&title.to_ascii_lowercase()).copied();

    let summary = find(SUMMARY)
        .map(|s| collect_text(&s.lines))
        .ok_or_else(|| ParseError::MissingSection(SUMMARY.to_string()))?;

    let heading_title = kind.schema().heading;
    let body_section =
        find(heading_title).ok_or_else(|| ParseError::MissingSection(heading_title.to_string()))?;
    let body = parse_body(kind, body_section)?;

    let artifacts = find(ARTIFACTS).map(parse_list).transpose()?;
    let decisions = find(DECISIONS).map(parse_list).transpose()?;
    let open_questions = find(OPEN_QUESTIONS).map(parse_list).transpose()?;
    let recommendation = find(RECOMMENDATION)
        .map(parse_recommendation)
        .transpose()?
        .flatten();
    let state_facts = find(STATE_FACTS).map(parse_facts).transpose()?;
    let approval = find(APPROVAL).map(parse_approval).transpose()?.flatten();

    Ok(HandoffReport {
        task_id,
        kind,
        status,
        summary,
        artifacts: artifacts.unwrap_or_default(),
        decisions_and_assumptions: decisions.unwrap_or_default(),
        open_questions: open_questions.unwrap_or_default(),
        recommendation,
        state_facts: state_facts.unwrap_or_default(),
        approval,
        body,
    })
}

fn parse_body(kind: ReportKind, section: &Section<'_>) -> ParseResult<ReportBody> {
    let schema = kind.schema();
    let mut body = ReportBody::default();
    let mut current: Option<(String, Vec<Line<'_>>)> = None;

    for &line in &section.lines {
        if let Some(title) = heading(line, 3) {
            if let Some((t, buf)) = current.take() {
                body.sections.insert(t, collect_text(&buf));
            }
            current = Some((canonical(title, schema.sections), Vec::new()));
            continue;
        }
        match current.as_mut() {
            Some((_, buf)) => buf.push(line),
            None => {
                if let Some((k, v)) = parse_kv(line.text) {
                    body.fields.insert(canonical(k, schema.fields), v.to_string());
                }
            }
        }
    }
    if let Some((t, buf)) = current.take() {
        body.sections.insert(t, collect_text(&buf));
    }

    check_body(kind, &body)?;
    Ok(body)
}

/// Every field and subsection the kind's schema names must be present.
fn check_body(kind: ReportKind, body: &ReportBody) -> ParseResult<()> {
    let schema = kind.schema();
    for &field in schema.fields {
        let value = body
            .fields
            .get(field)
            .ok_or_else(|| ParseError::MissingField {
                section: schema.heading.to_string(),
                field: field.to_string(),
            })?;
        if value.trim().is_empty() {
            return Err(ParseError::MalformedField {
                section: schema.heading.to_string(),
                field: field.to_string(),
                reason: "value is empty".to_string(),
            });
        }
    }
    for &subsection in schema.sections {
        if !body.sections.contains_key(subsection) {
            return Err(ParseError::MissingSubsection {
                section: schema.heading.to_string(),
                subsection: subsection.to_string(),
            });
        }
    }
    if kind == ReportKind::ExecutiveSummary {
        if let Some(raw) = body.fields.get("Severity") {
            if raw.parse::<Severity>().is_err() {
                return Err(ParseError::MalformedField {
                    section: schema.heading.to_string(),
                    field: "Severity".to_string(),
                    reason: format!("'{raw}' is not critical, high, medium or low"),
                });
            }
        }
    }
    Ok(())
}

fn parse_list(section: &Section<'_>) -> ParseResult<Vec<String>> {
    let mut items: Vec<String> = Vec::new();
    for line in &section.lines {
        let t = line.text.trim();
        if t.is_empty() {
            continue;
        }
        if let Some(item) = t.strip_prefix("- ").or_else(|| t.strip_prefix("* ")) {
            items.push(item.trim().to_string());
        } else if items.is_empty() && is_none_marker(t) {
            continue;
        } else if line.text.starts_with(char::is_whitespace) && !items.is_empty() {
            // Indented continuation of the previous item.
            if let Some(last) = items.last_mut() {
                last.push(' ');
                last.push_str(t);
            }
        } else {
            return Err(ParseError::MalformedSection {
                section: section.title.to_string(),
                reason: format!("expected a bulleted list, found '{t}'"),
            });
        }
    }
    Ok(items)
}

/// `Key: value` lines; unkeyed lines continue the previous value.
fn parse_fields(section: &Section<'_>) -> ParseResult<Vec<(String, String)>> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in &section.lines {
        let t = line.text.trim();
        if t.is_empty() {
            continue;
        }
        if let Some((k, v)) = parse_kv(t) {
            fields.push((k.to_ascii_lowercase(), v.to_string()));
        } else if let Some((_, value)) = fields.last_mut() {
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(t);
        } else if is_none_marker(t) {
            continue;
        } else {
            return Err(ParseError::MalformedSection {
                section: section.title.to_string(),
                reason: format!("expected 'Key: value' lines, found '{t}'"),
            });
        }
    }
    Ok(fields)
}

fn take_field(fields: &[(String, String)], key: &str) -> Option<String> {
    fields
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim().to_string())
}

fn parse_recommendation(section: &Section<'_>) -> ParseResult<Option<Recommendation>> {
    let fields = parse_fields(section)?;
    if fields.is_empty() {
        return Ok(None);
    }
    let missing = |field: &str| ParseError::MissingField {
        section: RECOMMENDATION.to_string(),
        field: field.to_string(),
    };
    let mode = take_field(&fields, "mode").ok_or_else(|| missing("Mode"))?;
    let instruction = take_field(&fields, "instruction").ok_or_else(|| missing("Instruction"))?;
    let category = take_field(&fields, "category").filter(|c| !c.is_empty());
    Ok(Some(Recommendation {
        mode,
        instruction,
        category,
    }))
}

fn parse_facts(section: &Section<'_>) -> ParseResult<Vec<StateFact>> {
    parse_list(section)?
        .into_iter()
        .map(|item| match item.split_once(':') {
            Some((key, value)) => Ok(StateFact::new(key.trim(), value.trim())),
            None => Err(ParseError::MalformedSection {
                section: STATE_FACTS.to_string(),
                reason: format!("expected '- key: value', found '- {item}'"),
            }),
        })
        .collect()
}

fn parse_approval(section: &Section<'_>) -> ParseResult<Option<Approval>> {
    let fields = parse_fields(section)?;
    if fields.is_empty() {
        return Ok(None);
    }
    let status: ApprovalStatus = take_field(&fields, "status")
        .ok_or_else(|| ParseError::MissingField {
            section: APPROVAL.to_string(),
            field: "Status".to_string(),
        })?
        .parse()?;
    let by = take_field(&fields, "by").filter(|b| !b.is_empty());
    Ok(Some(Approval { status, by }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const RESOLUTION: &str = "\
# Handoff Report
Task: T1
Kind: ResolutionReport
Status: Completed

## Summary
Fixed the intermittent auth failure caused by a token refresh race.

## Bug Resolution Report
Bug Status: Fixed

### Root Cause
Two refreshes could run concurrently and the loser wrote a stale token.
### Solution
Serialize refreshes behind a single-flight guard.
### Code Changes
Guard added in the session layer.
### Testing
Added a concurrent refresh regression test.
### Prevention
Lint rule against unsynchronized token writes.
### Follow-up
None.

## Artifacts
- src/auth/session.rs
- tests/auth_refresh.rs

## Decisions and Assumptions
- Refresh latency increase is acceptable

## State Facts
- bug_status: Fixed
- auth.refresh_strategy: single-flight
";

    #[test]
    fn parses_resolution_report() {
        let report = parse(RESOLUTION).unwrap();
        assert_eq!(report.task_id, "T1");
        assert_eq!(report.kind, ReportKind::ResolutionReport);
        assert_eq!(report.status, ReportStatus::Completed);
        assert!(report.summary.starts_with("Fixed the intermittent"));
        assert_eq!(
            report.artifacts,
            vec!["src/auth/session.rs", "tests/auth_refresh.rs"]
        );
        assert_eq!(report.field("Bug Status"), Some("Fixed"));
        assert_eq!(
            report.body.sections["Solution"],
            "Serialize refreshes behind a single-flight guard."
        );
        assert!(report.recommendation.is_none());
        assert_eq!(report.state_facts.len(), 2);
        assert_eq!(report.state_facts[1].key, "auth.refresh_strategy");
    }

    #[test]
    fn missing_severity_names_the_field() {
        let raw = "\
Task: T4
Kind: executive_summary
Status: completed

## Summary
Session fixation in login.

## Executive Summary
Bug ID: SEC-12
Status: Open
### Root Cause
x
### Solution
x
### Verification
x
### Next Steps
x
### Implications
x
";
        let err = parse(raw).unwrap_err();
        assert_eq!(err.to_string(), "Executive Summary missing Severity field");
    }

    #[test]
    fn invalid_severity_is_malformed() {
        let report = HandoffReport::new(
            "T4",
            ReportKind::ExecutiveSummary,
            ReportStatus::Completed,
            "s",
        )
        .with_field("Severity", "apocalyptic");
        let err = parse(&report.to_markdown()).unwrap_err();
        assert!(matches!(err, ParseError::MalformedField { ref field, .. } if field == "Severity"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = "Task: T1\nKind: StatusPing\nStatus: completed\n\n## Summary\nhi\n";
        assert_eq!(
            parse(raw).unwrap_err(),
            ParseError::UnknownKind("StatusPing".to_string())
        );
    }

    #[test]
    fn missing_header_and_body_sections() {
        assert_eq!(
            parse("Kind: progress_update\nStatus: completed\n").unwrap_err(),
            ParseError::MissingHeader("Task")
        );
        let raw = "Task: T1\nKind: progress_update\nStatus: completed\n\n## Summary\nhalfway\n";
        assert_eq!(
            parse(raw).unwrap_err(),
            ParseError::MissingSection("Progress Update".to_string())
        );
        let raw = "Task: T1\nKind: progress_update\nStatus: completed\n\n## Progress Update\n### Completed Work\nx\n";
        assert_eq!(
            parse(raw).unwrap_err(),
            ParseError::MissingSection("Summary".to_string())
        );
    }

    #[test]
    fn missing_subsection_is_reported() {
        let raw = RESOLUTION.replace("### Prevention\n", "");
        let raw = raw.replace("Lint rule against unsynchronized token writes.\n", "");
        assert_eq!(
            parse(&raw).unwrap_err(),
            ParseError::MissingSubsection {
                section: "Bug Resolution Report".to_string(),
                subsection: "Prevention".to_string(),
            }
        );
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(parse("  \n").unwrap_err(), ParseError::Empty);
    }

    #[test]
    fn rendered_report_parses_back() {
        let report = HandoffReport::new(
            "T7",
            ReportKind::DesignHandoff,
            ReportStatus::Completed,
            "Checkout redesign ready",
        )
        .with_section("Design Decisions", "Single-page checkout")
        .with_artifact("design/checkout.fig")
        .with_open_question("Do we support guest checkout?")
        .with_fact("design.palette", "brand-v2")
        .recommend_for(
            "frontend-developer",
            "implement-frontend",
            "Build the checkout page",
        )
        .with_decision("Guest checkout reuses the account form")
        .with_approval(ApprovalStatus::Approved, Some("product-owner"));
        let parsed = parse(&report.to_markdown()).unwrap();
        assert_eq!(
            parsed.decisions_and_assumptions,
            vec!["Guest checkout reuses the account form"]
        );
        assert_eq!(parsed, report);
    }

    #[test]
    fn json_reports_are_accepted() {
        let report = HandoffReport::new(
            "T2",
            ReportKind::ProgressUpdate,
            ReportStatus::PartiallyCompleted,
            "Pipeline half migrated",
        );
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(parse(&json).unwrap(), report);
    }

    #[test]
    fn json_reports_still_need_their_body() {
        let mut report = HandoffReport::new(
            "T2",
            ReportKind::ProgressUpdate,
            ReportStatus::Completed,
            "done",
        );
        report.body.sections.remove("Remaining Work");
        let json = serde_json::to_string(&report).unwrap();
        assert!(matches!(
            parse(&json).unwrap_err(),
            ParseError::MissingSubsection { .. }
        ));
        assert!(matches!(parse("{not json").unwrap_err(), ParseError::Json(_)));
    }

    #[test]
    fn json_tags_are_as_lenient_as_markdown_headers() {
        let report = HandoffReport::new(
            "T2",
            ReportKind::ProgressUpdate,
            ReportStatus::PartiallyCompleted,
            "Pipeline half migrated",
        );
        let mut value = serde_json::to_value(&report).unwrap();
        value["kind"] = "Progress Update".into();
        value["status"] = "PartiallyCompleted".into();
        assert_eq!(parse(&value.to_string()).unwrap(), report);

        value["kind"] = "ProgressUpdate".into();
        value["status"] = "partially-completed".into();
        assert_eq!(parse(&value.to_string()).unwrap(), report);
    }

    #[test]
    fn json_tag_errors_match_markdown_errors() {
        let report = HandoffReport::new(
            "T2",
            ReportKind::ProgressUpdate,
            ReportStatus::Completed,
            "done",
        );
        let mut value = serde_json::to_value(&report).unwrap();
        value["kind"] = "Haiku".into();
        assert_eq!(
            parse(&value.to_string()).unwrap_err(),
            ParseError::UnknownKind("Haiku".into())
        );

        let mut value = serde_json::to_value(&report).unwrap();
        value["status"] = "done-ish".into();
        assert_eq!(
            parse(&value.to_string()).unwrap_err(),
            ParseError::InvalidStatus("done-ish".into())
        );

        let mut value = serde_json::to_value(&report).unwrap();
        value.as_object_mut().unwrap().remove("kind");
        assert_eq!(
            parse(&value.to_string()).unwrap_err(),
            ParseError::MissingHeader("Kind")
        );
    }

    #[test]
    fn fenced_headings_stay_inside_their_section() {
        let raw = RESOLUTION.replace(
            "Guard added in the session layer.\n",
            "Guard added in the session layer.\n```md\n## Not a section\n### Nor this\n```\n",
        );
        let report = parse(&raw).unwrap();
        assert!(report.body.sections["Code Changes"].contains("## Not a section"));
    }

    #[test]
    fn malformed_lists_and_facts() {
        let raw = RESOLUTION.replace("- src/auth/session.rs\n", "src/auth/session.rs\n");
        assert!(matches!(
            parse(&raw).unwrap_err(),
            ParseError::MalformedSection { ref section, .. } if section == "Artifacts"
        ));
        let raw = RESOLUTION.replace("- bug_status: Fixed\n", "- bug_status Fixed\n");
        assert!(matches!(
            parse(&raw).unwrap_err(),
            ParseError::MalformedSection { ref section, .. } if section == "State Facts"
        ));
    }

    #[test]
    fn recommendation_requires_mode_and_instruction() {
        let raw = format!("{RESOLUTION}\n## Recommendation\nInstruction: verify the fix\n");
        assert_eq!(
            parse(&raw).unwrap_err(),
            ParseError::MissingField {
                section: "Recommendation".to_string(),
                field: "Mode".to_string(),
            }
        );
        let raw = format!(
            "{RESOLUTION}\n## Recommendation\nMode: tester\nInstruction: run the auth suite\n  against staging\n"
        );
        let rec = parse(&raw).unwrap().recommendation.unwrap();
        assert_eq!(rec.mode, "tester");
        assert_eq!(rec.instruction, "run the auth suite against staging");
        assert_eq!(rec.category, None);
    }

    #[test]
    fn none_markers_mean_empty() {
        let raw = format!("{RESOLUTION}\n## Open Questions\nNone\n\n## Recommendation\nNone\n");
        let report = parse(&raw).unwrap();
        assert!(report.open_questions.is_empty());
        assert!(report.recommendation.is_none());
    }

    #[test]
    fn duplicate_sections_rejected() {
        let raw = format!("{RESOLUTION}\n## Summary\nagain\n");
        assert_eq!(
            parse(&raw).unwrap_err(),
            ParseError::DuplicateSection("Summary".to_string())
        );
    }
}

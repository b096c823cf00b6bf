use crate::output::{print_json, print_table};
use anyhow::Context;
use maestro_core::state::{WorkflowState, WorkflowStatus};
use std::path::Path;

/// How many history entries the text view shows.
const RECENT_HISTORY: usize = 10;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let state = WorkflowState::load(root).context("failed to load state")?;

    if json {
        return print_json(&state);
    }

    println!("Project:   {}", state.project);
    println!("Status:    {}", state.status.label());
    if let WorkflowStatus::Blocked { reason, .. } = &state.status {
        println!("Reason:    {reason}");
    }
    if let Some(objective) = &state.objective {
        println!("Objective: {objective}");
    }
    if let Some(category) = &state.category {
        println!("Category:  {category}");
    }
    println!("Version:   {}", state.version);
    if let Some(report) = state.last_report() {
        println!(
            "Last:      {} {} {}",
            report.task_id, report.kind, report.status
        );
    }

    if !state.facts.is_empty() {
        println!("\nFacts:");
        for (key, value) in &state.facts {
            println!("  {key}: {value}");
        }
    }

    if !state.open_issues.is_empty() {
        println!("\nOpen issues:");
        for issue in &state.open_issues {
            println!("  - {issue}");
        }
    }

    if !state.artifact_log.is_empty() {
        println!("\nArtifacts:");
        for entry in &state.artifact_log {
            println!("  {} ({})", entry.path, entry.task_id);
        }
    }

    if !state.tasks.is_empty() {
        println!("\nTasks:");
        let rows = state
            .tasks
            .iter()
            .map(|t| {
                vec![
                    t.id.clone(),
                    t.target_mode.clone(),
                    t.status.to_string(),
                    t.attempts.to_string(),
                    t.failure.clone().unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["ID", "MODE", "STATUS", "ATTEMPTS", "FAILURE"], rows);
    }

    if !state.history.is_empty() {
        println!("\nRecent history:");
        let skip = state.history.len().saturating_sub(RECENT_HISTORY);
        for entry in state.history.iter().skip(skip) {
            println!(
                "  [{}] {}",
                entry.at.format("%Y-%m-%d %H:%M:%S"),
                entry.event.summary()
            );
        }
    }

    Ok(())
}

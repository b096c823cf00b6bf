use crate::output::print_json;
use anyhow::Context;
use maestro_core::{
    config::Config,
    parser,
    report::HandoffReport,
    state::{ApplyOutcome, StateStore},
    validator,
};
use std::path::Path;

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

pub fn check(root: &Path, file: &Path, mode: Option<&str>, json: bool) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let report = match parser::parse(&raw) {
        Ok(report) => report,
        Err(e) => return reject(json, None, vec![e.to_string()], "malformed report"),
    };

    let mut reasons = Vec::new();
    if let Err(e) = validator::validate(&report) {
        reasons.extend(e.reasons);
    }
    if let Some(name) = mode {
        let config = Config::load(root).context("failed to load config")?;
        let registry = config.registry()?;
        let mode = registry.lookup(name)?;
        if let Err(e) = validator::check_emitter(&report, mode) {
            reasons.extend(e.reasons);
        }
    }
    if !reasons.is_empty() {
        return reject(json, Some(&report), reasons, "report rejected");
    }

    if json {
        print_json(&serde_json::json!({
            "valid": true,
            "errors": [],
            "report": report,
        }))?;
    } else {
        println!(
            "valid: {} {} {} ({} artifacts, {} facts)",
            report.task_id,
            report.kind,
            report.status,
            report.artifacts.len(),
            report.state_facts.len()
        );
        if let Some(rec) = &report.recommendation {
            println!("recommends: {} ({})", rec.mode, rec.instruction);
        }
    }
    Ok(())
}

fn reject(
    json: bool,
    report: Option<&HandoffReport>,
    reasons: Vec<String>,
    label: &str,
) -> anyhow::Result<()> {
    if json {
        print_json(&serde_json::json!({
            "valid": false,
            "errors": reasons,
            "report": report,
        }))?;
    } else {
        for reason in &reasons {
            println!("[error] {reason}");
        }
    }
    anyhow::bail!("{label}: {}", reasons.join("; "))
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

pub fn apply(root: &Path, file: &Path, mode: &str, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let registry = config.registry()?;
    let mode = registry.lookup(mode)?;

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let report = parser::parse(&raw).context("malformed report")?;
    validator::validate(&report).context("report rejected")?;
    validator::check_emitter(&report, mode).context("report rejected")?;

    let mut store = StateStore::open(root).context("failed to load state")?;
    let outcome = store
        .apply_report(&report, &mode.name)
        .context("failed to apply report")?;

    if json {
        let (applied, version) = match outcome {
            ApplyOutcome::Applied { version } => (true, version),
            ApplyOutcome::Duplicate => (false, store.version()),
        };
        return print_json(&serde_json::json!({
            "task_id": report.task_id,
            "applied": applied,
            "version": version,
        }));
    }

    match outcome {
        ApplyOutcome::Applied { version } => {
            println!("Applied {} from {} (state version {version})", report.task_id, mode.name)
        }
        ApplyOutcome::Duplicate => {
            println!("{} already accepted; state unchanged", report.task_id)
        }
    }
    Ok(())
}

#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn maestro(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("maestro").unwrap();
    cmd.current_dir(dir.path())
        .env("MAESTRO_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn init_project(dir: &TempDir) {
    maestro(dir).args(["init", "--name", "shop"]).assert().success();
}

fn state_json(dir: &TempDir) -> serde_json::Value {
    let out = maestro(dir).args(["state", "--json"]).output().unwrap();
    assert!(out.status.success());
    serde_json::from_slice(&out.stdout).unwrap()
}

/// Point every mode at a shell script run from the project root.
fn set_default_executor(dir: &TempDir, script: &str) {
    edit_config(dir, |cfg| {
        cfg["executors"]["default"] = serde_yaml::to_value(serde_json::json!({
            "program": "sh",
            "args": ["-c", script],
        }))
        .unwrap();
    });
}

fn edit_config(dir: &TempDir, edit: impl FnOnce(&mut serde_yaml::Value)) {
    let path = dir.path().join(".maestro/config.yaml");
    let mut cfg: serde_yaml::Value =
        serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    edit(&mut cfg);
    std::fs::write(&path, serde_yaml::to_string(&cfg).unwrap()).unwrap();
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

/// Executor that discards its packet and answers with `reply.md`, with the
/// `TASK_ID` placeholder replaced by the dispatched task id.
const REPLY_SCRIPT: &str = "cat >/dev/null; sed \"s/TASK_ID/$MAESTRO_TASK_ID/\" reply.md";

const RESOLUTION: &str = "\
# Handoff Report
Task: TASK_ID
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

## State Facts
- bug_status: Fixed
- debug.refresh_strategy: single-flight
";

fn resolution_for(task: &str) -> String {
    RESOLUTION.replace("TASK_ID", task)
}

// ---------------------------------------------------------------------------
// maestro init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_maestro_dir() {
    let dir = TempDir::new().unwrap();
    maestro(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .maestro/config.yaml"));

    assert!(dir.path().join(".maestro/config.yaml").exists());
    assert!(dir.path().join(".maestro/state.yaml").exists());
    assert!(dir.path().join(".maestro/workflow_state.md").exists());
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    maestro(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  .maestro/state.yaml"));
}

#[test]
fn init_reset_discards_workflow_state() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write(dir.path(), "report.md", &resolution_for("T1"));
    maestro(&dir)
        .args(["apply", "report.md", "--mode", "debugger"])
        .assert()
        .success();
    assert_eq!(state_json(&dir)["facts"]["bug_status"], "Fixed");

    maestro(&dir).args(["init", "--reset"]).assert().success();
    let state = state_json(&dir);
    assert!(state["facts"].as_object().unwrap().is_empty());
    assert_eq!(state["status"]["state"], "idle");
}

#[test]
fn state_requires_init() {
    let dir = TempDir::new().unwrap();
    maestro(&dir)
        .arg("state")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

// ---------------------------------------------------------------------------
// maestro modes / config
// ---------------------------------------------------------------------------

#[test]
fn modes_lists_catalogue() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    maestro(&dir)
        .arg("modes")
        .assert()
        .success()
        .stdout(predicate::str::contains("debugger"))
        .stdout(predicate::str::contains("security-specialist"));
}

#[test]
fn modes_filters_by_capability() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let out = maestro(&dir)
        .args(["modes", "--capability", "design", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let modes: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let names: Vec<&str> = modes
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["designer", "architect"]);
}

#[test]
fn config_validate_warns_about_missing_executors() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    maestro(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[warning] no executor for modes"));
}

#[test]
fn config_validate_fails_on_errors() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    edit_config(&dir, |cfg| {
        cfg["dispatch"]["timeout_seconds"] = serde_yaml::to_value(0).unwrap();
    });
    maestro(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains(
            "[error] dispatch.timeout_seconds must be positive",
        ));
}

// ---------------------------------------------------------------------------
// maestro check / apply
// ---------------------------------------------------------------------------

#[test]
fn check_accepts_valid_report() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write(dir.path(), "report.md", &resolution_for("T1"));
    maestro(&dir)
        .args(["check", "report.md", "--mode", "debugger"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid: T1 resolution_report completed"));
}

#[test]
fn check_reports_malformed_input() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "report.md", "all done, trust me");
    maestro(&dir)
        .args(["check", "report.md"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("malformed report"));
}

#[test]
fn check_json_marks_rejected_report() {
    let dir = TempDir::new().unwrap();
    let blocked = resolution_for("T1")
        .replace("Kind: ResolutionReport", "Kind: UnresolvedIssueReport")
        .replace("Status: Completed", "Status: Blocked");
    write(dir.path(), "report.md", &blocked);
    maestro(&dir)
        .args(["check", "report.md", "--json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"valid\": false"));
}

#[test]
fn check_rejects_kind_outside_mode_contract() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write(dir.path(), "report.md", &resolution_for("T1"));
    maestro(&dir)
        .args(["check", "report.md", "--mode", "designer"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("report rejected"));
}

#[test]
fn apply_merges_once() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write(dir.path(), "report.md", &resolution_for("T1"));

    maestro(&dir)
        .args(["apply", "report.md", "--mode", "debugger"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied T1 from debugger"));
    maestro(&dir)
        .args(["apply", "report.md", "--mode", "debugger"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already accepted"));

    let state = state_json(&dir);
    assert_eq!(state["facts"]["bug_status"], "Fixed");
    assert_eq!(state["artifact_log"].as_array().unwrap().len(), 1);
    assert_eq!(state["version"], 1);

    let doc = std::fs::read_to_string(dir.path().join(".maestro/workflow_state.md")).unwrap();
    assert!(doc.contains("bug_status: Fixed"));
    assert!(doc.contains("src/auth/session.rs"));
}

#[test]
fn apply_unknown_mode_fails() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    write(dir.path(), "report.md", &resolution_for("T1"));
    maestro(&dir)
        .args(["apply", "report.md", "--mode", "wizard"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mode not found: wizard"));
}

// ---------------------------------------------------------------------------
// maestro run / resume
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[test]
fn run_drives_debugger_to_termination() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    set_default_executor(&dir, REPLY_SCRIPT);
    write(dir.path(), "reply.md", RESOLUTION);

    maestro(&dir)
        .args(["run", "fix intermittent auth failure", "--category", "debug"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow terminated by T1."));

    let state = state_json(&dir);
    assert_eq!(state["status"]["state"], "terminated");
    assert_eq!(state["facts"]["bug_status"], "Fixed");
    assert_eq!(state["tasks"][0]["target_mode"], "debugger");
}

#[cfg(unix)]
#[test]
fn run_blocks_on_malformed_reports_then_resumes() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    set_default_executor(&dir, REPLY_SCRIPT);
    write(dir.path(), "reply.md", "I fixed it, probably.");

    maestro(&dir)
        .args(["run", "fix intermittent auth failure", "--category", "debug"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow blocked (parse_error)"));

    let state = state_json(&dir);
    assert_eq!(state["status"]["state"], "blocked");
    assert_eq!(state["status"]["cause"], "parse_error");
    assert_eq!(state["tasks"][0]["attempts"], 3);

    write(dir.path(), "reply.md", RESOLUTION);
    maestro(&dir)
        .args(["resume", "--mode", "debugger", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"outcome\": \"terminated\""));

    let state = state_json(&dir);
    assert_eq!(state["status"]["state"], "terminated");
    assert_eq!(state["facts"]["bug_status"], "Fixed");
}

#[cfg(unix)]
#[test]
fn run_blocks_on_timeout() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    set_default_executor(&dir, "sleep 5");
    edit_config(&dir, |cfg| {
        cfg["dispatch"]["timeout_seconds"] = serde_yaml::to_value(1).unwrap();
        cfg["router"]["boundary_retry_limit"] = serde_yaml::to_value(0).unwrap();
    });

    maestro(&dir)
        .args(["run", "fix intermittent auth failure", "--category", "debug"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow blocked (dispatch_timeout)"));
}

#[test]
fn run_rejects_category_without_mode() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    maestro(&dir)
        .args(["run", "compose a sonnet", "--category", "poetry"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no mode declares capability 'poetry'"));
}

#[test]
fn resume_requires_blocked_workflow() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    maestro(&dir)
        .args(["resume", "--mode", "debugger"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid transition"));
}

#[test]
fn fan_out_rejects_malformed_branch() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    maestro(&dir)
        .args(["fan-out", "--branch", "tester"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected mode:category:instruction"));
}

use crate::output::print_json;
use anyhow::Context;
use maestro_core::{
    config::Config,
    dispatcher::Dispatcher,
    executor::CommandExecutor,
    router::{Branch, CancelHandle, Directive, Objective, Router, RunOutcome},
    state::StateStore,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

pub fn run(
    root: &Path,
    objective: &str,
    category: &str,
    mode: Option<String>,
    constraints: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    let mut objective = Objective::new(objective, category);
    if let Some(mode) = mode {
        objective = objective.with_mode(mode);
    }
    for constraint in constraints {
        objective = objective.with_constraint(constraint);
    }

    let mut router = open_router(root)?;
    let cancel = router.cancel_handle();
    let outcome = block_on_interruptible(cancel, router.run(objective))?;
    print_outcome(&router, &outcome, json)
}

pub fn resume(
    root: &Path,
    mode: &str,
    instruction: Option<String>,
    category: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let mut directive = Directive::new(mode);
    if let Some(instruction) = instruction {
        directive = directive.with_instruction(instruction);
    }
    if let Some(category) = category {
        directive = directive.with_category(category);
    }

    let mut router = open_router(root)?;
    let cancel = router.cancel_handle();
    let outcome = block_on_interruptible(cancel, router.resume(directive))?;
    print_outcome(&router, &outcome, json)
}

pub fn fan_out(root: &Path, specs: &[String], json: bool) -> anyhow::Result<()> {
    let branches = specs
        .iter()
        .map(|s| parse_branch(s))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut router = open_router(root)?;
    let cancel = router.cancel_handle();
    let outcome = block_on_interruptible(cancel, router.fan_out(branches))?;
    print_outcome(&router, &outcome, json)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_router(root: &Path) -> anyhow::Result<Router> {
    let config = Config::load(root).context("failed to load config")?;
    let registry = config.registry().context("invalid mode catalogue")?;
    let executor = CommandExecutor::new(config.executors.clone(), config.dispatch.format, root);
    let dispatcher = Dispatcher::new(Arc::new(executor), config.dispatch.timeout());
    let store = StateStore::open(root).context("failed to load state")?;
    Ok(Router::new(registry, dispatcher, store, config.router))
}

fn block_on_interruptible<F>(cancel: CancelHandle, work: F) -> anyhow::Result<RunOutcome>
where
    F: Future<Output = maestro_core::Result<RunOutcome>>,
{
    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    rt.block_on(async move {
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling in-flight tasks");
                cancel.cancel("interrupted by user");
            }
        });
        let result = work.await;
        watcher.abort();
        result
    })
    .context("workflow stopped with an error")
}

fn parse_branch(spec: &str) -> anyhow::Result<Branch> {
    let mut parts = spec.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(mode), Some(category), Some(instruction))
            if !mode.is_empty() && !category.is_empty() && !instruction.trim().is_empty() =>
        {
            Ok(Branch::new(mode, instruction.trim(), category))
        }
        _ => anyhow::bail!("invalid branch '{spec}': expected mode:category:instruction"),
    }
}

fn print_outcome(router: &Router, outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    let state = router.store().state();

    if json {
        return print_json(&serde_json::json!({
            "outcome": outcome,
            "status": state.status,
            "version": state.version,
            "facts": state.facts,
            "open_issues": state.open_issues,
        }));
    }

    match outcome {
        RunOutcome::Terminated { task_id } => {
            println!("Workflow terminated by {task_id}.");
        }
        RunOutcome::Blocked { cause, reason } => {
            println!("Workflow blocked ({cause}): {reason}");
            for issue in &state.open_issues {
                println!("  open: {issue}");
            }
            println!("\nResume with: maestro resume --mode <mode> [--instruction <text>]");
        }
    }
    println!("State version {}.", state.version);
    Ok(())
}

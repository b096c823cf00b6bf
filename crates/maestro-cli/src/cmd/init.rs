use crate::output::print_json;
use anyhow::Context;
use maestro_core::{config::Config, io, paths, state::WorkflowState};
use std::path::Path;

pub fn run(root: &Path, name: Option<&str>, reset: bool, json: bool) -> anyhow::Result<()> {
    let project_name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    let dir = paths::maestro_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_created = if paths::config_path(root).exists() {
        false
    } else {
        Config::new(&project_name)
            .save(root)
            .context("failed to write config.yaml")?;
        true
    };

    let state_exists = paths::state_path(root).exists();
    let state_written = if !state_exists || reset {
        WorkflowState::new(&project_name)
            .save(root)
            .context("failed to write state.yaml")?;
        true
    } else {
        false
    };

    if json {
        return print_json(&serde_json::json!({
            "root": root,
            "project": project_name,
            "config_created": config_created,
            "state_written": state_written,
            "reset": reset && state_exists,
        }));
    }

    println!("Initializing maestro in: {}", root.display());
    print_file_line(config_created, paths::CONFIG_FILE);
    if reset && state_exists {
        println!("  reset:   {}", paths::STATE_FILE);
    } else {
        print_file_line(state_written, paths::STATE_FILE);
    }
    if state_written {
        print_file_line(true, paths::WORKFLOW_DOC_FILE);
    }

    if config_created {
        println!("\nNext: configure an executor for your modes in {}", paths::CONFIG_FILE);
    }
    Ok(())
}

fn print_file_line(created: bool, path: &str) {
    if created {
        println!("  created: {path}");
    } else {
        println!("  exists:  {path}");
    }
}

use crate::output::{print_json, print_table};
use anyhow::Context;
use maestro_core::{config::Config, mode::Mode};
use std::path::Path;

pub fn run(root: &Path, capability: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let registry = config.registry().context("invalid mode catalogue")?;

    let modes: Vec<&Mode> = match capability {
        Some(cap) => registry.find_by_capability(cap),
        None => registry.modes().iter().collect(),
    };

    if json {
        return print_json(&modes);
    }

    if modes.is_empty() {
        match capability {
            Some(cap) => println!("No modes hold capability '{cap}'."),
            None => println!("No modes configured."),
        }
        return Ok(());
    }

    let rows = modes
        .iter()
        .map(|m| {
            vec![
                m.name.clone(),
                join(m.capabilities.iter().map(String::as_str)),
                join(m.report_kinds.iter().map(|k| k.as_str())),
                executor_label(&config, &m.name),
            ]
        })
        .collect();
    print_table(&["MODE", "CAPABILITIES", "REPORTS", "EXECUTOR"], rows);
    Ok(())
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(", ")
}

fn executor_label(config: &Config, mode: &str) -> String {
    match config.executors.command_for(mode) {
        Some(spec) => spec.program.clone(),
        None => "-".to_string(),
    }
}

use crate::error::{MaestroError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const MAESTRO_DIR: &str = ".maestro";
pub const CONFIG_FILE: &str = ".maestro/config.yaml";
pub const STATE_FILE: &str = ".maestro/state.yaml";
pub const WORKFLOW_DOC_FILE: &str = ".maestro/workflow_state.md";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn maestro_dir(root: &Path) -> PathBuf {
    root.join(MAESTRO_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

pub fn workflow_doc_path(root: &Path) -> PathBuf {
    root.join(WORKFLOW_DOC_FILE)
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Returns true if `name` is a well-formed mode or capability identifier.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 64 && name_re().is_match(name)
}

pub fn validate_mode_name(name: &str) -> Result<()> {
    if !is_valid_name(name) {
        return Err(MaestroError::InvalidModeName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

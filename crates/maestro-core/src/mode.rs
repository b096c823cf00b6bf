//! Mode registry: the static catalogue of worker roles.
//!
//! Modes are declared once at configuration time and never mutated while a
//! workflow runs. Lookups by an unknown name fail fast with
//! [`MaestroError::ModeNotFound`].

use crate::error::{MaestroError, Result};
use crate::paths;
use crate::types::ReportKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub capabilities: BTreeSet<String>,
    pub report_kinds: BTreeSet<ReportKind>,
}

impl Mode {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        capabilities: &[&str],
        report_kinds: &[ReportKind],
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            report_kinds: report_kinds.iter().copied().collect(),
        }
    }

    pub fn accepts(&self, category: &str) -> bool {
        self.capabilities.contains(category)
    }

    pub fn can_emit(&self, kind: ReportKind) -> bool {
        self.report_kinds.contains(&kind)
    }

    pub fn is_design_mode(&self) -> bool {
        self.can_emit(ReportKind::DesignHandoff)
    }
}

// ---------------------------------------------------------------------------
// ModeRegistry
// ---------------------------------------------------------------------------

/// Read-only after construction. Declaration order is preserved and used as
/// the final tie-break when several modes share a capability.
#[derive(Debug, Clone)]
pub struct ModeRegistry {
    modes: Vec<Mode>,
    index: HashMap<String, usize>,
}

impl ModeRegistry {
    pub fn new(modes: Vec<Mode>) -> Result<Self> {
        let mut index = HashMap::with_capacity(modes.len());
        for (i, mode) in modes.iter().enumerate() {
            paths::validate_mode_name(&mode.name)?;
            if index.insert(mode.name.clone(), i).is_some() {
                return Err(MaestroError::DuplicateMode(mode.name.clone()));
            }
        }
        Ok(Self { modes, index })
    }

    pub fn lookup(&self, name: &str) -> Result<&Mode> {
        self.index
            .get(name)
            .map(|&i| &self.modes[i])
            .ok_or_else(|| MaestroError::ModeNotFound(name.to_string()))
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<&Mode> {
        self.modes.iter().filter(|m| m.accepts(capability)).collect()
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

impl Default for ModeRegistry {
    fn default() -> Self {
        // The built-in catalogue has unique, valid names.
        let modes = default_catalog();
        let index = modes
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();
        Self { modes, index }
    }
}

// ---------------------------------------------------------------------------
// Built-in catalogue
// ---------------------------------------------------------------------------

pub fn default_catalog() -> Vec<Mode> {
    use ReportKind::*;
    vec![
        Mode::new(
            "designer",
            "UI/UX designer: flows, layouts, design systems, accessibility",
            &["design", "ux-review", "implement-frontend"],
            &[DesignHandoff, ProgressUpdate],
        ),
        Mode::new(
            "architect",
            "System architect: component boundaries, data models, technology choices",
            &["design", "architecture"],
            &[DesignHandoff, ProgressUpdate],
        ),
        Mode::new(
            "frontend-developer",
            "Frontend developer: implements interfaces from approved designs",
            &["implement", "implement-frontend"],
            &[ImplementationHandoff, ProgressUpdate],
        ),
        Mode::new(
            "backend-developer",
            "Backend developer: services, APIs, persistence",
            &["implement", "implement-backend"],
            &[ImplementationHandoff, ProgressUpdate],
        ),
        Mode::new(
            "debugger",
            "Debugger: reproduces, isolates and fixes defects",
            &["debug"],
            &[
                ExecutiveSummary,
                ResolutionReport,
                UnresolvedIssueReport,
                ProgressUpdate,
            ],
        ),
        Mode::new(
            "devops",
            "DevOps engineer: pipelines, infrastructure, deployment",
            &["deploy", "infrastructure"],
            &[ImplementationHandoff, ProgressUpdate, UnresolvedIssueReport],
        ),
        Mode::new(
            "security-specialist",
            "Security specialist: threat models, audits, remediation guidance",
            &["secure-review"],
            &[ExecutiveSummary, ProgressUpdate, UnresolvedIssueReport],
        ),
        Mode::new(
            "tester",
            "Tester: test plans, regression and acceptance verification",
            &["test"],
            &[ProgressUpdate, ExecutiveSummary, UnresolvedIssueReport],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

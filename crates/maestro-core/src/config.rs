use crate::error::{MaestroError, Result};
use crate::mode::{default_catalog, Mode, ModeRegistry};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RouterConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Corrective redispatches allowed after a malformed or invalid report.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Redispatches allowed after a timeout or executor failure.
    #[serde(default = "default_retry_limit")]
    pub boundary_retry_limit: u32,
    /// Dispatches allowed in a single run before the workflow blocks.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_true")]
    pub prefer_design_first: bool,
}

fn default_retry_limit() -> u32 {
    2
}

fn default_max_steps() -> u32 {
    50
}

fn default_true() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            boundary_retry_limit: default_retry_limit(),
            max_steps: default_max_steps(),
            prefer_design_first: true,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// How the dispatch packet is written to an executor's stdin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketFormat {
    #[default]
    Directive,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub format: PacketFormat,
}

fn default_timeout_seconds() -> u64 {
    600
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            format: PacketFormat::default(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

// ---------------------------------------------------------------------------
// ExecutorsConfig
// ---------------------------------------------------------------------------

/// A process that plays a mode: the packet goes to stdin, the report comes
/// back on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<CommandSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub modes: BTreeMap<String, CommandSpec>,
}

impl ExecutorsConfig {
    pub fn command_for(&self, mode: &str) -> Option<&CommandSpec> {
        self.modes.get(mode).or(self.default.as_ref())
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default = "default_catalog")]
    pub modes: Vec<Mode>,
    #[serde(default)]
    pub executors: ExecutorsConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            router: RouterConfig::default(),
            dispatch: DispatchConfig::default(),
            modes: default_catalog(),
            executors: ExecutorsConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(MaestroError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn registry(&self) -> Result<ModeRegistry> {
        ModeRegistry::new(self.modes.clone())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.modes.is_empty() {
            error("no modes are configured".to_string());
        }
        let mut names = HashSet::new();
        for mode in &self.modes {
            if !paths::is_valid_name(&mode.name) {
                error(format!("invalid mode name '{}'", mode.name));
            }
            if !names.insert(mode.name.as_str()) {
                error(format!("mode '{}' is declared twice", mode.name));
            }
            if mode.report_kinds.is_empty() {
                error(format!("mode '{}' may not emit any report kind", mode.name));
            }
        }
        if self.dispatch.timeout_seconds == 0 {
            error("dispatch.timeout_seconds must be positive".to_string());
        }
        if self.router.max_steps == 0 {
            error("router.max_steps must be positive".to_string());
        }

        for mode in &self.modes {
            if mode.capabilities.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("mode '{}' declares no capabilities", mode.name),
                });
            }
        }

        for key in self.executors.modes.keys() {
            if !names.contains(key.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("executor configured for unknown mode '{key}'"),
                });
            }
        }
        for (label, spec) in self
            .executors
            .default
            .iter()
            .map(|s| ("default".to_string(), s))
            .chain(self.executors.modes.iter().map(|(k, s)| (k.clone(), s)))
        {
            if spec.program.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("executor '{label}' has an empty program"),
                });
            }
        }
        if self.executors.default.is_none() {
            let uncovered: Vec<&str> = self
                .modes
                .iter()
                .filter(|m| !self.executors.modes.contains_key(&m.name))
                .map(|m| m.name.as_str())
                .collect();
            if !uncovered.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("no executor for modes: {}", uncovered.join(", ")),
                });
            }
        }

        if self.router.retry_limit > 10 || self.router.boundary_retry_limit > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "router retry limits above 10 are unusual".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReportKind;
    use tempfile::TempDir;

    #[test]
    fn minimal_config_fills_defaults() {
        let yaml = "version: 1\nproject:\n  name: shop\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.router, RouterConfig::default());
        assert_eq!(cfg.router.retry_limit, 2);
        assert_eq!(cfg.router.max_steps, 50);
        assert!(cfg.router.prefer_design_first);
        assert_eq!(cfg.dispatch.timeout(), Duration::from_secs(600));
        assert_eq!(cfg.dispatch.format, PacketFormat::Directive);
        assert_eq!(cfg.registry().unwrap().len(), 8);
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::new("shop");
        cfg.executors.default = Some(CommandSpec::new("agent-runner", &["--mode-stdin"]));
        cfg.dispatch.format = PacketFormat::Json;
        cfg.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.project.name, "shop");
        assert_eq!(loaded.dispatch.format, PacketFormat::Json);
        assert_eq!(
            loaded.executors.command_for("debugger").unwrap().program,
            "agent-runner"
        );
    }

    #[test]
    fn load_requires_init() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(MaestroError::NotInitialized)
        ));
    }

    #[test]
    fn per_mode_executor_overrides_default() {
        let mut executors = ExecutorsConfig {
            default: Some(CommandSpec::new("generic", &[])),
            ..Default::default()
        };
        executors
            .modes
            .insert("tester".into(), CommandSpec::new("run-tests", &[]));
        assert_eq!(executors.command_for("tester").unwrap().program, "run-tests");
        assert_eq!(executors.command_for("debugger").unwrap().program, "generic");
    }

    #[test]
    fn validate_flags_bad_catalogue() {
        let mut cfg = Config::new("shop");
        cfg.modes.push(Mode::new("debugger", "", &["debug"], &[ReportKind::ResolutionReport]));
        cfg.modes.push(Mode::new("Bad Name", "", &[], &[]));
        cfg.executors
            .modes
            .insert("ghost".into(), CommandSpec::new("x", &[]));

        let warnings = cfg.validate();
        let errors: Vec<_> = warnings
            .iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message.as_str())
            .collect();
        assert!(errors.contains(&"mode 'debugger' is declared twice"));
        assert!(errors.contains(&"invalid mode name 'Bad Name'"));
        assert!(errors.contains(&"mode 'Bad Name' may not emit any report kind"));
        assert!(warnings
            .iter()
            .any(|w| w.message == "executor configured for unknown mode 'ghost'"));
    }

    #[test]
    fn default_config_warns_only_about_executors() {
        let warnings = Config::new("shop").validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
        assert!(warnings[0].message.starts_with("no executor for modes"));
    }
}

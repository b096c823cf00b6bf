use crate::parser::ParseError;
use crate::validator::ValidationError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaestroError {
    #[error("not initialized: run 'maestro init'")]
    NotInitialized,

    #[error("mode not found: {0}")]
    ModeNotFound(String),

    #[error("no mode declares capability '{0}'")]
    NoModeForCapability(String),

    #[error("mode already registered: {0}")]
    DuplicateMode(String),

    #[error("invalid mode name '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidModeName(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("malformed report: {0}")]
    Parse(#[from] ParseError),

    #[error("report rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("dispatch of task {task} timed out after {after:?}")]
    DispatchTimeout { task: String, after: Duration },

    #[error("mode '{mode}' failed to execute: {reason}")]
    ModeExecution { mode: String, reason: String },

    #[error("mode '{mode}' does not cover '{category}': {reason}")]
    RoutingMismatch {
        mode: String,
        category: String,
        reason: String,
    },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("task {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MaestroError>;

//! Process-backed mode execution.
//!
//! Each mode maps to a command. The dispatch packet is written to the
//! child's stdin and whatever it prints on stdout is the raw report.
//! stderr flows through to the terminal.
//!
//! The child sees `MAESTRO_ROOT`, `MAESTRO_MODE` and `MAESTRO_TASK_ID` in its
//! environment and runs with the project root as its working directory.

use crate::config::{CommandSpec, ExecutorsConfig, PacketFormat};
use crate::dispatcher::{DispatchRequest, ModeExecutor};
use crate::error::{MaestroError, Result};
use crate::mode::Mode;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct CommandExecutor {
    executors: ExecutorsConfig,
    format: PacketFormat,
    root: PathBuf,
}

impl CommandExecutor {
    pub fn new(executors: ExecutorsConfig, format: PacketFormat, root: impl Into<PathBuf>) -> Self {
        Self {
            executors,
            format,
            root: root.into(),
        }
    }

    fn build_command(&self, spec: &CommandSpec, mode: &Mode, request: &DispatchRequest) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .env("MAESTRO_ROOT", &self.root)
            .env("MAESTRO_MODE", &mode.name)
            .env("MAESTRO_TASK_ID", &request.task_id)
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    fn packet(&self, request: &DispatchRequest) -> Result<String> {
        match self.format {
            PacketFormat::Directive => Ok(request.to_directive()),
            PacketFormat::Json => request.to_json(),
        }
    }
}

#[async_trait]
impl ModeExecutor for CommandExecutor {
    async fn execute(&self, mode: &Mode, request: &DispatchRequest) -> Result<String> {
        let failed = |reason: String| MaestroError::ModeExecution {
            mode: mode.name.clone(),
            reason,
        };

        let spec = self
            .executors
            .command_for(&mode.name)
            .ok_or_else(|| failed("no executor command configured".to_string()))?;
        let packet = self.packet(request)?;

        let mut child = self
            .build_command(spec, mode, request)
            .spawn()
            .map_err(|e| failed(format!("failed to spawn '{}': {e}", spec.program)))?;

        // stdin is fed from its own task so a child echoing a large packet
        // can drain into stdout while we are still writing.
        let writer = child.stdin.take().map(|mut stdin| {
            let mode_name = mode.name.clone();
            tokio::spawn(async move {
                // A child that exits without reading its packet closes the
                // pipe; its exit status decides the outcome.
                if let Err(e) = stdin.write_all(packet.as_bytes()).await {
                    tracing::debug!(mode = %mode_name, error = %e, "executor closed stdin early");
                }
            })
        });

        let output = child.wait_with_output().await;
        if let Some(writer) = writer {
            writer.abort();
        }
        let output = output.map_err(|e| failed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let hint: String = stdout.chars().take(500).collect();
            return Err(failed(format!("exited with {}: {hint}", output.status)));
        }
        Ok(stdout)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// src/worker/command.rs

//! Step handler that runs a shell command per task.
//!
//! The task input is written to the child's stdin as JSON and stdout is
//! parsed as the task output. stdout that is not JSON becomes a JSON string;
//! empty stdout becomes `null`.

use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::worker::executor::{StepContext, StepHandler};

/// stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CommandHandler {
    cmd: String,
}

impl CommandHandler {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    fn command(&self, ctx: &StepContext) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.cmd);
            c
        };
        cmd.env("PGFLOW_RUN_ID", ctx.run_id().to_string())
            .env("PGFLOW_FLOW", &ctx.task.flow_slug)
            .env("PGFLOW_STEP", ctx.step_slug())
            .env("PGFLOW_TASK_INDEX", ctx.task_index().to_string())
            .env("PGFLOW_ATTEMPT", ctx.attempt().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl StepHandler for CommandHandler {
    async fn handle(&self, ctx: StepContext) -> anyhow::Result<Value> {
        info!(
            run_id = %ctx.run_id(),
            step = %ctx.step_slug(),
            task_index = ctx.task_index(),
            cmd = %self.cmd,
            "starting step process"
        );

        let mut child = self
            .command(&ctx)
            .spawn()
            .with_context(|| format!("spawning process for step '{}'", ctx.step_slug()))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(ctx.input())?;
            // A command that ignores stdin may exit before reading it.
            if let Err(err) = stdin.write_all(&payload).await {
                debug!(step = %ctx.step_slug(), error = %err, "could not write step input");
            }
        }

        let stdout = child.stdout.take();
        let reading = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_string(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        });

        let stderr = child.stderr.take();
        let step = ctx.step_slug().to_string();
        let tail = tokio::spawn(async move {
            let mut tail = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%step, "stderr: {}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail
        });

        let status = tokio::select! {
            status = child.wait() => status
                .with_context(|| format!("waiting for process of step '{}'", ctx.step_slug()))?,
            _ = ctx.cancel.cancelled() => {
                info!(step = %ctx.step_slug(), "cancellation requested; killing step process");
                if let Err(err) = child.kill().await {
                    warn!(step = %ctx.step_slug(), error = %err, "failed to kill step process");
                }
                bail!("step '{}' was cancelled", ctx.step_slug());
            }
        };

        let stdout = reading.await.context("joining stdout reader")??;
        let stderr_tail = tail.await.unwrap_or_default();

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            if stderr_tail.is_empty() {
                bail!("command exited with status {code}");
            }
            bail!("command exited with status {code}: {}", stderr_tail.join("\n"));
        }

        Ok(parse_output(&stdout))
    }
}

fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

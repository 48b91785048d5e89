//! Immediate, current-boot application of a cloud-config document.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{ProvisionError, Result};

/// Applies a cloud-config document now, without persisting it.
#[allow(async_fn_in_trait)]
pub trait InlineExecutor {
    async fn apply(&self, yaml: &str, stage: &str) -> Result<()>;
}

/// Pipes the document to an external stage runner's stdin.
///
/// `{stage}` in any argument is replaced with the requested stage.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn argv(&self, stage: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace("{stage}", stage))
            .collect()
    }
}

impl InlineExecutor for CommandExecutor {
    async fn apply(&self, yaml: &str, stage: &str) -> Result<()> {
        let argv = self.argv(stage);
        let Some((program, args)) = argv.split_first() else {
            return Err(ProvisionError::CommandFailed {
                command: String::new(),
                message: "empty inline command".into(),
            });
        };
        let command = argv.join(" ");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProvisionError::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(yaml.as_bytes())
                .await
                .map_err(|e| ProvisionError::CommandFailed {
                    command: command.clone(),
                    message: e.to_string(),
                })?;
            let _ = stdin.shutdown().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ProvisionError::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ProvisionError::CommandFailed {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Skips immediate application; the persisted copy takes effect next boot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

impl InlineExecutor for NoopExecutor {
    async fn apply(&self, _yaml: &str, _stage: &str) -> Result<()> {
        Ok(())
    }
}

//! Linux command execution (`ip`, `nft`)

use super::{Effector, PlatformError, SystemCommand};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LinuxEffector {
    timeout: Duration,
}

impl LinuxEffector {
    pub fn new() -> Self {
        Self {
            timeout: COMMAND_TIMEOUT,
        }
    }

    async fn execute(&self, command: &SystemCommand) -> Result<String, PlatformError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlatformError::SpawnError {
                command: command.describe(),
                source: e,
            })?;

        if let (Some(script), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| PlatformError::SpawnError {
                    command: command.describe(),
                    source: e,
                })?;
            // Dropping stdin closes the pipe so nft sees EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PlatformError::SpawnError {
                command: command.describe(),
                source: e,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(PlatformError::CommandFailed {
                command: command.describe(),
                output: combined.trim().to_string(),
            });
        }

        Ok(combined)
    }
}

impl Default for LinuxEffector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Effector for LinuxEffector {
    async fn run(&self, command: &SystemCommand) -> Result<String, PlatformError> {
        debug!("exec: {}", command);
        match tokio::time::timeout(self.timeout, self.execute(command)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout {
                command: command.describe(),
            }),
        }
    }
}

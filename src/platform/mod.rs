//! Kernel control surface
//!
//! Every firewall and routing change is issued as a discrete external command
//! through an [`Effector`]. The steering logic never spawns processes itself,
//! so it can be driven against a recording effector in dry-run mode or in tests.

#[cfg(target_os = "linux")]
pub mod linux;

pub mod recording;

pub use recording::RecordingEffector;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to spawn `{command}`: {source}")]
    SpawnError {
        command: String,
        source: std::io::Error,
    },
    #[error("Command `{command}` failed: {output}")]
    CommandFailed { command: String, output: String },
    #[error("Command `{command}` timed out")]
    Timeout { command: String },
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// One external command: program, arguments and optional stdin payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SystemCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl SystemCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    /// `nft -f -` with the given script on stdin
    pub fn nft_script(script: String) -> Self {
        Self::new("nft", ["-f", "-"]).with_stdin(script)
    }

    pub fn with_stdin(mut self, stdin: String) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Full description for diagnostics, including any stdin script
    pub fn describe(&self) -> String {
        match &self.stdin {
            Some(stdin) => format!("{} <<EOF\n{}\nEOF", self, stdin.trim_end()),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for SystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Platform-agnostic command interface
#[async_trait]
pub trait Effector: Send + Sync {
    /// Run a command to completion, returning its combined output
    async fn run(&self, command: &SystemCommand) -> Result<String, PlatformError>;
}

/// Get the effector that talks to the real kernel on this platform
pub fn get_effector() -> Result<std::sync::Arc<dyn Effector>, PlatformError> {
    #[cfg(target_os = "linux")]
    {
        Ok(std::sync::Arc::new(linux::LinuxEffector::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_error_display() {
        let err = PlatformError::CommandFailed {
            command: "ip rule add fwmark 0x3e9 lookup 1001".to_string(),
            output: "RTNETLINK answers: File exists".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command `ip rule add fwmark 0x3e9 lookup 1001` failed: RTNETLINK answers: File exists"
        );

        let err = PlatformError::Timeout {
            command: "nft -f -".to_string(),
        };
        assert_eq!(err.to_string(), "Command `nft -f -` timed out");

        let err = PlatformError::UnsupportedPlatform;
        assert_eq!(err.to_string(), "Unsupported platform");
    }

    #[test]
    fn test_command_display() {
        let cmd = SystemCommand::new("ip", ["route", "replace", "default", "dev", "wg0"]);
        assert_eq!(cmd.to_string(), "ip route replace default dev wg0");
        assert_eq!(cmd.describe(), "ip route replace default dev wg0");
    }

    #[test]
    fn test_describe_includes_script() {
        let cmd = SystemCommand::nft_script("flush chain ip shieldlink vpn\n".to_string());
        assert_eq!(cmd.to_string(), "nft -f -");
        let described = cmd.describe();
        assert!(described.starts_with("nft -f - <<EOF\n"));
        assert!(described.contains("flush chain ip shieldlink vpn"));
        assert!(described.ends_with("EOF"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_get_effector_returns_ok() {
        assert!(get_effector().is_ok());
    }
}

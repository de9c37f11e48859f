//! Recording effector
//!
//! Logs and records commands instead of executing them. Used by `run --dry-run`
//! and as a stand-in kernel when exercising the steering logic.

use super::{Effector, PlatformError, SystemCommand};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

#[derive(Default)]
pub struct RecordingEffector {
    log: Mutex<Vec<SystemCommand>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingEffector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every command whose description contains `needle` fail
    pub fn fail_matching(&self, needle: &str) {
        self.failing.lock().push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// All commands issued so far, including failed ones
    pub fn commands(&self) -> Vec<SystemCommand> {
        self.log.lock().clone()
    }

    /// Commands rendered with [`SystemCommand::describe`]
    pub fn rendered(&self) -> Vec<String> {
        self.log.lock().iter().map(SystemCommand::describe).collect()
    }

    /// Drain the log
    pub fn take(&self) -> Vec<SystemCommand> {
        std::mem::take(&mut *self.log.lock())
    }
}

#[async_trait]
impl Effector for RecordingEffector {
    async fn run(&self, command: &SystemCommand) -> Result<String, PlatformError> {
        let described = command.describe();
        info!("dry-run: {}", described);
        self.log.lock().push(command.clone());

        if self.failing.lock().iter().any(|n| described.contains(n)) {
            return Err(PlatformError::CommandFailed {
                command: described,
                output: "injected failure".to_string(),
            });
        }
        Ok(String::new())
    }
}

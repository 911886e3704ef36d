//! Optional restart hook run after a port write.

use crate::config::RESTART_TIMEOUT;
use crate::error::{CommandError, RestartError};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Longest stderr excerpt kept in a [`CommandError::Failed`].
const STDERR_EXCERPT: usize = 512;

/// Runs an operator-supplied command line.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &str) -> Result<(), CommandError>;
}

/// Runs commands through `sh -c`, output captured in memory.
pub struct ShellExecutor {
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str) -> Result<(), CommandError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, child)
            .await
            .map_err(|_| CommandError::Timeout(self.timeout))?
            .map_err(CommandError::Spawn)?;

        if output.status.success() {
            debug!(command, "command succeeded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let excerpt = match stderr.char_indices().nth(STDERR_EXCERPT) {
            Some((idx, _)) => &stderr[..idx],
            None => stderr,
        };
        Err(CommandError::Failed {
            code: output.status.code(),
            stderr: excerpt.to_string(),
        })
    }
}

/// Executor that does nothing, for setups that never restart the client.
pub struct NoopExecutor;

#[async_trait]
impl CommandExecutor for NoopExecutor {
    async fn run(&self, _command: &str) -> Result<(), CommandError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct RestartHook {
    command: Option<String>,
    executor: Arc<dyn CommandExecutor>,
}

impl RestartHook {
    pub fn new(command: Option<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { command, executor }
    }

    pub fn from_command(command: Option<String>) -> Self {
        Self::new(command, Arc::new(ShellExecutor::new(RESTART_TIMEOUT)))
    }

    /// A hook without a command.
    pub fn disabled() -> Self {
        Self::new(None, Arc::new(NoopExecutor))
    }

    pub fn is_configured(&self) -> bool {
        self.command.is_some()
    }

    pub async fn restart(&self) -> Result<(), RestartError> {
        let Some(command) = &self.command else {
            warn!("no restart command configured, relying on the client to apply the port live");
            return Ok(());
        };

        info!(command = %command, "restarting client");
        self.executor.run(command).await.map_err(|source| RestartError {
            command: command.clone(),
            source,
        })
    }
}

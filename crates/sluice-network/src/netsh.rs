//! Privileged `netsh` commands run inside a container.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{NetworkError, NetworkResult};
use crate::host::ContainerShell;

/// Default bound on a single in-container command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs `netsh` inside one container with a bounded wait.
#[derive(Clone)]
pub struct NetshRunner {
    shell: Arc<dyn ContainerShell>,
    handle: String,
    timeout: Duration,
}

impl NetshRunner {
    /// Create a runner for the container `handle`.
    pub fn new(shell: Arc<dyn ContainerShell>, handle: &str) -> Self {
        Self {
            shell,
            handle: handle.to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Set the command timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `netsh <args>` in the container.
    ///
    /// # Errors
    ///
    /// Fails when the command cannot be started, does not finish within the
    /// timeout, or exits non-zero.
    pub async fn run_container(&self, args: &[String]) -> NetworkResult<()> {
        let command_line = format!("netsh {}", args.join(" "));
        tracing::info!(handle = %self.handle, command = %command_line, "Running command in container");

        let exit_code = tokio::time::timeout(
            self.timeout,
            self.shell.exec(&self.handle, &command_line),
        )
        .await
        .map_err(|_| NetworkError::CommandTimeout {
            command_line: command_line.clone(),
            handle: self.handle.clone(),
            timeout: self.timeout,
        })??;

        if exit_code != 0 {
            let err = NetworkError::CommandFailed {
                command_line,
                handle: self.handle.clone(),
                exit_code,
            };
            tracing::error!(error = %err, "Container command failed");
            return Err(err);
        }

        Ok(())
    }

    /// Grant the container's unprivileged users the right to serve HTTP on
    /// `port`.
    ///
    /// # Errors
    ///
    /// See [`NetshRunner::run_container`].
    pub async fn open_port(&self, port: u32) -> NetworkResult<()> {
        let args = [
            "http".to_string(),
            "add".to_string(),
            "urlacl".to_string(),
            format!("url=http://*:{port}/"),
            "user=Users".to_string(),
        ];
        self.run_container(&args).await
    }
}

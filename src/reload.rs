//! Driving nginx after a configuration change
//!
//! Runs the configured verify and reload commands, waits for them with a
//! deadline and classifies the result. Failures are always returned; the
//! caller decides how to surface them.

use crate::config::Settings;
use crate::error::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Runs nginx control commands
#[derive(Debug, Clone)]
pub struct ReloadCoordinator {
    reload_command: Vec<String>,
    verify_command: Option<Vec<String>>,
    timeout: Duration,
}

impl ReloadCoordinator {
    pub fn new(reload_command: Vec<String>, timeout: Duration) -> Self {
        Self {
            reload_command,
            verify_command: None,
            timeout,
        }
    }

    /// Check the configuration with `command` before every reload
    pub fn with_verify(mut self, command: Vec<String>) -> Self {
        self.verify_command = Some(command);
        self
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let coordinator = Self::new(settings.reload_command()?, settings.proxy.reload_timeout());
        Ok(match settings.verify_command()? {
            Some(verify) => coordinator.with_verify(verify),
            None => coordinator,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ask nginx to adopt the configuration on disk
    ///
    /// When a verify command is configured it runs first, and a rejected
    /// configuration is reported without signalling nginx.
    pub async fn reload(&self) -> Result<()> {
        self.verify().await?;
        self.run(&self.reload_command).await?;
        info!("nginx reloaded");
        Ok(())
    }

    /// Run the verify command, if any
    pub async fn verify(&self) -> Result<()> {
        match &self.verify_command {
            Some(command) => {
                self.run(command).await?;
                debug!("nginx configuration verified");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn run(&self, argv: &[String]) -> Result<()> {
        let command = shell_words::join(argv);
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::ReloadExecution {
                command,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
            });
        };

        debug!(command = %command, "Running nginx control command");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| {
            error!(command = %command, error = %source, "Could not start nginx control command");
            Error::ReloadExecution {
                command: command.clone(),
                source,
            }
        })?;

        // Dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                error!(command = %command, error = %source, "Error waiting for nginx control command");
                return Err(Error::ReloadExecution { command, source });
            }
            Err(_) => {
                warn!(
                    command = %command,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "nginx control command timed out; killing it"
                );
                return Err(Error::ReloadTimeout {
                    command,
                    timeout: self.timeout,
                });
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim();

        if output.status.success() {
            if !combined.is_empty() {
                debug!(command = %command, output = combined, "nginx control command output");
            }
            return Ok(());
        }

        let diagnostic = if combined.is_empty() {
            format!("'{}' exited with {}", command, output.status)
        } else {
            combined.to_string()
        };
        error!(command = %command, status = %output.status, diagnostic = %diagnostic, "nginx rejected the configuration");
        Err(Error::ConfigValidation { diagnostic })
    }
}

//! External command execution and service control
//!
//! Every process the panel starts goes through [`CommandRunner`], so each
//! invocation is checked, bounded by a timeout and visible in logs. Tests
//! swap in a scripted runner.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ServiceSettings;
use crate::error::{PanelError, PanelResult};
use crate::protocol::{ProtocolKind, ReloadStrategy};
use crate::validation;

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convenience constructor for scripted runners
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }
}

/// Runs one external program to completion
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, feeding `stdin` if given
    ///
    /// A non-zero exit is not an error here; spawn failures and timeouts are.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<String>,
        timeout: Duration,
    ) -> PanelResult<CommandOutput>;
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<String>,
        timeout: Duration,
    ) -> PanelResult<CommandOutput> {
        let described = describe(program, args);
        debug!("Running: {}", described);

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PanelError::CommandFailed {
                cmd: described.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            // Closing the pipe signals EOF to tools like chpasswd
            drop(pipe);
        }

        // Dropping the future on timeout drops the child, which kills it
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| PanelError::Timeout(format!("'{}' did not finish within {:?}", described, timeout)))??;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn describe(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Which unit to reload and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadTarget {
    pub unit: String,
    pub strategy: ReloadStrategy,
}

impl ReloadTarget {
    /// Target taken straight from a kind's descriptor
    pub fn for_kind(kind: ProtocolKind) -> Self {
        let descriptor = kind.descriptor();
        Self {
            unit: descriptor.service.to_string(),
            strategy: descriptor.reload,
        }
    }
}

/// Service control boundary shared by all adapters
pub struct ServiceController {
    runner: Arc<dyn CommandRunner>,
    reload_timeout: Duration,
    command_timeout: Duration,
}

impl ServiceController {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &ServiceSettings) -> Self {
        Self {
            runner,
            reload_timeout: settings.reload_timeout(),
            command_timeout: settings.command_timeout(),
        }
    }

    /// Controller backed by the real host
    pub fn system(settings: &ServiceSettings) -> Self {
        Self::new(Arc::new(SystemRunner), settings)
    }

    /// Run a command, returning its output whatever the exit code
    pub async fn exec(&self, program: &str, args: &[&str], stdin: Option<String>) -> PanelResult<CommandOutput> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run(program, &args, stdin, self.command_timeout).await
    }

    /// Run a command and fail on a non-zero exit
    pub async fn exec_checked(&self, program: &str, args: &[&str], stdin: Option<String>) -> PanelResult<CommandOutput> {
        let output = self.exec(program, args, stdin).await?;
        if !output.success() {
            let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            return Err(PanelError::CommandFailed {
                cmd: describe(program, &owned),
                code: output.code,
                stderr: validation::sanitize_error_message(&output.stderr),
            });
        }
        Ok(output)
    }

    /// Make the service behind `kind` pick up changed configuration
    ///
    /// Every failure, including exceeding the reload timeout, is reported
    /// as [`PanelError::ServiceReload`].
    pub async fn reload(&self, kind: ProtocolKind, target: &ReloadTarget) -> PanelResult<()> {
        let (program, args): (&str, Vec<String>) = match target.strategy {
            ReloadStrategy::Live => {
                debug!("{} reads its configuration live, no reload needed", kind);
                return Ok(());
            }
            ReloadStrategy::SystemdReload => (
                "systemctl",
                vec!["reload".to_string(), target.unit.clone()],
            ),
            ReloadStrategy::Command(cmd) => match cmd.split_first() {
                Some((program, rest)) => (*program, rest.iter().map(|a| a.to_string()).collect()),
                None => return Err(PanelError::service_reload(kind, "empty reload command")),
            },
        };

        let output = self
            .runner
            .run(program, &args, None, self.reload_timeout)
            .await
            .map_err(|e| PanelError::service_reload(kind, e))?;

        if !output.success() {
            return Err(PanelError::service_reload(
                kind,
                format!(
                    "'{}' exited with {:?}: {}",
                    describe(program, &args),
                    output.code,
                    validation::sanitize_error_message(&output.stderr)
                ),
            ));
        }

        debug!("Reloaded {} ({})", kind, target.unit);
        Ok(())
    }

    /// Liveness check through the service manager
    pub async fn is_active(&self, unit: &str) -> bool {
        match self.exec("systemctl", &["is-active", "--quiet", unit], None).await {
            Ok(output) => output.success(),
            Err(e) => {
                warn!("Could not query {}: {}", unit, e);
                false
            }
        }
    }

    /// Check if a binary is available in the system PATH
    pub async fn binary_available(&self, binary: &str) -> bool {
        match self.exec("which", &[binary], None).await {
            Ok(output) => output.success(),
            Err(_) => false,
        }
    }
}

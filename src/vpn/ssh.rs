//! SSH tunnel accounts as locked-down system users
//!
//! Accounts get no home directory and `/bin/false` as shell, so they can
//! only open tunnels. Users are tagged with a GECOS marker; system users
//! without it are never modified.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{PanelConfig, SecuritySettings};
use crate::error::{PanelError, PanelResult};
use crate::protocol::{AdapterStatus, GrantSecret, ProtocolKind};
use crate::validation;
use super::adapter::{self, ProtocolAdapter};
use super::service::{ReloadTarget, ServiceController};

const KIND: ProtocolKind = ProtocolKind::Ssh;

/// GECOS comment identifying users owned by the panel
pub const GECOS_MARKER: &str = "vpnpanel";

/// What `getent passwd` says about a name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemUser {
    Absent,
    Managed,
    Foreign,
}

/// SSH adapter
pub struct SshAdapter {
    service: Arc<ServiceController>,
    reload: ReloadTarget,
    lock: Mutex<()>,
}

impl SshAdapter {
    pub fn new(service: Arc<ServiceController>) -> Self {
        Self {
            service,
            reload: ReloadTarget::for_kind(KIND),
            lock: Mutex::new(()),
        }
    }

    async fn lookup(&self, username: &str) -> PanelResult<SystemUser> {
        let output = self
            .service
            .exec("getent", &["passwd", username], None)
            .await
            .map_err(|e| PanelError::config_write(KIND, e))?;

        match output.code {
            Some(0) => {
                // name:passwd:uid:gid:gecos:home:shell
                let gecos = output
                    .stdout
                    .lines()
                    .next()
                    .and_then(|line| line.split(':').nth(4))
                    .unwrap_or("");
                if gecos.split(',').next() == Some(GECOS_MARKER) {
                    Ok(SystemUser::Managed)
                } else {
                    Ok(SystemUser::Foreign)
                }
            }
            Some(2) => Ok(SystemUser::Absent),
            code => Err(PanelError::config_write(
                KIND,
                format!("getent passwd {} exited with {:?}", username, code),
            )),
        }
    }

    async fn run_step(&self, program: &str, args: &[&str], stdin: Option<String>) -> PanelResult<()> {
        self.service
            .exec_checked(program, args, stdin)
            .await
            .map(|_| ())
            .map_err(|e| PanelError::config_write(KIND, e))
    }
}

#[async_trait]
impl ProtocolAdapter for SshAdapter {
    fn kind(&self) -> ProtocolKind {
        KIND
    }

    fn issue_secret(&self, security: &SecuritySettings) -> PanelResult<GrantSecret> {
        adapter::issue_password(security)
    }

    async fn materialize(&self, username: &str, secret: &GrantSecret) -> PanelResult<GrantSecret> {
        let password = adapter::expect_password(KIND, secret)?;
        validation::validate_config_value(password)?;
        if password.contains(':') {
            return Err(PanelError::InvalidParameter("SSH password cannot contain ':'".to_string()));
        }

        let _guard = self.lock.lock().await;

        let created = match self.lookup(username).await? {
            SystemUser::Foreign => {
                return Err(PanelError::config_write(
                    KIND,
                    format!("system user '{}' exists and is not managed by vpnpanel", username),
                ));
            }
            SystemUser::Managed => false,
            SystemUser::Absent => {
                self.run_step("useradd", &["-M", "-s", "/bin/false", "-c", GECOS_MARKER, username], None)
                    .await?;
                true
            }
        };

        let input = format!("{}:{}\n", username, password);
        if let Err(e) = self.run_step("chpasswd", &[], Some(input)).await {
            if created {
                if let Err(cleanup) = self.service.exec_checked("userdel", &[username], None).await {
                    warn!("Could not remove half-created user {}: {}", username, cleanup);
                }
            }
            return Err(e);
        }

        info!("Materialized SSH account for {}", username);
        Ok(secret.clone())
    }

    async fn revoke(&self, username: &str) -> PanelResult<()> {
        let _guard = self.lock.lock().await;

        match self.lookup(username).await? {
            SystemUser::Absent => return Ok(()),
            SystemUser::Foreign => {
                return Err(PanelError::config_write(
                    KIND,
                    format!("refusing to remove unmanaged system user '{}'", username),
                ));
            }
            SystemUser::Managed => {}
        }

        // pkill exits 1 when no process matched
        let output = self
            .service
            .exec("pkill", &["-KILL", "-u", username], None)
            .await
            .map_err(|e| PanelError::config_write(KIND, e))?;
        if !matches!(output.code, Some(0) | Some(1)) {
            warn!("pkill for {} exited with {:?}", username, output.code);
        }

        self.run_step("userdel", &[username], None).await?;
        info!("Revoked SSH account for {}", username);
        Ok(())
    }

    async fn check_status(&self, username: &str) -> AdapterStatus {
        match self.lookup(username).await {
            Ok(SystemUser::Managed) => AdapterStatus::Active,
            Ok(SystemUser::Absent) => AdapterStatus::Inactive,
            Ok(SystemUser::Foreign) => AdapterStatus::Unknown,
            Err(e) => {
                warn!("Cannot look up {}: {}", username, e);
                AdapterStatus::Unknown
            }
        }
    }

    async fn service_running(&self) -> bool {
        self.service.is_active(&self.reload.unit).await
    }

    async fn is_installed(&self) -> bool {
        self.service.binary_available(KIND.descriptor().binary).await
    }
}

/// Factory function to create an SSH adapter
pub fn create_adapter(_config: &PanelConfig, service: Arc<ServiceController>) -> PanelResult<Arc<dyn ProtocolAdapter>> {
    Ok(Arc::new(SshAdapter::new(service)))
}

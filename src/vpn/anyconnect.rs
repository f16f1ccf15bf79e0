//! Cisco AnyConnect accounts through ocserv's plain password file
//!
//! The file is owned by `ocpasswd`, which hashes passwords itself, so this
//! adapter only drives the tool and reads the file to check state.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{PanelConfig, SecuritySettings};
use crate::error::{PanelError, PanelResult};
use crate::protocol::{AdapterStatus, GrantSecret, ProtocolKind};
use crate::validation;
use super::adapter::{self, ProtocolAdapter};
use super::common::NativeFile;
use super::service::{ReloadTarget, ServiceController};

const KIND: ProtocolKind = ProtocolKind::AnyConnect;

/// AnyConnect (ocserv) adapter
pub struct AnyConnectAdapter {
    file: NativeFile,
    service: Arc<ServiceController>,
    reload: ReloadTarget,
    lock: Mutex<()>,
}

impl AnyConnectAdapter {
    pub fn new(config: &PanelConfig, service: Arc<ServiceController>) -> Self {
        Self {
            file: NativeFile::new(KIND, &config.paths.ocserv_passwd, 0o600),
            service,
            reload: ReloadTarget::for_kind(KIND),
            lock: Mutex::new(()),
        }
    }

    fn path_arg(&self) -> PanelResult<&str> {
        self.file
            .path()
            .to_str()
            .ok_or_else(|| PanelError::config_write(KIND, "password file path is not valid UTF-8"))
    }

    /// `user:group:hash` lines keyed by the first field
    fn has_entry(content: &str, username: &str) -> bool {
        content
            .lines()
            .any(|line| line.split(':').next() == Some(username))
    }

    /// Reload, putting `snapshot` back if the service rejects the change
    async fn reload_or_restore(&self, snapshot: Option<&str>) -> PanelResult<()> {
        if let Err(e) = self.service.reload(KIND, &self.reload).await {
            self.file.rollback(snapshot).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolAdapter for AnyConnectAdapter {
    fn kind(&self) -> ProtocolKind {
        KIND
    }

    fn issue_secret(&self, security: &SecuritySettings) -> PanelResult<GrantSecret> {
        adapter::issue_password(security)
    }

    async fn materialize(&self, username: &str, secret: &GrantSecret) -> PanelResult<GrantSecret> {
        let password = adapter::expect_password(KIND, secret)?;
        validation::validate_config_value(password)?;
        let path = self.path_arg()?;

        let _guard = self.lock.lock().await;
        let snapshot = self.file.read().await?;

        // ocpasswd prompts twice for the password
        let input = format!("{}\n{}\n", password, password);
        if let Err(e) = self.service.exec_checked("ocpasswd", &["-c", path, username], Some(input)).await {
            self.file.rollback(snapshot.as_deref()).await;
            return Err(PanelError::config_write(KIND, e));
        }

        self.reload_or_restore(snapshot.as_deref()).await?;
        info!("Materialized AnyConnect account for {}", username);
        Ok(secret.clone())
    }

    async fn revoke(&self, username: &str) -> PanelResult<()> {
        let path = self.path_arg()?;

        let _guard = self.lock.lock().await;
        let snapshot = self.file.read().await?;
        if !snapshot.as_deref().is_some_and(|c| Self::has_entry(c, username)) {
            debug!("No AnyConnect entry for {}", username);
            return Ok(());
        }

        self.service
            .exec_checked("ocpasswd", &["-c", path, "-d", username], None)
            .await
            .map_err(|e| PanelError::config_write(KIND, e))?;

        match self.service.exec("occtl", &["disconnect", "user", username], None).await {
            Ok(output) if !output.success() => debug!("No live AnyConnect session for {}", username),
            Ok(_) => info!("Disconnected AnyConnect sessions of {}", username),
            Err(e) => warn!("Could not disconnect {}: {}", username, e),
        }

        self.reload_or_restore(snapshot.as_deref()).await?;
        info!("Revoked AnyConnect account for {}", username);
        Ok(())
    }

    async fn check_status(&self, username: &str) -> AdapterStatus {
        match self.file.read().await {
            Ok(Some(content)) if Self::has_entry(&content, username) => AdapterStatus::Active,
            Ok(_) => AdapterStatus::Inactive,
            Err(e) => {
                warn!("Cannot inspect ocserv password file: {}", e);
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

/// Factory function to create an AnyConnect adapter
pub fn create_adapter(config: &PanelConfig, service: Arc<ServiceController>) -> PanelResult<Arc<dyn ProtocolAdapter>> {
    Ok(Arc::new(AnyConnectAdapter::new(config, service)))
}

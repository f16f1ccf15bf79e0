//! IKEv2/IPsec identities in strongSwan's `ipsec.secrets`
//!
//! Each account gets an identity-keyed line `"user" : PSK "<psk>"`. Server
//! keys (`: RSA ...`) and wildcard PSKs are left alone.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{PanelConfig, SecuritySettings};
use crate::error::PanelResult;
use crate::protocol::{AdapterStatus, GrantSecret, ProtocolKind};
use crate::secrets;
use crate::validation;
use super::adapter::{self, ProtocolAdapter};
use super::common::{self, NativeFile};
use super::service::{ReloadTarget, ServiceController};

const KIND: ProtocolKind = ProtocolKind::Ikev2Ipsec;

/// IKEv2/IPsec adapter
pub struct IpsecAdapter {
    file: NativeFile,
    service: Arc<ServiceController>,
    reload: ReloadTarget,
    lock: Mutex<()>,
}

impl IpsecAdapter {
    pub fn new(config: &PanelConfig, service: Arc<ServiceController>) -> Self {
        Self {
            file: NativeFile::new(KIND, &config.paths.ipsec_secrets, 0o600),
            service,
            reload: ReloadTarget::for_kind(KIND),
            lock: Mutex::new(()),
        }
    }

    /// Any secret type keyed by exactly this identity belongs to the account
    fn owns(username: &str, line: &str) -> bool {
        if common::is_comment_or_blank(line) {
            return false;
        }
        let tokens = common::split_quoted(line);
        tokens.len() >= 2 && tokens[0] == username && tokens[1] == ":"
    }
}

#[async_trait]
impl ProtocolAdapter for IpsecAdapter {
    fn kind(&self) -> ProtocolKind {
        KIND
    }

    fn issue_secret(&self, security: &SecuritySettings) -> PanelResult<GrantSecret> {
        Ok(GrantSecret::Psk {
            psk: secrets::generate_psk(security.psk_bytes)?,
        })
    }

    async fn materialize(&self, username: &str, secret: &GrantSecret) -> PanelResult<GrantSecret> {
        let psk = match secret {
            GrantSecret::Psk { psk } => psk,
            other => return Err(adapter::wrong_material(KIND, other)),
        };
        validation::validate_config_value(psk)?;
        let line = format!("\"{}\" : PSK \"{}\"", username, psk);

        let _guard = self.lock.lock().await;
        self.file
            .edit(&self.service, &self.reload, |content| {
                Ok((common::upsert_line(content, |l| Self::owns(username, l), &line), ()))
            })
            .await?;

        info!("Materialized IKEv2 identity for {}", username);
        Ok(secret.clone())
    }

    async fn revoke(&self, username: &str) -> PanelResult<()> {
        let _guard = self.lock.lock().await;
        let removed = self
            .file
            .edit(&self.service, &self.reload, |content| {
                Ok(common::remove_lines(content, |l| Self::owns(username, l)))
            })
            .await?;

        if removed > 0 {
            info!("Revoked IKEv2 identity for {}", username);
        }
        Ok(())
    }

    async fn check_status(&self, username: &str) -> AdapterStatus {
        match self.file.read().await {
            Ok(Some(content)) if content.lines().any(|l| Self::owns(username, l)) => AdapterStatus::Active,
            Ok(_) => AdapterStatus::Inactive,
            Err(e) => {
                warn!("Cannot inspect ipsec.secrets: {}", e);
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

/// Factory function to create an IKEv2/IPsec adapter
pub fn create_adapter(config: &PanelConfig, service: Arc<ServiceController>) -> PanelResult<Arc<dyn ProtocolAdapter>> {
    Ok(Arc::new(IpsecAdapter::new(config, service)))
}

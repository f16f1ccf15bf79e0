//! L2TP/IPsec accounts in pppd's `chap-secrets`
//!
//! One line per account: `"user" <server> "password" *`. pppd reads the file
//! for every new session, so no reload is needed.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{PanelConfig, SecuritySettings};
use crate::error::PanelResult;
use crate::protocol::{AdapterStatus, GrantSecret, ProtocolKind};
use crate::validation;
use super::adapter::{self, ProtocolAdapter};
use super::common::{self, NativeFile};
use super::service::{ReloadTarget, ServiceController};

const KIND: ProtocolKind = ProtocolKind::L2tpIpsec;

/// L2TP/IPsec adapter
pub struct L2tpAdapter {
    file: NativeFile,
    server_name: String,
    service: Arc<ServiceController>,
    reload: ReloadTarget,
    lock: Mutex<()>,
}

impl L2tpAdapter {
    pub fn new(config: &PanelConfig, service: Arc<ServiceController>) -> Self {
        Self {
            file: NativeFile::new(KIND, &config.paths.chap_secrets, 0o600),
            server_name: config.l2tp.server_name.clone(),
            service,
            reload: ReloadTarget::for_kind(KIND),
            lock: Mutex::new(()),
        }
    }

    fn owns(&self, username: &str, line: &str) -> bool {
        if common::is_comment_or_blank(line) {
            return false;
        }
        let tokens = common::split_quoted(line);
        tokens.len() >= 2 && tokens[0] == username && tokens[1] == self.server_name
    }

    fn entry(&self, username: &str, password: &str) -> String {
        format!("\"{}\" {} \"{}\" *", username, self.server_name, password)
    }
}

#[async_trait]
impl ProtocolAdapter for L2tpAdapter {
    fn kind(&self) -> ProtocolKind {
        KIND
    }

    fn issue_secret(&self, security: &SecuritySettings) -> PanelResult<GrantSecret> {
        adapter::issue_password(security)
    }

    async fn materialize(&self, username: &str, secret: &GrantSecret) -> PanelResult<GrantSecret> {
        let password = adapter::expect_password(KIND, secret)?;
        validation::validate_config_value(password)?;
        let line = self.entry(username, password);

        let _guard = self.lock.lock().await;
        self.file
            .edit(&self.service, &self.reload, |content| {
                Ok((common::upsert_line(content, |l| self.owns(username, l), &line), ()))
            })
            .await?;

        info!("Materialized L2TP/IPsec account for {}", username);
        Ok(secret.clone())
    }

    async fn revoke(&self, username: &str) -> PanelResult<()> {
        let _guard = self.lock.lock().await;
        let removed = self
            .file
            .edit(&self.service, &self.reload, |content| {
                Ok(common::remove_lines(content, |l| self.owns(username, l)))
            })
            .await?;

        if removed > 0 {
            info!("Revoked L2TP/IPsec account for {}", username);
        }
        Ok(())
    }

    async fn check_status(&self, username: &str) -> AdapterStatus {
        match self.file.read().await {
            Ok(Some(content)) if content.lines().any(|l| self.owns(username, l)) => AdapterStatus::Active,
            Ok(_) => AdapterStatus::Inactive,
            Err(e) => {
                warn!("Cannot inspect chap-secrets: {}", e);
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

/// Factory function to create an L2TP/IPsec adapter
pub fn create_adapter(config: &PanelConfig, service: Arc<ServiceController>) -> PanelResult<Arc<dyn ProtocolAdapter>> {
    Ok(Arc::new(L2tpAdapter::new(config, service)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PanelError;
    use crate::vpn::service::MockCommandRunner;

    fn adapter(dir: &std::path::Path) -> L2tpAdapter {
        let config = PanelConfig::rooted_at(dir);
        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();
        let service = Arc::new(ServiceController::new(Arc::new(runner), &config.service));
        L2tpAdapter::new(&config, service)
    }

    fn password(p: &str) -> GrantSecret {
        GrantSecret::Password { password: p.to_string() }
    }

    #[tokio::test]
    async fn test_materialize_replaces_and_keeps_other_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chap-secrets");
        std::fs::write(
            &path,
            "# Secrets for authentication using CHAP\n\"bob\" l2tpd \"Bob-pass-123\" *\n\"alice\" l2tpd \"old\" *\n\"alice\" l2tpd \"older\" *\n\"alice\" pptpd \"other\" *\n",
        )
        .unwrap();

        let adapter = adapter(dir.path());
        adapter.materialize("alice", &password("N3w!password")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "# Secrets for authentication using CHAP\n\"bob\" l2tpd \"Bob-pass-123\" *\n\"alice\" l2tpd \"N3w!password\" *\n\"alice\" pptpd \"other\" *\n"
        );
        assert_eq!(adapter.check_status("alice").await, AdapterStatus::Active);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());

        adapter.revoke("alice").await.unwrap();
        adapter.materialize("alice", &password("Pa55word!xyz")).await.unwrap();
        adapter.revoke("alice").await.unwrap();
        let after_first = std::fs::read_to_string(dir.path().join("chap-secrets")).unwrap();
        adapter.revoke("alice").await.unwrap();
        let after_second = std::fs::read_to_string(dir.path().join("chap-secrets")).unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(adapter.check_status("alice").await, AdapterStatus::Inactive);
    }

    #[tokio::test]
    async fn test_rejects_injection_and_wrong_material() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());

        assert!(adapter.materialize("alice", &password("x\" * \n\"root")).await.is_err());
        let err = adapter
            .materialize("alice", &GrantSecret::Psk { psk: "abc".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, PanelError::ConfigWrite { kind: ProtocolKind::L2tpIpsec, .. }));
        assert!(!dir.path().join("chap-secrets").exists());
    }

    #[tokio::test]
    async fn test_file_mode_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let adapter = adapter(dir.path());
        adapter.materialize("carol", &password("Pa55word!xyz")).await.unwrap();

        let mode = std::fs::metadata(dir.path().join("chap-secrets")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

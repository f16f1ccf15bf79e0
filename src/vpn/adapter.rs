use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{PanelConfig, SecuritySettings};
use crate::error::{PanelError, PanelResult};
use crate::protocol::{AdapterStatus, GrantSecret, ProtocolKind};
use crate::secrets;
use super::service::ServiceController;

/// Common interface that every protocol adapter implements
///
/// An adapter owns one protocol's native configuration: it upserts and
/// removes entries keyed by username and makes the backing service pick up
/// the change. Implementations serialize their own file edits and reloads.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Protocol this adapter manages
    fn kind(&self) -> ProtocolKind;

    /// Fresh secret material of the right shape for this protocol
    fn issue_secret(&self, security: &SecuritySettings) -> PanelResult<GrantSecret>;

    /// Write or replace the native entry for `username` and reload
    ///
    /// Returns the material actually in effect, which may carry details
    /// filled in by the adapter (e.g. an allocated tunnel address).
    async fn materialize(&self, username: &str, secret: &GrantSecret) -> PanelResult<GrantSecret>;

    /// Remove every native entry for `username`; succeeds if none exists
    async fn revoke(&self, username: &str) -> PanelResult<()>;

    /// What the native configuration currently says about `username`
    async fn check_status(&self, username: &str) -> AdapterStatus;

    /// Whether the backing service is up
    async fn service_running(&self) -> bool;

    /// Whether the protocol's software is present on the host
    async fn is_installed(&self) -> bool;
}

/// Factory function type for creating adapters from the panel configuration
pub type AdapterFactory = fn(&PanelConfig, Arc<ServiceController>) -> PanelResult<Arc<dyn ProtocolAdapter>>;

/// Generated password material for the password-based protocols
pub(crate) fn issue_password(security: &SecuritySettings) -> PanelResult<GrantSecret> {
    Ok(GrantSecret::Password {
        password: secrets::generate_password(security.generated_password_length)?,
    })
}

/// Pull the password out of `secret`, rejecting other material
pub(crate) fn expect_password(kind: ProtocolKind, secret: &GrantSecret) -> PanelResult<&str> {
    match secret {
        GrantSecret::Password { password } => Ok(password),
        other => Err(wrong_material(kind, other)),
    }
}

pub(crate) fn wrong_material(kind: ProtocolKind, secret: &GrantSecret) -> PanelError {
    let found = match secret {
        GrantSecret::Password { .. } => "password",
        GrantSecret::Psk { .. } => "psk",
        GrantSecret::WireGuard { .. } => "wireguard",
    };
    PanelError::config_write(kind, format!("unexpected {} material", found))
}

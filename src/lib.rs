//! vpnpanel - Multi-protocol VPN account provisioning
//!
//! Async library that keeps a central account store and the native
//! configuration of several VPN subsystems in sync:
//! - SSH tunnels (system accounts)
//! - L2TP/IPsec (pppd chap-secrets)
//! - IKEv2/IPsec (strongSwan ipsec.secrets)
//! - WireGuard (interface peers)
//! - Cisco AnyConnect (ocserv password file)
//!
//! Includes the credential store, secret generation, the provisioning
//! orchestrator and a health reporter.

pub mod error;
pub mod validation;
pub mod config;
pub mod protocol;
pub mod secrets;
pub mod store;
pub mod vpn;
pub mod provisioner;
pub mod status;

// Re-export commonly used types
pub use error::{PanelError, PanelResult};
pub use config::PanelConfig;
pub use protocol::{
    Account, AccountRole, AdapterStatus, GrantSecret, GrantStatus, ProtocolDescriptor,
    ProtocolGrant, ProtocolKind, ReloadStrategy, Session,
};
pub use store::{AccountUpdate, CredentialStore, GrantFields};
pub use vpn::{AdapterRegistry, CommandOutput, CommandRunner, ProtocolAdapter, ServiceController};
pub use provisioner::{DeleteReport, GrantOutcome, ProvisionReport, Provisioner, UserRecord};
pub use status::{Drift, KindHealth, StatusReporter};

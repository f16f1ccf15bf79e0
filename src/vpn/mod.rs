//! Protocol adapters for vpnpanel
//!
//! This module provides a unified interface for provisioning accounts into
//! the native configuration of each supported VPN technology: SSH tunnels,
//! L2TP/IPsec, IKEv2/IPsec, WireGuard and Cisco AnyConnect (ocserv).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Provisioner (grant state machine)    │
//! └──────────────────────┬──────────────────────┘
//!                        │  AdapterRegistry
//!    ┌─────────┬─────────┼─────────┬──────────┐
//!    ▼         ▼         ▼         ▼          ▼
//! ┌─────┐  ┌──────┐  ┌───────┐  ┌────┐  ┌──────────┐
//! │ SSH │  │ L2TP │  │ IKEv2 │  │ WG │  │AnyConnect│  <- Adapters
//! └──┬──┘  └──┬───┘  └───┬───┘  └─┬──┘  └────┬─────┘
//!    └────────┴──────────┴────────┴──────────┘
//!                        │
//!              ServiceController (commands, reloads)
//! ```
//!
//! Each adapter implements the `ProtocolAdapter` trait. Adapters own a lock
//! over their native files, edit them by username (never by blind append),
//! and restore the previous content if the service fails to reload.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use libvpnpanel::config::PanelConfig;
//! use libvpnpanel::protocol::ProtocolKind;
//! use libvpnpanel::vpn::{AdapterRegistry, ServiceController};
//!
//! # async fn demo() -> libvpnpanel::error::PanelResult<()> {
//! let config = PanelConfig::default();
//! let service = Arc::new(ServiceController::system(&config.service));
//! let registry = AdapterRegistry::with_system_defaults(&config, service)?;
//!
//! let wireguard = registry.get(ProtocolKind::WireGuard)?;
//! let secret = wireguard.issue_secret(&config.security)?;
//! wireguard.materialize("alice", &secret).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod anyconnect;
pub mod common;
pub mod ipsec;
pub mod l2tp;
pub mod registry;
pub mod service;
pub mod ssh;
pub mod wireguard;

pub use adapter::{AdapterFactory, ProtocolAdapter};
pub use registry::AdapterRegistry;
pub use service::{CommandOutput, CommandRunner, ReloadTarget, ServiceController, SystemRunner};

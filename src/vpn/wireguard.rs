//! WireGuard peers in the interface configuration (`wg0.conf`)
//!
//! Every account owns one `[Peer]` block tagged with a
//! `# vpnpanel-user: <name>` comment. The file is parsed into sections and
//! rendered back in a canonical layout, so removing and re-adding a peer
//! yields the same bytes. Tunnel addresses come from the configured IPv4
//! pool; the first host of the pool belongs to the server.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{PanelConfig, SecuritySettings, WireGuardSettings};
use crate::error::{PanelError, PanelResult};
use crate::protocol::{AdapterStatus, GrantSecret, ProtocolKind, ReloadStrategy};
use crate::secrets;
use crate::validation;
use super::adapter::{self, ProtocolAdapter};
use super::common::NativeFile;
use super::service::{ReloadTarget, ServiceController};

const KIND: ProtocolKind = ProtocolKind::WireGuard;

/// Comment tag identifying the account a peer block belongs to
pub const PEER_MARKER: &str = "vpnpanel-user:";

/// WireGuard preshared keys are exactly 32 bytes
const WG_KEY_BYTES: usize = 32;

/// IPv4 pool peer addresses are allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPool {
    network: u32,
    prefix: u8,
}

impl AddressPool {
    /// Parse CIDR notation such as `10.8.0.0/24`
    pub fn parse(cidr: &str) -> PanelResult<Self> {
        let (addr, prefix) = cidr
            .trim()
            .split_once('/')
            .ok_or_else(|| PanelError::InvalidParameter(format!("Address pool '{}' is not in CIDR notation", cidr)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| PanelError::InvalidParameter(format!("Invalid pool address '{}'", addr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| PanelError::InvalidParameter(format!("Invalid pool prefix '{}'", prefix)))?;

        // Need room for network, server, at least one peer and broadcast
        if !(1..=30).contains(&prefix) {
            return Err(PanelError::InvalidParameter(format!(
                "Pool prefix must be between /1 and /30, got /{}",
                prefix
            )));
        }

        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }

    fn broadcast(&self) -> u32 {
        self.network | (u32::MAX >> self.prefix)
    }

    /// Address reserved for the server side of the tunnel
    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network + 1)
    }

    /// Whether `addr` can be handed to a peer
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        addr > self.network + 1 && addr < self.broadcast()
    }

    /// Lowest peer address not in `used`
    pub fn allocate(&self, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        (self.network + 2..self.broadcast())
            .map(Ipv4Addr::from)
            .find(|addr| !used.contains(addr))
    }
}

/// One `[Section]` of a WireGuard config, header line included
#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    lines: Vec<String>,
}

impl Section {
    fn is_peer(&self) -> bool {
        self.lines
            .first()
            .is_some_and(|header| header.trim().eq_ignore_ascii_case("[Peer]"))
    }

    fn is_interface(&self) -> bool {
        self.lines
            .first()
            .is_some_and(|header| header.trim().eq_ignore_ascii_case("[Interface]"))
    }

    fn owner(&self) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.trim()
                .strip_prefix('#')
                .and_then(|comment| comment.trim().strip_prefix(PEER_MARKER))
                .map(str::trim)
        })
    }

    fn owned_by(&self, username: &str) -> bool {
        self.is_peer() && self.owner() == Some(username)
    }

    /// Values of every `key = value` line matching `key`
    fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines.iter().filter_map(move |line| {
            let (k, v) = line.split_once('=')?;
            if k.trim().eq_ignore_ascii_case(key) {
                Some(v.trim())
            } else {
                None
            }
        })
    }

    /// IPv4 addresses listed in `key`, ignoring prefixes and IPv6 entries
    fn ipv4_values(&self, key: &str) -> Vec<Ipv4Addr> {
        self.values(key)
            .flat_map(|v| v.split(','))
            .filter_map(|entry| entry.trim().split('/').next()?.parse().ok())
            .collect()
    }
}

/// Parsed WireGuard configuration
#[derive(Debug, Clone, Default)]
struct WgDocument {
    preamble: Vec<String>,
    sections: Vec<Section>,
}

impl WgDocument {
    fn parse(content: &str) -> Self {
        let mut doc = Self::default();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                doc.sections.push(Section { lines: vec![line.to_string()] });
            } else if let Some(section) = doc.sections.last_mut() {
                section.lines.push(line.to_string());
            } else {
                doc.preamble.push(line.to_string());
            }
        }
        doc
    }

    /// Canonical layout: blocks separated by one blank line, no trailing
    /// blank lines, newline at end of file
    fn render(&self) -> String {
        let blocks: Vec<String> = std::iter::once(&self.preamble)
            .chain(self.sections.iter().map(|s| &s.lines))
            .filter_map(|lines| {
                let end = lines.iter().rposition(|l| !l.trim().is_empty())?;
                Some(lines[..=end].join("\n"))
            })
            .collect();

        if blocks.is_empty() {
            return String::new();
        }
        let mut out = blocks.join("\n\n");
        out.push('\n');
        out
    }

    /// Drop every peer block owned by `username`
    fn remove_peer(&mut self, username: &str) -> usize {
        let before = self.sections.len();
        self.sections.retain(|s| !s.owned_by(username));
        before - self.sections.len()
    }

    /// Addresses already taken by the interface and every peer
    fn used_addresses(&self) -> HashSet<Ipv4Addr> {
        let mut used = HashSet::new();
        for section in &self.sections {
            if section.is_interface() {
                used.extend(section.ipv4_values("Address"));
            } else if section.is_peer() {
                used.extend(section.ipv4_values("AllowedIPs"));
            }
        }
        used
    }
}

fn peer_block(username: &str, public_key: &str, preshared_key: &str, address: Ipv4Addr) -> Section {
    Section {
        lines: vec![
            "[Peer]".to_string(),
            format!("# {} {}", PEER_MARKER, username),
            format!("PublicKey = {}", public_key),
            format!("PresharedKey = {}", preshared_key),
            format!("AllowedIPs = {}/32", address),
        ],
    }
}

fn check_key(name: &str, key: &str) -> PanelResult<()> {
    validation::validate_config_value(key)?;
    match STANDARD.decode(key) {
        Ok(bytes) if bytes.len() == WG_KEY_BYTES => Ok(()),
        _ => Err(PanelError::config_write(KIND, format!("{} is not a 32-byte base64 key", name))),
    }
}

/// WireGuard adapter
pub struct WireGuardAdapter {
    file: NativeFile,
    pool: AddressPool,
    service: Arc<ServiceController>,
    reload: ReloadTarget,
    lock: Mutex<()>,
}

impl WireGuardAdapter {
    pub fn new(config: &PanelConfig, service: Arc<ServiceController>) -> PanelResult<Self> {
        let settings = &config.wireguard;
        validation::validate_interface_name(&settings.interface)?;

        Ok(Self {
            file: NativeFile::new(KIND, &config.paths.wireguard_config, 0o600),
            pool: AddressPool::parse(&settings.address_pool)?,
            service,
            reload: ReloadTarget {
                unit: format!("wg-quick@{}", settings.interface),
                strategy: ReloadStrategy::SystemdReload,
            },
            lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl ProtocolAdapter for WireGuardAdapter {
    fn kind(&self) -> ProtocolKind {
        KIND
    }

    fn issue_secret(&self, _security: &SecuritySettings) -> PanelResult<GrantSecret> {
        let pair = secrets::generate_keypair();
        Ok(GrantSecret::WireGuard {
            private_key: pair.private_key,
            public_key: pair.public_key,
            preshared_key: secrets::generate_psk(WG_KEY_BYTES)?,
            address: None,
        })
    }

    async fn materialize(&self, username: &str, secret: &GrantSecret) -> PanelResult<GrantSecret> {
        let (private_key, public_key, preshared_key, requested) = match secret {
            GrantSecret::WireGuard { private_key, public_key, preshared_key, address } => {
                (private_key, public_key, preshared_key, address)
            }
            other => return Err(adapter::wrong_material(KIND, other)),
        };
        check_key("PublicKey", public_key)?;
        check_key("PresharedKey", preshared_key)?;
        if secrets::public_key_for(private_key)? != *public_key {
            return Err(PanelError::config_write(KIND, "public key does not match private key"));
        }
        let requested: Option<Ipv4Addr> = requested.as_deref().and_then(|a| a.split('/').next()?.parse().ok());

        let _guard = self.lock.lock().await;
        let pool = self.pool;
        let address = self
            .file
            .edit(&self.service, &self.reload, |content| {
                let mut doc = WgDocument::parse(content);
                doc.remove_peer(username);

                let used = doc.used_addresses();
                let address = match requested {
                    Some(addr) if pool.contains(addr) && !used.contains(&addr) => addr,
                    _ => pool.allocate(&used).ok_or_else(|| {
                        PanelError::config_write(KIND, "address pool exhausted")
                    })?,
                };

                doc.sections.push(peer_block(username, public_key, preshared_key, address));
                Ok((doc.render(), address))
            })
            .await?;

        info!("Materialized WireGuard peer for {} at {}", username, address);
        Ok(GrantSecret::WireGuard {
            private_key: private_key.clone(),
            public_key: public_key.clone(),
            preshared_key: preshared_key.clone(),
            address: Some(address.to_string()),
        })
    }

    async fn revoke(&self, username: &str) -> PanelResult<()> {
        let _guard = self.lock.lock().await;
        let removed = self
            .file
            .edit(&self.service, &self.reload, |content| {
                let mut doc = WgDocument::parse(content);
                match doc.remove_peer(username) {
                    0 => Ok((content.to_string(), 0)),
                    n => Ok((doc.render(), n)),
                }
            })
            .await?;

        if removed > 1 {
            warn!("Removed {} stale WireGuard peers for {}", removed, username);
        } else if removed == 0 {
            debug!("No WireGuard peer for {}", username);
        }
        Ok(())
    }

    async fn check_status(&self, username: &str) -> AdapterStatus {
        match self.file.read().await {
            Ok(content) => {
                let doc = WgDocument::parse(content.as_deref().unwrap_or(""));
                if doc.sections.iter().any(|s| s.owned_by(username)) {
                    AdapterStatus::Active
                } else {
                    AdapterStatus::Inactive
                }
            }
            Err(e) => {
                warn!("Cannot inspect WireGuard config: {}", e);
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

/// Render a client-side `wg-quick` configuration for a materialized grant
pub fn client_config(settings: &WireGuardSettings, secret: &GrantSecret) -> PanelResult<String> {
    let (private_key, preshared_key, address) = match secret {
        GrantSecret::WireGuard { private_key, preshared_key, address: Some(address), .. } => {
            (private_key, preshared_key, address)
        }
        GrantSecret::WireGuard { address: None, .. } => {
            return Err(PanelError::InvalidParameter("WireGuard grant has no address yet".to_string()));
        }
        other => return Err(adapter::wrong_material(KIND, other)),
    };
    let server_key = settings.server_public_key.as_deref().ok_or_else(|| {
        PanelError::ConfigError("wireguard.server_public_key is not set".to_string())
    })?;
    let endpoint = settings
        .endpoint
        .as_deref()
        .ok_or_else(|| PanelError::ConfigError("wireguard.endpoint is not set".to_string()))?;
    validation::validate_endpoint(endpoint)?;

    let mut cfg = String::new();
    cfg.push_str("[Interface]\n");
    cfg.push_str(&format!("PrivateKey = {}\n", private_key));
    cfg.push_str(&format!("Address = {}/32\n", address));
    if let Some(dns) = &settings.dns {
        cfg.push_str(&format!("DNS = {}\n", dns));
    }
    cfg.push_str("\n[Peer]\n");
    cfg.push_str(&format!("PublicKey = {}\n", server_key));
    cfg.push_str(&format!("PresharedKey = {}\n", preshared_key));
    cfg.push_str(&format!("Endpoint = {}\n", endpoint));
    cfg.push_str("AllowedIPs = 0.0.0.0/0, ::/0\n");
    cfg.push_str("PersistentKeepalive = 25\n");
    Ok(cfg)
}

/// Factory function to create a WireGuard adapter
pub fn create_adapter(config: &PanelConfig, service: Arc<ServiceController>) -> PanelResult<Arc<dyn ProtocolAdapter>> {
    Ok(Arc::new(WireGuardAdapter::new(config, service)?))
}

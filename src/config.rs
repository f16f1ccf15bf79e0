//! Configuration management for vpnpanel

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PanelError, PanelResult};
use crate::protocol::{KdfParams, ProtocolKind};

/// Default location of the panel configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpnpanel/vpnpanel.toml";

/// Main vpnpanel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Store and native configuration file paths
    #[serde(default)]
    pub paths: ConfigPaths,
    /// External command timeouts
    #[serde(default)]
    pub service: ServiceSettings,
    /// Password hashing and generation policy
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub wireguard: WireGuardSettings,
    #[serde(default)]
    pub l2tp: L2tpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// SQLite credential store
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// xl2tpd/pppd CHAP secrets
    #[serde(default = "default_chap_secrets")]
    pub chap_secrets: PathBuf,
    /// strongSwan secrets
    #[serde(default = "default_ipsec_secrets")]
    pub ipsec_secrets: PathBuf,
    /// WireGuard interface configuration
    #[serde(default = "default_wireguard_config")]
    pub wireguard_config: PathBuf,
    /// ocserv plain password file
    #[serde(default = "default_ocserv_passwd")]
    pub ocserv_passwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Upper bound for a service reload (seconds)
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,
    /// Upper bound for any other external command (seconds)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// Argon2id memory cost in KiB
    #[serde(default = "default_argon2_memory")]
    pub argon2_memory_kib: u32,
    /// Argon2id passes
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,
    /// Argon2id lanes
    #[serde(default = "default_argon2_parallelism")]
    pub argon2_parallelism: u32,
    /// Length of generated per-protocol passwords
    #[serde(default = "default_password_length")]
    pub generated_password_length: usize,
    /// Random bytes in generated pre-shared keys
    #[serde(default = "default_psk_bytes")]
    pub psk_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardSettings {
    /// Interface name, also selects the `wg-quick@<iface>` unit
    #[serde(default = "default_wg_interface")]
    pub interface: String,
    /// IPv4 pool peers are allocated from; the first host is the server
    #[serde(default = "default_wg_pool")]
    pub address_pool: String,
    /// Server public key, needed to render client configs
    #[serde(default)]
    pub server_public_key: Option<String>,
    /// Public `host:port` clients connect to
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub dns: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2tpSettings {
    /// pppd server name in the second column of chap-secrets
    #[serde(default = "default_l2tp_server_name")]
    pub server_name: String,
}

fn default_database() -> PathBuf {
    PathBuf::from("/var/lib/vpnpanel/accounts.db")
}

fn default_chap_secrets() -> PathBuf {
    PathBuf::from(ProtocolKind::L2tpIpsec.descriptor().config_path)
}

fn default_ipsec_secrets() -> PathBuf {
    PathBuf::from(ProtocolKind::Ikev2Ipsec.descriptor().config_path)
}

fn default_wireguard_config() -> PathBuf {
    PathBuf::from(ProtocolKind::WireGuard.descriptor().config_path)
}

fn default_ocserv_passwd() -> PathBuf {
    PathBuf::from(ProtocolKind::AnyConnect.descriptor().config_path)
}

fn default_reload_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_argon2_memory() -> u32 {
    19 * 1024
}

fn default_argon2_iterations() -> u32 {
    2
}

fn default_argon2_parallelism() -> u32 {
    1
}

fn default_password_length() -> usize {
    16
}

fn default_psk_bytes() -> usize {
    32
}

fn default_wg_interface() -> String {
    "wg0".to_string()
}

fn default_wg_pool() -> String {
    "10.8.0.0/24".to_string()
}

fn default_l2tp_server_name() -> String {
    "l2tpd".to_string()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            database: default_database(),
            chap_secrets: default_chap_secrets(),
            ipsec_secrets: default_ipsec_secrets(),
            wireguard_config: default_wireguard_config(),
            ocserv_passwd: default_ocserv_passwd(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            reload_timeout_secs: default_reload_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            argon2_memory_kib: default_argon2_memory(),
            argon2_iterations: default_argon2_iterations(),
            argon2_parallelism: default_argon2_parallelism(),
            generated_password_length: default_password_length(),
            psk_bytes: default_psk_bytes(),
        }
    }
}

impl Default for WireGuardSettings {
    fn default() -> Self {
        Self {
            interface: default_wg_interface(),
            address_pool: default_wg_pool(),
            server_public_key: None,
            endpoint: None,
            dns: None,
        }
    }
}

impl Default for L2tpSettings {
    fn default() -> Self {
        Self {
            server_name: default_l2tp_server_name(),
        }
    }
}

impl ServiceSettings {
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl SecuritySettings {
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.argon2_memory_kib,
            iterations: self.argon2_iterations,
            parallelism: self.argon2_parallelism,
        }
    }
}

impl PanelConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> PanelResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PanelError::ConfigError(format!("Failed to read config: {}", e)))?;

        let config: PanelConfig = toml::from_str(&content)
            .map_err(|e| PanelError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> PanelResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> PanelResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PanelError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| PanelError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject settings that would weaken generated secrets
    pub fn validate(&self) -> PanelResult<()> {
        if self.security.generated_password_length < crate::secrets::MIN_PASSWORD_LENGTH {
            return Err(PanelError::ConfigError(format!(
                "generated_password_length must be at least {}",
                crate::secrets::MIN_PASSWORD_LENGTH
            )));
        }
        if self.security.psk_bytes < crate::secrets::MIN_PSK_BYTES {
            return Err(PanelError::ConfigError(format!(
                "psk_bytes must be at least {}",
                crate::secrets::MIN_PSK_BYTES
            )));
        }
        if self.service.reload_timeout_secs == 0 || self.service.command_timeout_secs == 0 {
            return Err(PanelError::ConfigError("Timeouts must be non-zero".to_string()));
        }
        crate::validation::validate_interface_name(&self.wireguard.interface)
            .map_err(|e| PanelError::ConfigError(e.to_string()))?;
        crate::vpn::wireguard::AddressPool::parse(&self.wireguard.address_pool)
            .map_err(|e| PanelError::ConfigError(e.to_string()))?;
        Ok(())
    }

    /// Ensure the store directory exists
    pub fn ensure_directories(&self) -> PanelResult<()> {
        if let Some(dir) = self.paths.database.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| PanelError::ConfigError(format!("Failed to create directory {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    /// Configuration rooted in `dir`, used by tests and dry runs
    pub fn rooted_at(dir: &Path) -> Self {
        let mut config = Self::default();
        config.paths = ConfigPaths {
            database: dir.join("accounts.db"),
            chap_secrets: dir.join("chap-secrets"),
            ipsec_secrets: dir.join("ipsec.secrets"),
            wireguard_config: dir.join("wg0.conf"),
            ocserv_passwd: dir.join("ocpasswd"),
        };
        config
    }
}

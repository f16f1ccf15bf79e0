//! Protocol kinds, their static descriptors, and the account/grant records
//! shared by the store, the adapters and the provisioner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::{PanelError, PanelResult};

/// VPN protocols a grant can bind an account to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Ssh,
    #[serde(rename = "l2tp")]
    L2tpIpsec,
    #[serde(rename = "ikev2")]
    Ikev2Ipsec,
    WireGuard,
    AnyConnect,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 5] = [
        ProtocolKind::Ssh,
        ProtocolKind::L2tpIpsec,
        ProtocolKind::Ikev2Ipsec,
        ProtocolKind::WireGuard,
        ProtocolKind::AnyConnect,
    ];

    /// Stable identifier used in the store and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Ssh => "ssh",
            ProtocolKind::L2tpIpsec => "l2tp",
            ProtocolKind::Ikev2Ipsec => "ikev2",
            ProtocolKind::WireGuard => "wireguard",
            ProtocolKind::AnyConnect => "anyconnect",
        }
    }

    /// Static descriptor for this kind
    pub fn descriptor(&self) -> &'static ProtocolDescriptor {
        match self {
            ProtocolKind::Ssh => &SSH,
            ProtocolKind::L2tpIpsec => &L2TP,
            ProtocolKind::Ikev2Ipsec => &IKEV2,
            ProtocolKind::WireGuard => &WIREGUARD,
            ProtocolKind::AnyConnect => &ANYCONNECT,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = PanelError;

    fn from_str(s: &str) -> PanelResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(ProtocolKind::Ssh),
            "l2tp" | "l2tp_ipsec" | "l2tp/ipsec" => Ok(ProtocolKind::L2tpIpsec),
            "ikev2" | "ikev2_ipsec" | "ikev2/ipsec" => Ok(ProtocolKind::Ikev2Ipsec),
            "wireguard" | "wg" => Ok(ProtocolKind::WireGuard),
            "anyconnect" | "ocserv" | "cisco" => Ok(ProtocolKind::AnyConnect),
            other => Err(PanelError::InvalidParameter(format!("Unknown protocol '{}'", other))),
        }
    }
}

/// How a service picks up a changed native configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStrategy {
    /// The daemon reads the file on every session; nothing to signal
    Live,
    /// `systemctl reload <unit>`
    SystemdReload,
    /// A protocol-specific control command
    Command(&'static [&'static str]),
}

/// Process-wide, read-only metadata about a protocol kind
#[derive(Debug)]
pub struct ProtocolDescriptor {
    pub kind: ProtocolKind,
    pub display_name: &'static str,
    /// Packages the installer pulls in for this protocol
    pub packages: &'static [&'static str],
    /// Binary whose presence means the protocol is installed
    pub binary: &'static str,
    /// Default native file the adapter edits
    pub config_path: &'static str,
    /// systemd unit backing the protocol
    pub service: &'static str,
    pub reload: ReloadStrategy,
}

static SSH: ProtocolDescriptor = ProtocolDescriptor {
    kind: ProtocolKind::Ssh,
    display_name: "SSH",
    packages: &["openssh-server"],
    binary: "sshd",
    config_path: "/etc/passwd",
    service: "ssh",
    reload: ReloadStrategy::Live,
};

static L2TP: ProtocolDescriptor = ProtocolDescriptor {
    kind: ProtocolKind::L2tpIpsec,
    display_name: "L2TP/IPsec",
    packages: &["strongswan", "xl2tpd"],
    binary: "xl2tpd",
    config_path: "/etc/ppp/chap-secrets",
    service: "xl2tpd",
    reload: ReloadStrategy::Live,
};

static IKEV2: ProtocolDescriptor = ProtocolDescriptor {
    kind: ProtocolKind::Ikev2Ipsec,
    display_name: "IKEv2/IPsec",
    packages: &["strongswan", "strongswan-pki", "libcharon-extra-plugins"],
    binary: "ipsec",
    config_path: "/etc/ipsec.secrets",
    service: "strongswan-starter",
    reload: ReloadStrategy::Command(&["ipsec", "rereadsecrets"]),
};

static WIREGUARD: ProtocolDescriptor = ProtocolDescriptor {
    kind: ProtocolKind::WireGuard,
    display_name: "WireGuard",
    packages: &["wireguard"],
    binary: "wg",
    config_path: "/etc/wireguard/wg0.conf",
    service: "wg-quick@wg0",
    reload: ReloadStrategy::SystemdReload,
};

static ANYCONNECT: ProtocolDescriptor = ProtocolDescriptor {
    kind: ProtocolKind::AnyConnect,
    display_name: "Cisco AnyConnect",
    packages: &["ocserv"],
    binary: "ocserv",
    config_path: "/etc/ocserv/ocpasswd",
    service: "ocserv",
    reload: ReloadStrategy::Command(&["occtl", "reload"]),
};

/// Persisted lifecycle state of a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Pending,
    Active,
    Failed,
    Disabled,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Pending => "pending",
            GrantStatus::Active => "active",
            GrantStatus::Failed => "failed",
            GrantStatus::Disabled => "disabled",
        }
    }

    /// Whether native config may still hold an entry for this grant
    pub fn may_hold_live_state(&self) -> bool {
        !matches!(self, GrantStatus::Disabled)
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for GrantStatus {
    type Err = PanelError;

    fn from_str(s: &str) -> PanelResult<Self> {
        match s {
            "pending" => Ok(GrantStatus::Pending),
            "active" => Ok(GrantStatus::Active),
            "failed" => Ok(GrantStatus::Failed),
            "disabled" => Ok(GrantStatus::Disabled),
            other => Err(PanelError::ParseError(format!("Unknown grant status '{}'", other))),
        }
    }
}

/// What an adapter observes in its native config for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    Active,
    Inactive,
    Unknown,
}

/// Protocol-specific secret material held by a grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrantSecret {
    /// SSH, L2TP and AnyConnect log in with a per-grant password
    Password { password: String },
    /// IKEv2 identity-keyed pre-shared key
    Psk { psk: String },
    #[serde(rename = "wireguard")]
    WireGuard {
        private_key: String,
        public_key: String,
        preshared_key: String,
        /// Tunnel address, assigned on first materialization
        #[serde(default)]
        address: Option<String>,
    },
}

/// Salted Argon2id output and the parameters that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedPassword {
    pub salt: Vec<u8>,
    pub key: Vec<u8>,
    pub params: KdfParams,
}

/// Argon2id work factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Encoded form stored next to the hash, e.g. `m=19456,t=2,p=1`
    pub fn encode(&self) -> String {
        format!("m={},t={},p={}", self.memory_kib, self.iterations, self.parallelism)
    }

    pub fn decode(s: &str) -> PanelResult<Self> {
        let mut memory_kib = None;
        let mut iterations = None;
        let mut parallelism = None;

        for part in s.split(',') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PanelError::ParseError(format!("Malformed KDF parameters: {}", s)))?;
            let value: u32 = value
                .parse()
                .map_err(|_| PanelError::ParseError(format!("Malformed KDF parameter: {}", part)))?;
            match key {
                "m" => memory_kib = Some(value),
                "t" => iterations = Some(value),
                "p" => parallelism = Some(value),
                _ => return Err(PanelError::ParseError(format!("Unknown KDF parameter: {}", key))),
            }
        }

        match (memory_kib, iterations, parallelism) {
            (Some(memory_kib), Some(iterations), Some(parallelism)) => Ok(Self {
                memory_kib,
                iterations,
                parallelism,
            }),
            _ => Err(PanelError::ParseError(format!("Incomplete KDF parameters: {}", s))),
        }
    }
}

/// Panel role of an account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    #[default]
    User,
    Admin,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::User => "user",
            AccountRole::Admin => "admin",
        }
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AccountRole {
    type Err = PanelError;

    fn from_str(s: &str) -> PanelResult<Self> {
        match s {
            "user" => Ok(AccountRole::User),
            "admin" => Ok(AccountRole::Admin),
            other => Err(PanelError::InvalidParameter(format!("Unknown role '{}'", other))),
        }
    }
}

/// Central user record
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub username: String,
    #[serde(skip)]
    pub password: HashedPassword,
    pub role: AccountRole,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Enablement record binding one account to one protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolGrant {
    pub username: String,
    pub kind: ProtocolKind,
    pub enabled: bool,
    #[serde(skip)]
    pub secret: Option<GrantSecret>,
    pub status: GrantStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One tunnel connection of an account, open until `disconnected_at` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: i64,
    pub username: String,
    pub kind: ProtocolKind,
    pub client_ip: IpAddr,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.disconnected_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.as_str().parse::<ProtocolKind>().unwrap(), kind);
            assert_eq!(kind.descriptor().kind, kind);
        }
        assert_eq!("WG".parse::<ProtocolKind>().unwrap(), ProtocolKind::WireGuard);
        assert!("pptp".parse::<ProtocolKind>().is_err());
    }

    #[test]
    fn test_role_names() {
        assert_eq!(AccountRole::default(), AccountRole::User);
        assert_eq!("admin".parse::<AccountRole>().unwrap(), AccountRole::Admin);
        assert!("root".parse::<AccountRole>().is_err());
        assert_eq!(serde_json::to_string(&AccountRole::Admin).unwrap(), r#""admin""#);
    }

    #[test]
    fn test_account_json_has_timestamps_and_no_password() {
        let created_at = "2024-05-01T12:30:00.123456Z".parse::<DateTime<Utc>>().unwrap();
        let account = Account {
            username: "alice".to_string(),
            password: HashedPassword {
                salt: vec![1; 16],
                key: vec![2; 32],
                params: KdfParams { memory_kib: 1024, iterations: 1, parallelism: 1 },
            },
            role: AccountRole::User,
            created_at,
            last_login: None,
        };

        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["created_at"], "2024-05-01T12:30:00.123456Z");
        assert_eq!(json["last_login"], serde_json::Value::Null);
        assert_eq!(json["role"], "user");
        assert!(json.get("password").is_none());

        let session = Session {
            id: 7,
            username: "alice".to_string(),
            kind: ProtocolKind::WireGuard,
            client_ip: "192.0.2.10".parse().unwrap(),
            connected_at: created_at,
            disconnected_at: None,
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["client_ip"], "192.0.2.10");
        assert_eq!(json["connected_at"], "2024-05-01T12:30:00.123456Z");
    }

    #[test]
    fn test_kdf_params_encoding() {
        let params = KdfParams { memory_kib: 19456, iterations: 2, parallelism: 1 };
        assert_eq!(params.encode(), "m=19456,t=2,p=1");
        assert_eq!(KdfParams::decode("m=19456,t=2,p=1").unwrap(), params);

        assert!(KdfParams::decode("m=1,t=2").is_err());
        assert!(KdfParams::decode("m=x,t=2,p=1").is_err());
        assert!(KdfParams::decode("q=1,t=2,p=1").is_err());
    }

    #[test]
    fn test_grant_secret_serialization_is_tagged() {
        let secret = GrantSecret::Psk { psk: "abc".to_string() };
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, r#"{"type":"psk","psk":"abc"}"#);

        let wg: GrantSecret = serde_json::from_str(
            r#"{"type":"wireguard","private_key":"a","public_key":"b","preshared_key":"c"}"#,
        )
        .unwrap();
        assert!(matches!(wg, GrantSecret::WireGuard { address: None, .. }));
    }

    #[test]
    fn test_only_disabled_is_free_of_live_state() {
        assert!(GrantStatus::Active.may_hold_live_state());
        assert!(GrantStatus::Failed.may_hold_live_state());
        assert!(GrantStatus::Pending.may_hold_live_state());
        assert!(!GrantStatus::Disabled.may_hold_live_state());
    }
}

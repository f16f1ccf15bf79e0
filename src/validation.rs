//! Input validation and sanitization
//!
//! Everything that ends up on a command line or inside a native config file
//! passes through here first, so a hostile username or secret cannot inject
//! extra lines, shell metacharacters or command-line options.

use crate::error::{PanelError, PanelResult};
use std::net::IpAddr;

/// Account names, also used as system user names for SSH
const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;

/// Account login passwords
const MIN_ACCOUNT_PASSWORD_LEN: usize = 8;
const MAX_ACCOUNT_PASSWORD_LEN: usize = 128;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for values written into native config files
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for error messages shown to users
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Names that collide with system accounts or daemon identities
const RESERVED_USERNAMES: &[&str] = &[
    "root", "daemon", "bin", "sys", "sync", "games", "man", "lp", "mail", "news",
    "uucp", "proxy", "www-data", "backup", "list", "irc", "nobody", "sshd",
    "systemd-network", "systemd-resolve", "messagebus", "syslog", "ocserv",
    "mysql", "postgres", "admin",
];

/// Validate an account username
///
/// 3-32 characters, starting with a lowercase letter, followed by lowercase
/// letters, digits, `.`, `_` or `-`. The same name becomes a system user for
/// SSH and an identity in chap-secrets/ipsec.secrets, so the charset is kept
/// to what all of them accept unquoted.
pub fn validate_username(name: &str) -> PanelResult<()> {
    if name.len() < MIN_USERNAME_LEN || name.len() > MAX_USERNAME_LEN {
        return Err(PanelError::InvalidUsername(format!(
            "'{}' must be {}-{} characters long",
            name, MIN_USERNAME_LEN, MAX_USERNAME_LEN
        )));
    }

    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return Err(PanelError::InvalidUsername(format!(
            "'{}' must start with a lowercase letter",
            name
        )));
    }

    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '.' && c != '_' && c != '-' {
            return Err(PanelError::InvalidUsername(format!(
                "'{}' contains invalid character '{}'",
                name, c
            )));
        }
    }

    if RESERVED_USERNAMES.contains(&name) {
        return Err(PanelError::InvalidUsername(format!("'{}' is reserved", name)));
    }

    Ok(())
}

/// Validate an account (panel login) password
///
/// Only hashed, never written to native config, so any printable text is
/// accepted.
pub fn validate_password(password: &str) -> PanelResult<()> {
    let len = password.chars().count();
    if !(MIN_ACCOUNT_PASSWORD_LEN..=MAX_ACCOUNT_PASSWORD_LEN).contains(&len) {
        return Err(PanelError::InvalidParameter(format!(
            "Password must be {}-{} characters long",
            MIN_ACCOUNT_PASSWORD_LEN, MAX_ACCOUNT_PASSWORD_LEN
        )));
    }
    if password.chars().any(|c| c.is_control()) {
        return Err(PanelError::InvalidParameter(
            "Password contains control characters".to_string()
        ));
    }
    Ok(())
}

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes and underscores,
/// and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> PanelResult<()> {
    if name.is_empty() {
        return Err(PanelError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(PanelError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(PanelError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", name, c)
            ));
        }
    }

    // Don't allow names starting with dash (could be interpreted as option)
    if name.starts_with('-') {
        return Err(PanelError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Check a value that will be written inside a quoted native config field
///
/// Rejects control characters, quotes and backslashes, which would let the
/// value terminate its field or start a new line.
pub fn validate_config_value(value: &str) -> PanelResult<()> {
    if value.is_empty() {
        return Err(PanelError::InvalidParameter(
            "Configuration value cannot be empty".to_string()
        ));
    }

    if value.chars().any(|c| c.is_control()) {
        return Err(PanelError::InvalidParameter(
            "Configuration value contains invalid control characters".to_string()
        ));
    }

    if value.contains('"') || value.contains('\\') {
        return Err(PanelError::InvalidParameter(
            "Configuration value cannot contain quotes or backslashes".to_string()
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(PanelError::InvalidParameter(
            format!("Configuration value too long (max {} characters)", MAX_CONFIG_VALUE_LEN)
        ));
    }

    Ok(())
}

/// Validate a client-facing `host:port` endpoint
pub fn validate_endpoint(endpoint: &str) -> PanelResult<()> {
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
        PanelError::InvalidParameter("Endpoint must be in format 'host:port'".to_string())
    })?;

    port.parse::<u16>()
        .map_err(|_| PanelError::InvalidParameter(format!("Invalid endpoint port: {}", port)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    validate_hostname(host)
}

/// Sanitize error messages to prevent information disclosure
pub fn sanitize_error_message(stderr: &str) -> String {
    let mut sanitized = stderr.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}

/// Validate hostname
pub fn validate_hostname(host: &str) -> PanelResult<()> {
    if host.is_empty() {
        return Err(PanelError::InvalidParameter(
            "Hostname cannot be empty".to_string()
        ));
    }

    if host.len() > 253 {
        return Err(PanelError::InvalidParameter(
            "Hostname too long".to_string()
        ));
    }

    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    for c in host.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '.' {
            return Err(PanelError::InvalidParameter(
                format!("Invalid hostname character: {}", c)
            ));
        }
    }

    if host.starts_with('-') || host.starts_with('.') ||
       host.ends_with('-') || host.ends_with('.') {
        return Err(PanelError::InvalidParameter(
            "Hostname cannot start or end with dash or dot".to_string()
        ));
    }

    Ok(())
}

//! Integration tests for the vpnpanel CLI
//!
//! Only commands that need neither root nor live VPN services are run here.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn vpnpanel() -> Command {
    Command::cargo_bin("vpnpanel").unwrap()
}

/// Write a config whose files all live in `dir`
fn write_config(dir: &TempDir, extra: &str) -> PathBuf {
    let root = dir.path().display();
    let path = dir.path().join("vpnpanel.toml");
    fs::write(
        &path,
        format!(
            "[paths]\n\
             database = \"{root}/db/accounts.db\"\n\
             chap_secrets = \"{root}/chap-secrets\"\n\
             ipsec_secrets = \"{root}/ipsec.secrets\"\n\
             wireguard_config = \"{root}/wg0.conf\"\n\
             ocserv_passwd = \"{root}/ocpasswd\"\n\
             {extra}"
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_help_command() {
    vpnpanel()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VPN panel"))
        .stdout(predicate::str::contains("add-user"));
}

#[test]
fn test_protocols_lists_every_kind() {
    vpnpanel()
        .arg("protocols")
        .assert()
        .success()
        .stdout(predicate::str::contains("wireguard"))
        .stdout(predicate::str::contains("anyconnect"))
        .stdout(predicate::str::contains("strongswan"))
        .stdout(predicate::str::contains("/etc/wireguard/wg0.conf"));
}

#[test]
fn test_list_users_empty_store() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    vpnpanel()
        .arg("--config")
        .arg(&config)
        .arg("list-users")
        .assert()
        .success()
        .stdout(predicate::str::contains("No users"));

    // Read-only commands never create the store or its directory
    assert!(!dir.path().join("db/accounts.db").exists());
    assert!(!dir.path().join("db").exists());
}

#[test]
fn test_sessions_leave_no_store_behind() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    vpnpanel()
        .arg("--config")
        .arg(&config)
        .arg("sessions")
        .assert()
        .success()
        .stdout(predicate::str::contains("No open sessions"));

    let output = vpnpanel()
        .arg("--config")
        .arg(&config)
        .args(["sessions", "--protocol", "wireguard", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let sessions: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(sessions, serde_json::json!([]));

    assert!(!dir.path().join("db").exists());
}

#[test]
fn test_set_role_rejects_unknown_role() {
    vpnpanel()
        .args(["set-role", "alice", "superuser"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("superuser"));
}

#[test]
fn test_session_open_requires_client_address() {
    vpnpanel()
        .args(["session-open", "alice", "wireguard", "--ip", "not-an-ip"])
        .assert()
        .failure();
}

#[test]
fn test_list_users_json() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    let output = vpnpanel()
        .arg("-c")
        .arg(&config)
        .args(["list-users", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let users: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(users, serde_json::json!([]));
}

#[test]
fn test_show_unknown_user() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    vpnpanel()
        .arg("--config")
        .arg(&config)
        .args(["show-user", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "\n[security]\npsk_bytes = 4\n");

    vpnpanel()
        .arg("--config")
        .arg(&config)
        .arg("list-users")
        .assert()
        .failure()
        .stderr(predicate::str::contains("psk_bytes"));
}

#[test]
fn test_add_user_rejects_bad_name() {
    // Fails on the privilege check or on validation, depending on who runs it
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    vpnpanel()
        .arg("--config")
        .arg(&config)
        .args(["add-user", "Bad Name"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn test_unknown_protocol_rejected() {
    vpnpanel()
        .args(["add-user", "alice", "--protocol", "pptp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("pptp"));
}

#[test]
fn test_set_grant_requires_direction() {
    vpnpanel()
        .args(["set-grant", "alice", "wireguard"])
        .assert()
        .failure();
}

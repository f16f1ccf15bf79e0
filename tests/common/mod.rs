//! Shared fixtures for integration tests
//!
//! `FakeHost` stands in for the commands the adapters run (useradd,
//! ocpasswd, systemctl, ...) and keeps just enough state for them to
//! observe their own effects.

#![allow(dead_code)]

use async_trait::async_trait;
use libvpnpanel::config::PanelConfig;
use libvpnpanel::error::PanelResult;
use libvpnpanel::vpn::{AdapterRegistry, CommandOutput, CommandRunner, ServiceController};
use libvpnpanel::{CredentialStore, Provisioner};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const SERVER_WG_CONF: &str =
    "[Interface]\nAddress = 10.8.0.1/24\nListenPort = 51820\nPrivateKey = c2VydmVyLXByaXZhdGUta2V5LXBsYWNlaG9sZGVyMDA=\n";

#[derive(Default)]
struct HostState {
    system_users: HashSet<String>,
    foreign_users: HashSet<String>,
    calls: Vec<String>,
    failures: Vec<(String, String)>,
}

/// Scripted stand-in for the host's command line tools
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
    ocpasswd: PathBuf,
}

impl FakeHost {
    pub fn new(ocpasswd: PathBuf) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState::default())),
            ocpasswd,
        }
    }

    /// Make any command whose line contains `program` and `needle` exit 1
    pub fn fail_when(&self, program: &str, needle: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((program.to_string(), needle.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// A pre-existing account the panel did not create
    pub fn add_foreign_user(&self, name: &str) {
        self.state.lock().unwrap().foreign_users.insert(name.to_string());
    }

    pub fn has_system_user(&self, name: &str) -> bool {
        self.state.lock().unwrap().system_users.contains(name)
    }

    /// Every command line run so far
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn edit_ocpasswd(&self, args: &[String]) {
        let content = std::fs::read_to_string(&self.ocpasswd).unwrap_or_default();
        let user = args.last().cloned().unwrap_or_default();
        let mut kept: String = content
            .lines()
            .filter(|l| l.split(':').next() != Some(user.as_str()))
            .map(|l| format!("{}\n", l))
            .collect();
        if !args.iter().any(|a| a == "-d") {
            kept.push_str(&format!("{}:*:$5$fakehash\n", user));
        }
        std::fs::write(&self.ocpasswd, kept).unwrap();
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _stdin: Option<String>,
        _timeout: Duration,
    ) -> PanelResult<CommandOutput> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let mut state = self.state.lock().unwrap();
        state.calls.push(line.clone());

        let injected = state
            .failures
            .iter()
            .any(|(p, needle)| p == program && line.contains(needle.as_str()));
        if injected {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }

        let user = args.last().cloned().unwrap_or_default();
        let output = match program {
            "getent" => {
                if state.foreign_users.contains(&user) {
                    CommandOutput {
                        code: Some(0),
                        stdout: format!("{}:x:1000:1000:{}:/home/{}:/bin/bash\n", user, user, user),
                        stderr: String::new(),
                    }
                } else if state.system_users.contains(&user) {
                    CommandOutput {
                        code: Some(0),
                        stdout: format!("{}:x:1001:1001:vpnpanel:/home/{}:/bin/false\n", user, user),
                        stderr: String::new(),
                    }
                } else {
                    CommandOutput::with_code(2)
                }
            }
            "useradd" => {
                state.system_users.insert(user);
                CommandOutput::with_code(0)
            }
            "userdel" => {
                state.system_users.remove(&user);
                CommandOutput::with_code(0)
            }
            "pkill" => CommandOutput::with_code(1),
            "ocpasswd" => {
                drop(state);
                self.edit_ocpasswd(args);
                CommandOutput::with_code(0)
            }
            _ => CommandOutput::with_code(0),
        };
        Ok(output)
    }
}

/// A provisioner over a temp directory and a fake host
pub struct Harness {
    pub dir: TempDir,
    pub host: FakeHost,
    pub provisioner: Arc<Provisioner>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Harness whose config is adjusted by `tweak` before anything is built
    pub fn with_config(tweak: impl FnOnce(&mut PanelConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        std::fs::write(&config.paths.wireguard_config, SERVER_WG_CONF).unwrap();

        let host = FakeHost::new(config.paths.ocserv_passwd.clone());
        let service = Arc::new(ServiceController::new(Arc::new(host.clone()), &config.service));
        let registry = AdapterRegistry::with_system_defaults(&config, service).unwrap();
        let store = Arc::new(CredentialStore::open(&config.paths.database).unwrap());

        Self {
            provisioner: Arc::new(Provisioner::new(store, registry, config)),
            host,
            dir,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path(name)).unwrap_or_default()
    }
}

/// Config rooted in `dir` with a cheap password hash
pub fn test_config(dir: &Path) -> PanelConfig {
    let mut config = PanelConfig::rooted_at(dir);
    config.security.argon2_memory_kib = 1024;
    config.security.argon2_iterations = 1;
    config
}

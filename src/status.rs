//! Per-protocol health reporting
//!
//! Read-only: checks each service once and compares every stored grant of a
//! kind, enabled or not, with what its adapter observes in native config.
//! The active count is what the adapters observe, not what the store claims.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::PanelResult;
use crate::protocol::{AdapterStatus, GrantStatus, ProtocolKind};
use crate::store::CredentialStore;
use crate::vpn::AdapterRegistry;

/// Stored and observed state disagree for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub username: String,
    pub stored: GrantStatus,
    pub observed: AdapterStatus,
}

/// Health of one protocol kind
#[derive(Debug, Clone, Serialize)]
pub struct KindHealth {
    pub running: bool,
    pub installed: bool,
    /// Grants whose native entry is observed live
    pub active_grant_count: usize,
    pub open_sessions: usize,
    pub drift: Vec<Drift>,
}

/// Whether an observation contradicts the stored status
fn is_drift(stored: GrantStatus, observed: AdapterStatus) -> bool {
    match observed {
        AdapterStatus::Unknown => true,
        AdapterStatus::Active => stored != GrantStatus::Active,
        AdapterStatus::Inactive => stored == GrantStatus::Active,
    }
}

pub struct StatusReporter {
    store: Arc<CredentialStore>,
    registry: AdapterRegistry,
}

impl StatusReporter {
    pub fn new(store: Arc<CredentialStore>, registry: AdapterRegistry) -> Self {
        Self { store, registry }
    }

    /// Health of every registered kind
    pub async fn report(&self) -> PanelResult<BTreeMap<ProtocolKind, KindHealth>> {
        let checks = self.registry.kinds().into_iter().map(|kind| async move {
            let health = self.kind_health(kind).await?;
            Ok::<_, crate::error::PanelError>((kind, health))
        });

        join_all(checks).await.into_iter().collect()
    }

    async fn kind_health(&self, kind: ProtocolKind) -> PanelResult<KindHealth> {
        let adapter = self.registry.get(kind)?;
        let (running, installed) = futures::join!(adapter.service_running(), adapter.is_installed());

        let grants = self.store.grants_of_kind(kind)?;
        let observed = join_all(grants.iter().map(|g| adapter.check_status(&g.username))).await;

        let active_grant_count = observed.iter().filter(|o| **o == AdapterStatus::Active).count();
        let drift: Vec<Drift> = grants
            .iter()
            .zip(observed)
            .filter(|(grant, observed)| is_drift(grant.status, *observed))
            .map(|(grant, observed)| Drift {
                username: grant.username.clone(),
                stored: grant.status,
                observed,
            })
            .collect();

        if !drift.is_empty() {
            debug!("{}: {} grant(s) out of sync", kind, drift.len());
        }

        Ok(KindHealth {
            running,
            installed,
            active_grant_count,
            open_sessions: self.store.open_sessions(Some(kind))?.len(),
            drift,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecuritySettings;
    use crate::protocol::{GrantSecret, HashedPassword, KdfParams};
    use crate::store::GrantFields;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// Adapter whose native config is a set of usernames
    #[derive(Default)]
    struct NativeSet {
        live: Mutex<BTreeSet<String>>,
    }

    #[async_trait]
    impl crate::vpn::ProtocolAdapter for NativeSet {
        fn kind(&self) -> ProtocolKind {
            ProtocolKind::Ikev2Ipsec
        }

        fn issue_secret(&self, _security: &SecuritySettings) -> PanelResult<GrantSecret> {
            Ok(GrantSecret::Password { password: "Generated!pw1".to_string() })
        }

        async fn materialize(&self, username: &str, secret: &GrantSecret) -> PanelResult<GrantSecret> {
            self.live.lock().unwrap().insert(username.to_string());
            Ok(secret.clone())
        }

        async fn revoke(&self, username: &str) -> PanelResult<()> {
            self.live.lock().unwrap().remove(username);
            Ok(())
        }

        async fn check_status(&self, username: &str) -> AdapterStatus {
            if self.live.lock().unwrap().contains(username) {
                AdapterStatus::Active
            } else {
                AdapterStatus::Inactive
            }
        }

        async fn service_running(&self) -> bool {
            true
        }

        async fn is_installed(&self) -> bool {
            true
        }
    }

    fn store_with(users: &[&str]) -> Arc<CredentialStore> {
        let store = CredentialStore::open_in_memory().unwrap();
        let password = HashedPassword {
            salt: vec![1; 16],
            key: vec![2; 32],
            params: KdfParams { memory_kib: 1024, iterations: 1, parallelism: 1 },
        };
        for user in users {
            store.create_account(user, &password, &[ProtocolKind::Ikev2Ipsec]).unwrap();
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_active_count_is_observed_not_stored() {
        let store = store_with(&["alice", "bob"]);
        let adapter = Arc::new(NativeSet::default());
        adapter.live.lock().unwrap().insert("alice".to_string());
        for user in ["alice", "bob"] {
            store
                .set_grant(user, ProtocolKind::Ikev2Ipsec, GrantFields::status(GrantStatus::Active, None))
                .unwrap();
        }

        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        let report = StatusReporter::new(store, registry).report().await.unwrap();
        let health = &report[&ProtocolKind::Ikev2Ipsec];

        assert_eq!(health.active_grant_count, 1);
        assert_eq!(health.drift.len(), 1);
        assert_eq!(health.drift[0].username, "bob");
        assert_eq!(health.drift[0].observed, AdapterStatus::Inactive);
    }

    #[tokio::test]
    async fn test_disabled_grant_with_live_entry_is_seen() {
        let store = store_with(&["carol"]);
        store
            .set_grant(
                "carol",
                ProtocolKind::Ikev2Ipsec,
                GrantFields {
                    enabled: Some(false),
                    status: Some(GrantStatus::Disabled),
                    ..Default::default()
                },
            )
            .unwrap();
        let adapter = Arc::new(NativeSet::default());
        adapter.live.lock().unwrap().insert("carol".to_string());

        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        let report = StatusReporter::new(store.clone(), registry).report().await.unwrap();
        let health = &report[&ProtocolKind::Ikev2Ipsec];

        assert_eq!(health.active_grant_count, 1);
        assert_eq!(
            health.drift,
            vec![Drift {
                username: "carol".to_string(),
                stored: GrantStatus::Disabled,
                observed: AdapterStatus::Active,
            }]
        );
        assert_eq!(health.open_sessions, 0);
    }

    #[test]
    fn test_drift_rules() {
        assert!(!is_drift(GrantStatus::Active, AdapterStatus::Active));
        assert!(is_drift(GrantStatus::Active, AdapterStatus::Inactive));
        assert!(is_drift(GrantStatus::Failed, AdapterStatus::Active));
        assert!(!is_drift(GrantStatus::Failed, AdapterStatus::Inactive));
        assert!(!is_drift(GrantStatus::Pending, AdapterStatus::Inactive));
        assert!(is_drift(GrantStatus::Active, AdapterStatus::Unknown));
        assert!(is_drift(GrantStatus::Disabled, AdapterStatus::Active));
        assert!(!is_drift(GrantStatus::Disabled, AdapterStatus::Inactive));
    }
}

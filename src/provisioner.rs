//! Provisioning orchestrator
//!
//! Drives secret generation, the credential store and the protocol adapters,
//! and owns the grant state machine:
//!
//! ```text
//! Pending ──materialize──▶ Active | Failed
//! Active  ──revoke───────▶ Disabled | Failed
//! ```
//!
//! Operations on one username are serialized; different usernames proceed
//! concurrently. Store transactions never span adapter I/O, and adapter
//! calls run in spawned tasks so a caller going away cannot interrupt a
//! half-applied native edit.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::PanelConfig;
use crate::error::{PanelError, PanelResult};
use crate::protocol::{Account, AccountRole, GrantSecret, GrantStatus, ProtocolGrant, ProtocolKind, Session};
use crate::secrets;
use crate::store::{AccountUpdate, CredentialStore, GrantFields};
use crate::validation;
use crate::vpn::{wireguard, AdapterRegistry, ProtocolAdapter, ServiceController};

/// Result of driving one grant through a transition
#[derive(Debug, Clone, Serialize)]
pub struct GrantOutcome {
    pub kind: ProtocolKind,
    pub status: GrantStatus,
    pub error: Option<String>,
    /// Secret material in effect, shown once to the operator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<GrantSecret>,
}

impl GrantOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of `add_user`, one entry per requested protocol
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub username: String,
    pub grants: Vec<GrantOutcome>,
}

impl ProvisionReport {
    pub fn all_active(&self) -> bool {
        self.grants.iter().all(|g| g.status == GrantStatus::Active)
    }
}

/// Outcome of `delete_user`
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub username: String,
    pub revoked: Vec<GrantOutcome>,
    /// Kinds that may still hold native entries (only with `force`)
    pub leftover: Vec<ProtocolKind>,
}

/// An account with all of its grants
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    #[serde(flatten)]
    pub account: Account,
    pub grants: Vec<ProtocolGrant>,
}

type UserLock = Arc<tokio::sync::Mutex<()>>;

/// Multi-protocol account provisioner
pub struct Provisioner {
    store: Arc<CredentialStore>,
    registry: AdapterRegistry,
    config: Arc<PanelConfig>,
    user_locks: Mutex<HashMap<String, UserLock>>,
}

impl Provisioner {
    pub fn new(store: Arc<CredentialStore>, registry: AdapterRegistry, config: PanelConfig) -> Self {
        Self {
            store,
            registry,
            config: Arc::new(config),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Provisioner wired to the host: store on disk, real commands
    ///
    /// The store directory must already exist, see
    /// [`PanelConfig::ensure_directories`].
    pub fn from_config(config: PanelConfig) -> PanelResult<Self> {
        let store = Arc::new(CredentialStore::open(&config.paths.database)?);
        Self::with_store(store, config)
    }

    /// Like [`Provisioner::from_config`], but the store is opened read-only
    /// and a missing database is never created
    pub fn from_config_read_only(config: PanelConfig) -> PanelResult<Self> {
        let store = Arc::new(CredentialStore::open_read_only(&config.paths.database)?);
        Self::with_store(store, config)
    }

    fn with_store(store: Arc<CredentialStore>, config: PanelConfig) -> PanelResult<Self> {
        let service = Arc::new(ServiceController::system(&config.service));
        let registry = AdapterRegistry::with_system_defaults(&config, service)?;
        Ok(Self::new(store, registry, config))
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    /// Per-username lock; unused entries are pruned on the way
    fn user_lock(&self, username: &str) -> UserLock {
        let mut locks = self.user_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(username.to_string()).or_default().clone()
    }

    async fn hash(&self, password: &str) -> PanelResult<crate::protocol::HashedPassword> {
        let password = password.to_string();
        let params = self.config.security.kdf_params();
        tokio::task::spawn_blocking(move || secrets::hash_password(&password, params))
            .await
            .map_err(|e| PanelError::Crypto(format!("hashing task failed: {}", e)))?
    }

    /// Create an account and provision it on `kinds`
    ///
    /// Validation and store errors abort before any native change, and an
    /// account created on the way is removed again. Adapter failures are
    /// reported per protocol and leave that grant `Failed`. A store error
    /// after an adapter ran cannot be undone here: it is reported as that
    /// grant's error with the grant left `Pending`, which status reports as
    /// drift and `update_grant` retries.
    pub async fn add_user(
        &self,
        username: &str,
        password: &str,
        kinds: &[ProtocolKind],
    ) -> PanelResult<ProvisionReport> {
        validation::validate_username(username)?;
        validation::validate_password(password)?;
        let kinds: Vec<ProtocolKind> = kinds.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        for kind in &kinds {
            self.registry.get(*kind)?;
        }

        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        match self.store.get_account(username) {
            Ok(_) => return Err(PanelError::DuplicateUsername(username.to_string())),
            Err(PanelError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let hashed = self.hash(password).await?;
        self.store.create_account(username, &hashed, &kinds)?;
        info!("Created account {} for {:?}", username, kinds);

        let mut prepared = Vec::with_capacity(kinds.len());
        for kind in &kinds {
            match self.prepare_grant(username, *kind, None) {
                Ok(secret) => prepared.push((*kind, secret)),
                Err(e) => {
                    warn!("Provisioning {} aborted before any native change: {}", username, e);
                    if let Err(cleanup) = self.store.delete_account(username) {
                        warn!("Failed to remove partial account {}: {}", username, cleanup);
                    }
                    return Err(e);
                }
            }
        }

        let pending = prepared
            .into_iter()
            .map(|(kind, secret)| self.apply_grant(username, kind, secret));
        let grants = futures::future::join_all(pending).await;

        Ok(ProvisionReport {
            username: username.to_string(),
            grants,
        })
    }

    /// Enable or disable one protocol for an existing account
    ///
    /// Enabling reuses stored secret material and generates it when there
    /// is none. Already being in the requested state is not an error.
    pub async fn update_grant(
        &self,
        username: &str,
        kind: ProtocolKind,
        enabled: bool,
    ) -> PanelResult<GrantOutcome> {
        validation::validate_username(username)?;
        self.registry.get(kind)?;

        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        self.store.get_account(username)?;
        let current = self.store.grant(username, kind)?;

        if enabled {
            match current {
                Some(grant) if grant.enabled && grant.status == GrantStatus::Active => {
                    debug!("{} already active for {}", kind, username);
                    Ok(GrantOutcome {
                        kind,
                        status: GrantStatus::Active,
                        error: None,
                        secret: grant.secret,
                    })
                }
                Some(grant) => self.materialize_grant(username, kind, grant.secret).await,
                None => self.materialize_grant(username, kind, None).await,
            }
        } else {
            match current {
                Some(grant) if grant.status.may_hold_live_state() => self.revoke_grant(username, kind).await,
                _ => {
                    debug!("{} already disabled for {}", kind, username);
                    Ok(GrantOutcome {
                        kind,
                        status: GrantStatus::Disabled,
                        error: None,
                        secret: None,
                    })
                }
            }
        }
    }

    /// Revoke every grant, then delete the account
    ///
    /// Without `force`, any failed revoke aborts the deletion with
    /// [`PanelError::LiveState`] and the account stays.
    pub async fn delete_user(&self, username: &str, force: bool) -> PanelResult<DeleteReport> {
        validation::validate_username(username)?;

        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        let grants = self.store.grants(username)?;
        let mut revoked = Vec::new();
        for grant in grants.iter().filter(|g| g.status.may_hold_live_state()) {
            revoked.push(self.revoke_grant(username, grant.kind).await?);
        }

        let leftover: Vec<ProtocolKind> = revoked.iter().filter(|o| !o.is_ok()).map(|o| o.kind).collect();
        if !leftover.is_empty() {
            if !force {
                return Err(PanelError::LiveState {
                    username: username.to_string(),
                    kinds: leftover,
                });
            }
            warn!("Force-deleting {} with live state in {:?}", username, leftover);
        }

        self.store.delete_account(username)?;
        info!("Deleted account {}", username);
        Ok(DeleteReport {
            username: username.to_string(),
            revoked,
            leftover,
        })
    }

    /// All accounts with their grants, oldest first
    pub fn list_users(&self) -> PanelResult<Vec<UserRecord>> {
        self.store
            .list_accounts()?
            .into_iter()
            .map(|account| {
                let grants = self.store.grants(&account.username)?;
                Ok(UserRecord { account, grants })
            })
            .collect()
    }

    pub fn get_user(&self, username: &str) -> PanelResult<UserRecord> {
        let account = self.store.get_account(username)?;
        let grants = self.store.grants(username)?;
        Ok(UserRecord { account, grants })
    }

    /// Replace the account (panel login) password
    pub async fn change_password(&self, username: &str, new_password: &str) -> PanelResult<()> {
        validation::validate_username(username)?;
        validation::validate_password(new_password)?;

        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        self.store.get_account(username)?;
        let hashed = self.hash(new_password).await?;
        self.store.update_account(username, AccountUpdate::Password(hashed))?;
        info!("Changed password of {}", username);
        Ok(())
    }

    /// Change the account role
    pub async fn set_role(&self, username: &str, role: AccountRole) -> PanelResult<()> {
        validation::validate_username(username)?;

        let lock = self.user_lock(username);
        let _guard = lock.lock().await;

        self.store.get_account(username)?;
        self.store.update_account(username, AccountUpdate::Role(role))?;
        info!("{} is now {}", username, role);
        Ok(())
    }

    /// Record a tunnel coming up for `username`
    ///
    /// Only an enabled, active grant of `kind` can carry a session.
    pub fn record_connect(&self, username: &str, kind: ProtocolKind, client_ip: IpAddr) -> PanelResult<Session> {
        validation::validate_username(username)?;
        self.store.get_account(username)?;
        self.store
            .grant(username, kind)?
            .filter(|g| g.enabled && g.status == GrantStatus::Active)
            .ok_or_else(|| {
                PanelError::InvalidParameter(format!("{} is not active for '{}'", kind, username))
            })?;

        let session = self.store.record_connect(username, kind, client_ip)?;
        info!("{} connected over {} from {}", username, kind, client_ip);
        Ok(session)
    }

    /// Close the oldest open session of `username`
    pub fn record_disconnect(&self, username: &str, kind: Option<ProtocolKind>) -> PanelResult<Session> {
        validation::validate_username(username)?;
        let session = self.store.record_disconnect(username, kind)?;
        info!("{} disconnected from {}", username, session.kind);
        Ok(session)
    }

    /// Sessions still open, optionally of one kind
    pub fn open_sessions(&self, kind: Option<ProtocolKind>) -> PanelResult<Vec<Session>> {
        self.store.open_sessions(kind)
    }

    /// Check a login and record its time on success
    ///
    /// Unknown usernames simply fail to authenticate.
    pub async fn authenticate(&self, username: &str, password: &str) -> PanelResult<bool> {
        let account = match self.store.get_account(username) {
            Ok(account) => account,
            Err(PanelError::NotFound(_)) | Err(PanelError::InvalidUsername(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let password = password.to_string();
        let stored = account.password;
        let verified = tokio::task::spawn_blocking(move || secrets::verify_password(&password, &stored))
            .await
            .map_err(|e| PanelError::Crypto(format!("verification task failed: {}", e)))?;

        if verified {
            self.store.update_account(username, AccountUpdate::LastLogin(Utc::now()))?;
            debug!("{} authenticated", username);
        }
        Ok(verified)
    }

    /// Client configuration for an active WireGuard grant
    pub fn wireguard_client_config(&self, username: &str) -> PanelResult<String> {
        let grant = self
            .store
            .grant(username, ProtocolKind::WireGuard)?
            .filter(|g| g.enabled && g.status == GrantStatus::Active)
            .ok_or_else(|| PanelError::NotFound(format!("No active WireGuard grant for '{}'", username)))?;
        let secret = grant
            .secret
            .ok_or_else(|| PanelError::Store(format!("WireGuard grant of '{}' has no key material", username)))?;
        wireguard::client_config(&self.config.wireguard, &secret)
    }

    /// Pending -> Active | Failed
    async fn materialize_grant(
        &self,
        username: &str,
        kind: ProtocolKind,
        secret: Option<GrantSecret>,
    ) -> PanelResult<GrantOutcome> {
        let secret = self.prepare_grant(username, kind, secret)?;
        Ok(self.apply_grant(username, kind, secret).await)
    }

    /// Issue material if needed and persist the grant as Pending
    ///
    /// The material is persisted before the adapter runs so a crash never
    /// loses a secret that may already be live.
    fn prepare_grant(
        &self,
        username: &str,
        kind: ProtocolKind,
        secret: Option<GrantSecret>,
    ) -> PanelResult<GrantSecret> {
        let secret = match secret {
            Some(secret) => secret,
            None => self.registry.get(kind)?.issue_secret(&self.config.security)?,
        };

        self.store.set_grant(
            username,
            kind,
            GrantFields {
                enabled: Some(true),
                secret: Some(secret.clone()),
                status: Some(GrantStatus::Pending),
                last_error: Some(None),
            },
        )?;
        Ok(secret)
    }

    /// Run the adapter for a prepared grant and record the outcome
    async fn apply_grant(&self, username: &str, kind: ProtocolKind, secret: GrantSecret) -> GrantOutcome {
        let result = match self.registry.get(kind) {
            Ok(adapter) => {
                spawn_adapter_call(kind, adapter, username, move |adapter, user| async move {
                    adapter.materialize(&user, &secret).await
                })
                .await
            }
            Err(e) => Err(e),
        };

        let (outcome, fields) = match result {
            Ok(effective) => {
                info!("{} active for {}", kind, username);
                (
                    GrantOutcome {
                        kind,
                        status: GrantStatus::Active,
                        error: None,
                        secret: Some(effective.clone()),
                    },
                    GrantFields {
                        secret: Some(effective),
                        ..GrantFields::status(GrantStatus::Active, None)
                    },
                )
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Provisioning {} for {} failed: {}", kind, username, message);
                (
                    GrantOutcome {
                        kind,
                        status: GrantStatus::Failed,
                        error: Some(message.clone()),
                        secret: None,
                    },
                    GrantFields::status(GrantStatus::Failed, Some(message)),
                )
            }
        };

        match self.store.set_grant(username, kind, fields) {
            Ok(_) => outcome,
            Err(e) => {
                warn!("Recording {} outcome for {} failed: {}", kind, username, e);
                GrantOutcome {
                    kind,
                    status: GrantStatus::Pending,
                    error: Some(format!("outcome not recorded: {}", e)),
                    secret: outcome.secret,
                }
            }
        }
    }

    /// Active -> Disabled | Failed
    async fn revoke_grant(&self, username: &str, kind: ProtocolKind) -> PanelResult<GrantOutcome> {
        self.store.set_grant(
            username,
            kind,
            GrantFields {
                enabled: Some(false),
                ..Default::default()
            },
        )?;

        let result = match self.registry.get(kind) {
            Ok(adapter) => {
                spawn_adapter_call(kind, adapter, username, |adapter, user| async move {
                    adapter.revoke(&user).await
                })
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.store
                    .set_grant(username, kind, GrantFields::status(GrantStatus::Disabled, None))?;
                info!("{} disabled for {}", kind, username);
                Ok(GrantOutcome {
                    kind,
                    status: GrantStatus::Disabled,
                    error: None,
                    secret: None,
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Revoking {} for {} failed: {}", kind, username, message);
                self.store
                    .set_grant(username, kind, GrantFields::status(GrantStatus::Failed, Some(message.clone())))?;
                Ok(GrantOutcome {
                    kind,
                    status: GrantStatus::Failed,
                    error: Some(message),
                    secret: None,
                })
            }
        }
    }
}

/// Run an adapter call on its own task so it completes even if the caller
/// is dropped mid-way
async fn spawn_adapter_call<F, Fut, T>(
    kind: ProtocolKind,
    adapter: Arc<dyn ProtocolAdapter>,
    username: &str,
    call: F,
) -> PanelResult<T>
where
    F: FnOnce(Arc<dyn ProtocolAdapter>, String) -> Fut,
    Fut: std::future::Future<Output = PanelResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(call(adapter, username.to_string()))
        .await
        .map_err(|e| PanelError::config_write(kind, format!("adapter task aborted: {}", e)))?
}

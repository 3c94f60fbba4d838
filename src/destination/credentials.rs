//! Provider-agnostic credential handling: expiry buffer, refresh rotation,
//! deactivation on irrecoverable failures.
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::{AdapterError, DestinationAdapter};
use crate::db::{self, CredentialRecord, Pool};
use crate::vault::{Secret, Vault, VaultError};

/// Tokens expiring within this many seconds are refreshed before use.
pub const REFRESH_BUFFER_SECS: i64 = 5 * 60;

/// Lifetime assumed for a refreshed token when the destination omits `expires_in`.
pub const DEFAULT_GRANT_LIFETIME_SECS: i64 = 60 * 60;

/// Whether a token with the given expiry must be refreshed at `now`.
/// Tokens without a stored expiry never need refreshing.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(at) => at - now <= Duration::seconds(REFRESH_BUFFER_SECS),
        None => false,
    }
}

#[derive(Clone)]
pub struct CredentialManager {
    pool: Pool,
    vault: Vault,
    // One async lock per credential so concurrent refreshes are serialised.
    refresh_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager").finish_non_exhaustive()
    }
}

impl CredentialManager {
    pub fn new(pool: Pool, vault: Vault) -> Self {
        Self {
            pool,
            vault,
            refresh_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Encrypt and store a freshly connected credential.
    pub async fn store(
        &self,
        owner_id: i64,
        destination: crate::model::DestinationType,
        access_token: &Secret,
        refresh_token: Option<&Secret>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i64, AdapterError> {
        let access = self.seal(access_token)?;
        let refresh = refresh_token.map(|t| self.seal(t)).transpose()?;
        let id = db::insert_credential(
            &self.pool,
            owner_id,
            destination,
            &access,
            refresh.as_deref(),
            expires_at,
        )
        .await?;
        Ok(id)
    }

    #[instrument(skip(self, adapter))]
    pub async fn get_valid_credential(
        &self,
        adapter: &dyn DestinationAdapter,
        credential_id: i64,
    ) -> Result<Secret, AdapterError> {
        let record = self.load_active(credential_id).await?;
        if needs_refresh(record.token_expires_at, Utc::now()) {
            return self
                .refresh_locked(adapter, credential_id, Some(record.token_expires_at))
                .await;
        }
        self.open(&record, &record.access_token).await
    }

    /// Exchange the stored refresh token for a new pair and persist it.
    #[instrument(skip(self, adapter))]
    pub async fn refresh_credential(
        &self,
        adapter: &dyn DestinationAdapter,
        credential_id: i64,
    ) -> Result<Secret, AdapterError> {
        self.refresh_locked(adapter, credential_id, None).await
    }

    /// Refresh under the per-credential lock. When `observed_expiry` is given and
    /// the stored expiry changed while waiting, another caller already rotated
    /// the token and the stored one is returned instead.
    async fn refresh_locked(
        &self,
        adapter: &dyn DestinationAdapter,
        credential_id: i64,
        observed_expiry: Option<Option<DateTime<Utc>>>,
    ) -> Result<Secret, AdapterError> {
        let lock = self.lock_for(credential_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.refresh_guarded(adapter, credential_id, observed_expiry)
                .await
        };
        self.release_lock(credential_id, lock).await;
        result
    }

    async fn refresh_guarded(
        &self,
        adapter: &dyn DestinationAdapter,
        credential_id: i64,
        observed_expiry: Option<Option<DateTime<Utc>>>,
    ) -> Result<Secret, AdapterError> {
        let record = self.load_active(credential_id).await?;
        if let Some(observed) = observed_expiry {
            if record.token_expires_at != observed
                && !needs_refresh(record.token_expires_at, Utc::now())
            {
                return self.open(&record, &record.access_token).await;
            }
        }

        let Some(sealed_refresh) = record.refresh_token.as_deref() else {
            return Err(self
                .reconnect_required(credential_id, "no refresh token stored")
                .await);
        };
        let refresh_token = self.open(&record, sealed_refresh).await?;

        match adapter.exchange_refresh_token(&refresh_token).await {
            Ok(grant) => {
                let now = Utc::now();
                let lifetime = grant.expires_in.unwrap_or(DEFAULT_GRANT_LIFETIME_SECS);
                let expires_at = Some(now + Duration::seconds(lifetime));
                let access = self.seal(&grant.access_token)?;
                let refresh = grant
                    .refresh_token
                    .as_ref()
                    .map(|t| self.seal(t))
                    .transpose()?;
                db::update_credential_tokens(
                    &self.pool,
                    credential_id,
                    &access,
                    refresh.as_deref(),
                    expires_at,
                    now,
                )
                .await?;
                info!(credential_id, destination = %adapter.destination(), "credential refreshed");
                Ok(grant.access_token)
            }
            Err(AdapterError::RefreshRejected(reason)) => {
                Err(self.reconnect_required(credential_id, &reason).await)
            }
            Err(err) => Err(err),
        }
    }

    async fn lock_for(&self, credential_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(credential_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry once nobody else holds or waits on it.
    async fn release_lock(&self, credential_id: i64, lock: Arc<Mutex<()>>) {
        let mut locks = self.refresh_locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&credential_id);
        }
    }

    async fn load_active(&self, credential_id: i64) -> Result<CredentialRecord, AdapterError> {
        let record = db::fetch_credential(&self.pool, credential_id)
            .await?
            .ok_or(AdapterError::NotFound(credential_id))?;
        if !record.is_active {
            return Err(AdapterError::ReconnectRequired {
                credential_id,
                reason: "credential is inactive".into(),
            });
        }
        Ok(record)
    }

    /// Decrypt one sealed field. Integrity failures deactivate the credential.
    async fn open(&self, record: &CredentialRecord, sealed: &str) -> Result<Secret, AdapterError> {
        match self.vault.decrypt(sealed) {
            Ok(secret) => Ok(secret),
            Err(err) => Err(self.reconnect_required(record.id, &err.to_string()).await),
        }
    }

    fn seal(&self, secret: &Secret) -> Result<String, AdapterError> {
        self.vault
            .encrypt(secret.expose())
            .map_err(|err: VaultError| AdapterError::Storage(err.into()))
    }

    /// Mark the credential inactive and build the error reported to the caller.
    async fn reconnect_required(&self, credential_id: i64, reason: &str) -> AdapterError {
        warn!(credential_id, reason, "deactivating credential; reconnect required");
        if let Err(err) = db::deactivate_credential(&self.pool, credential_id, Utc::now()).await {
            warn!(?err, credential_id, "failed to deactivate credential");
        }
        AdapterError::ReconnectRequired {
            credential_id,
            reason: reason.to_string(),
        }
    }
}

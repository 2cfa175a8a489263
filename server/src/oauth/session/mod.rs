use std::{sync::Arc, time::Duration};

use color_eyre::eyre::WrapErr;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{dpop::DpopKeyPair, resolver::AuthServerMetadata, token::ClientAuth};
use crate::storage::{get_json, put_json, take_json, DynStore};

/// Persisted state for one authenticated AT Protocol identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthSession {
    pub did: String,
    pub handle: Option<String>,
    pub pds_url: String,
    pub auth_server_url: String,
    pub token_endpoint: String,
    pub revocation_endpoint: Option<String>,
    pub client: ClientAuth,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds
    pub expires_at: i64,
    pub scope: String,
    /// Key the tokens are bound to; only the handle and public half live here
    pub dpop_key: DpopKeyPair,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OAuthSession {
    /// True once `now` is within `margin` of the access token's expiry
    pub fn needs_refresh(&self, now: i64, margin: Duration) -> bool {
        now + margin.as_secs() as i64 >= self.expires_at
    }
}

/// Ephemeral state correlating the callback with the login that started it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorizationRequest {
    pub state: String,
    pub code_verifier: String,
    pub did: String,
    pub handle: Option<String>,
    pub pds_url: String,
    pub auth_server: AuthServerMetadata,
    pub client: ClientAuth,
    pub redirect_uri: String,
    pub dpop_key: DpopKeyPair,
    pub return_url: String,
    /// Unix seconds
    pub issued_at: i64,
}

impl PendingAuthorizationRequest {
    pub fn is_expired_at(&self, now: i64, ttl: Duration) -> bool {
        now - self.issued_at > ttl.as_secs() as i64
    }
}

/// Storage headroom past the TTL so the explicit expiry check is the one that fires
const PENDING_STORAGE_GRACE: Duration = Duration::from_secs(60);

pub struct PendingRequestStore {
    store: DynStore,
    ttl: Duration,
}

impl PendingRequestStore {
    pub fn new(store: DynStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(state: &str) -> String {
        format!("pending:{state}")
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn put(&self, request: &PendingAuthorizationRequest) -> color_eyre::Result<()> {
        put_json(
            self.store.as_ref(),
            &Self::key(&request.state),
            request,
            Some(self.ttl + PENDING_STORAGE_GRACE),
        )
        .await
        .wrap_err("Failed to store pending authorization request")
    }

    /// Consume the request for `state`. A second call for the same state gets `None`.
    pub async fn take(&self, state: &str) -> color_eyre::Result<Option<PendingAuthorizationRequest>> {
        take_json(self.store.as_ref(), &Self::key(state)).await
    }
}

/// Sessions keyed by DID, with per-DID refresh serialization
pub struct SessionStore {
    store: DynStore,
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionStore {
    pub fn new(store: DynStore) -> Self {
        Self {
            store,
            refresh_locks: DashMap::new(),
        }
    }

    fn key(did: &str) -> String {
        format!("session:{did}")
    }

    pub async fn get(&self, did: &str) -> color_eyre::Result<Option<OAuthSession>> {
        get_json(self.store.as_ref(), &Self::key(did)).await
    }

    /// The session together with its stored form, for a later compare-and-swap
    pub async fn load(&self, did: &str) -> color_eyre::Result<Option<(OAuthSession, String)>> {
        let Some(raw) = self.store.get(&Self::key(did)).await? else {
            return Ok(None);
        };
        let session = serde_json::from_str(&raw).wrap_err("Corrupt stored session")?;
        Ok(Some((session, raw)))
    }

    pub async fn put(&self, session: &OAuthSession) -> color_eyre::Result<()> {
        put_json(self.store.as_ref(), &Self::key(&session.did), session, None).await
    }

    /// Replace the session only if it is still exactly `previous_raw`
    pub async fn swap(&self, previous_raw: &str, session: &OAuthSession) -> color_eyre::Result<bool> {
        let raw = serde_json::to_string(session).wrap_err("Failed to serialize session")?;
        self.store
            .compare_and_swap(&Self::key(&session.did), previous_raw, &raw)
            .await
    }

    pub async fn delete(&self, did: &str) -> color_eyre::Result<bool> {
        self.store.delete(&Self::key(did)).await
    }

    /// The mutex every refresh of `did` must hold
    pub fn refresh_lock(&self, did: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .entry(did.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the mutex for `did` once nobody else holds a reference to it
    pub fn release_refresh_lock(&self, did: &str) {
        self.refresh_locks
            .remove_if(did, |_, lock| Arc::strong_count(lock) == 1);
    }
}

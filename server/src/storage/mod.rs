//! Key-value persistence for OAuth material
//!
//! Everything the OAuth flow persists (pending authorization requests, sessions,
//! DPoP keys and identity links) goes through [`KeyValueStore`]. Values are JSON
//! strings under namespaced keys.

use std::{sync::Arc, time::Duration};

use color_eyre::eyre::WrapErr;
use serde::{de::DeserializeOwned, Serialize};

mod encrypted;
mod memory;
mod postgres;

pub use encrypted::EncryptedStore;
pub use memory::MemoryStore;
pub use postgres::{setup_db_pool, PgStore};

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a live (non-expired) value
    async fn get(&self, key: &str) -> color_eyre::Result<Option<String>>;

    /// Insert or overwrite a value, optionally expiring after `ttl`
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> color_eyre::Result<()>;

    /// Write a value only if no live value exists, returning whether it was written
    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> color_eyre::Result<bool>;

    /// Remove a value, returning whether anything was removed
    async fn delete(&self, key: &str) -> color_eyre::Result<bool>;

    /// Atomically read and remove a value.
    ///
    /// Of any number of concurrent callers for the same key, at most one sees
    /// `Some`.
    async fn take(&self, key: &str) -> color_eyre::Result<Option<String>>;

    /// Replace the value only if it currently equals `expected`
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> color_eyre::Result<bool>;

    /// Drop every expired entry, returning how many were removed
    async fn purge_expired(&self) -> color_eyre::Result<u64>;
}

pub type DynStore = Arc<dyn KeyValueStore>;

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> color_eyre::Result<Option<T>> {
    store
        .get(key)
        .await?
        .map(|raw| serde_json::from_str(&raw).wrap_err_with(|| format!("Corrupt value at {key}")))
        .transpose()
}

pub async fn put_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> color_eyre::Result<()> {
    let raw = serde_json::to_string(value).wrap_err("Failed to serialize stored value")?;
    store.put(key, &raw, ttl).await
}

pub async fn take_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> color_eyre::Result<Option<T>> {
    store
        .take(key)
        .await?
        .map(|raw| serde_json::from_str(&raw).wrap_err_with(|| format!("Corrupt value at {key}")))
        .transpose()
}

/// Build the configured store: Postgres when a pool is given, memory otherwise,
/// wrapped in age encryption when a key is configured.
pub fn build_store(
    pool: Option<sqlx::PgPool>,
    encryption_key: Option<Arc<age::x25519::Identity>>,
) -> DynStore {
    let base: DynStore = match pool {
        Some(pool) => Arc::new(PgStore::new(pool)),
        None => Arc::new(MemoryStore::default()),
    };

    match encryption_key {
        Some(key) => Arc::new(EncryptedStore::new(base, key)),
        None => base,
    }
}

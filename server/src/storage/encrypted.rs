use std::{sync::Arc, time::Duration};

use age::x25519::Identity;

use super::{DynStore, KeyValueStore};
use crate::encryption::Sealer;

/// Encrypts every value at rest with age before handing it to the inner store
pub struct EncryptedStore {
    inner: DynStore,
    sealer: Sealer,
}

impl EncryptedStore {
    pub fn new(inner: DynStore, key: Arc<Identity>) -> Self {
        Self {
            inner,
            sealer: Sealer::new(key),
        }
    }

    async fn open(&self, sealed: Option<String>) -> color_eyre::Result<Option<String>> {
        match sealed {
            Some(sealed) => Ok(Some(self.sealer.open(&sealed).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl KeyValueStore for EncryptedStore {
    async fn get(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let sealed = self.inner.get(key).await?;
        self.open(sealed).await
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> color_eyre::Result<()> {
        let sealed = self.sealer.seal(value).await?;
        self.inner.put(key, &sealed, ttl).await
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> color_eyre::Result<bool> {
        let sealed = self.sealer.seal(value).await?;
        self.inner.insert_if_absent(key, &sealed, ttl).await
    }

    async fn delete(&self, key: &str) -> color_eyre::Result<bool> {
        self.inner.delete(key).await
    }

    async fn take(&self, key: &str) -> color_eyre::Result<Option<String>> {
        let sealed = self.inner.take(key).await?;
        self.open(sealed).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> color_eyre::Result<bool> {
        // age ciphertexts are randomized, so compare plaintexts and swap on the
        // exact ciphertext that was read.
        let Some(current_sealed) = self.inner.get(key).await? else {
            return Ok(false);
        };
        if self.sealer.open(&current_sealed).await? != expected {
            return Ok(false);
        }

        let new_sealed = self.sealer.seal(new).await?;
        self.inner
            .compare_and_swap(key, &current_sealed, &new_sealed)
            .await
    }

    async fn purge_expired(&self) -> color_eyre::Result<u64> {
        self.inner.purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn values_are_encrypted_at_rest() {
        let inner: DynStore = Arc::new(MemoryStore::default());
        let store = EncryptedStore::new(inner.clone(), Arc::new(Identity::generate()));

        store.put("session:did:plc:abc", "secret-token", None).await.unwrap();

        let raw = inner.get("session:did:plc:abc").await.unwrap().unwrap();
        assert!(!raw.contains("secret-token"));
        assert_eq!(
            store.get("session:did:plc:abc").await.unwrap().as_deref(),
            Some("secret-token")
        );
    }

    #[tokio::test]
    async fn compare_and_swap_compares_plaintext() {
        let inner: DynStore = Arc::new(MemoryStore::default());
        let store = EncryptedStore::new(inner, Arc::new(Identity::generate()));
        store.put("k", "v1", None).await.unwrap();

        assert!(!store.compare_and_swap("k", "other", "v2").await.unwrap());
        assert!(store.compare_and_swap("k", "v1", "v2").await.unwrap());
        assert_eq!(store.take("k").await.unwrap().as_deref(), Some("v2"));
    }
}

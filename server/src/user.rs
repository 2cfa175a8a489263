use serde::{Deserialize, Serialize};
use time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::{
    cookies::{Cookie, CookieJar},
    oauth::utils::now_unix,
    storage::{get_json, DynStore},
};

/// Cookie name for the application session
pub const SESSION_COOKIE_NAME: &str = "trainers_session";

/// Default session duration in days
pub const DEFAULT_SESSION_DURATION_DAYS: i64 = 30;

/// Relates an AT Protocol DID to an application user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLinkRecord {
    pub did: String,
    /// Unset until the account-linking step completes
    pub user_id: Option<Uuid>,
    pub handle: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{did} is already linked to another account")]
    AlreadyLinked { did: String },

    #[error(transparent)]
    Storage(#[from] color_eyre::Report),
}

/// Lookup of which application user, if any, owns a DID
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_did(&self, did: &str) -> color_eyre::Result<Option<IdentityLinkRecord>>;

    /// Make sure a record exists for `did`, refreshing its handle
    async fn record_identity(
        &self,
        did: &str,
        handle: Option<&str>,
    ) -> color_eyre::Result<IdentityLinkRecord>;

    /// Attach `did` to `user_id`. Linking the same pair again is a no-op.
    async fn link_user(&self, did: &str, user_id: Uuid) -> Result<IdentityLinkRecord, LinkError>;
}

/// Hands a signed-in DID over to the application's own session handling
#[async_trait::async_trait]
pub trait SessionIssuer: Send + Sync {
    async fn issue(&self, cookies: &CookieJar, user_id: Uuid, did: &str) -> color_eyre::Result<()>;
}

/// [`UserDirectory`] on top of the key-value store, under `identity:{did}`
pub struct StoreUserDirectory {
    store: DynStore,
}

/// Attempts before giving up on a contended update
const UPDATE_ATTEMPTS: usize = 5;

impl StoreUserDirectory {
    pub fn new(store: DynStore) -> Self {
        Self { store }
    }

    fn key(did: &str) -> String {
        format!("identity:{did}")
    }

    /// `None` when another writer created the record first
    async fn create(
        &self,
        did: &str,
        handle: Option<&str>,
    ) -> color_eyre::Result<Option<IdentityLinkRecord>> {
        let now = now_unix();
        let record = IdentityLinkRecord {
            did: did.to_string(),
            user_id: None,
            handle: handle.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        let raw = serde_json::to_string(&record)?;

        if self.store.insert_if_absent(&Self::key(did), &raw, None).await? {
            info!(%did, "Recorded new AT Protocol identity");
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }
}

#[async_trait::async_trait]
impl UserDirectory for StoreUserDirectory {
    async fn find_by_did(&self, did: &str) -> color_eyre::Result<Option<IdentityLinkRecord>> {
        get_json(self.store.as_ref(), &Self::key(did)).await
    }

    async fn record_identity(
        &self,
        did: &str,
        handle: Option<&str>,
    ) -> color_eyre::Result<IdentityLinkRecord> {
        for _ in 0..UPDATE_ATTEMPTS {
            let Some(raw) = self.store.get(&Self::key(did)).await? else {
                match self.create(did, handle).await? {
                    Some(record) => return Ok(record),
                    None => continue,
                }
            };
            let mut record: IdentityLinkRecord = serde_json::from_str(&raw)?;
            if handle.is_none() || record.handle.as_deref() == handle {
                return Ok(record);
            }

            record.handle = handle.map(str::to_string);
            record.updated_at = now_unix();
            let updated = serde_json::to_string(&record)?;
            if self
                .store
                .compare_and_swap(&Self::key(did), &raw, &updated)
                .await?
            {
                return Ok(record);
            }
        }

        Err(color_eyre::eyre::eyre!(
            "Gave up recording {did} after repeated concurrent updates"
        ))
    }

    async fn link_user(&self, did: &str, user_id: Uuid) -> Result<IdentityLinkRecord, LinkError> {
        for _ in 0..UPDATE_ATTEMPTS {
            let Some(raw) = self.store.get(&Self::key(did)).await? else {
                self.create(did, None).await?;
                continue;
            };
            let mut record: IdentityLinkRecord = serde_json::from_str(&raw)
                .map_err(|e| LinkError::Storage(color_eyre::eyre::eyre!(e)))?;

            match record.user_id {
                Some(existing) if existing == user_id => return Ok(record),
                Some(_) => {
                    return Err(LinkError::AlreadyLinked {
                        did: did.to_string(),
                    })
                }
                None => {}
            }

            record.user_id = Some(user_id);
            record.updated_at = now_unix();
            let updated = serde_json::to_string(&record)
                .map_err(|e| LinkError::Storage(color_eyre::eyre::eyre!(e)))?;
            if self
                .store
                .compare_and_swap(&Self::key(did), &raw, &updated)
                .await?
            {
                info!(%did, %user_id, "Linked AT Protocol identity");
                return Ok(record);
            }
        }

        Err(LinkError::Storage(color_eyre::eyre::eyre!(
            "Gave up linking {did} after repeated concurrent updates"
        )))
    }
}

/// Starts an application session by writing the user id into a private cookie
pub struct CookieSessionIssuer {
    pub secure: bool,
}

#[async_trait::async_trait]
impl SessionIssuer for CookieSessionIssuer {
    async fn issue(&self, cookies: &CookieJar, user_id: Uuid, did: &str) -> color_eyre::Result<()> {
        let mut cookie = Cookie::new(SESSION_COOKIE_NAME, user_id.to_string());
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_secure(self.secure);
        cookie.set_same_site(tower_cookies::cookie::SameSite::Lax);
        cookie.set_max_age(Duration::days(DEFAULT_SESSION_DURATION_DAYS));
        cookies.add(cookie);

        info!(%did, %user_id, "Issued application session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::MemoryStore;

    fn directory() -> StoreUserDirectory {
        StoreUserDirectory::new(Arc::new(MemoryStore::default()))
    }

    #[tokio::test]
    async fn new_identities_start_unlinked() {
        let users = directory();
        assert!(users.find_by_did("did:plc:example123").await.unwrap().is_none());

        let record = users
            .record_identity("did:plc:example123", Some("ash.bsky.social"))
            .await
            .unwrap();
        assert_eq!(record.user_id, None);

        let found = users.find_by_did("did:plc:example123").await.unwrap().unwrap();
        assert_eq!(found.handle.as_deref(), Some("ash.bsky.social"));
    }

    #[tokio::test]
    async fn recording_again_updates_the_handle_but_keeps_the_link() {
        let users = directory();
        let user_id = Uuid::new_v4();
        users.link_user("did:plc:example123", user_id).await.unwrap();

        users
            .record_identity("did:plc:example123", Some("misty.bsky.social"))
            .await
            .unwrap();

        let found = users.find_by_did("did:plc:example123").await.unwrap().unwrap();
        assert_eq!(found.user_id, Some(user_id));
        assert_eq!(found.handle.as_deref(), Some("misty.bsky.social"));
    }

    #[tokio::test]
    async fn a_did_maps_to_at_most_one_user() {
        let users = directory();
        let first = Uuid::new_v4();

        users.link_user("did:plc:example123", first).await.unwrap();
        assert!(users.link_user("did:plc:example123", first).await.is_ok());

        let err = users
            .link_user("did:plc:example123", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::AlreadyLinked { .. }));
        assert_eq!(
            users
                .find_by_did("did:plc:example123")
                .await
                .unwrap()
                .unwrap()
                .user_id,
            Some(first)
        );
    }

    #[tokio::test]
    async fn concurrent_links_have_one_winner() {
        let users = Arc::new(directory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let users = users.clone();
                tokio::spawn(async move { users.link_user("did:plc:race", Uuid::new_v4()).await })
            })
            .collect();

        let mut linked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => linked += 1,
                Err(err) => assert!(matches!(err, LinkError::AlreadyLinked { .. })),
            }
        }
        assert_eq!(linked, 1);
    }
}

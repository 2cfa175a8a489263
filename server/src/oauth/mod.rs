//! AT Protocol OAuth client
//!
//! [`OAuthClient`] is built once at startup and shared by the route handlers. It
//! owns the resolver, the DPoP transport and the pending-request and session
//! stores; the flow itself is split across the submodules.

use std::{sync::Arc, time::Duration};

use color_eyre::eyre::WrapErr;

use crate::{config::AppConfig, storage::DynStore};

pub mod dpop;
pub mod error;
pub mod exchange;
pub mod jwk;
pub mod metadata;
pub mod par;
mod refresh;
mod resource;
pub mod resolver;
pub mod session;
pub mod token;
pub mod utils;

pub use error::{DpopError, OAuthError};
pub use exchange::ExchangeOutcome;
pub use par::AuthorizationRedirect;

use dpop::{DpopClient, KeyManager, P256KeyManager};
use jwk::JwkSet;
use resolver::IdentityResolver;
use session::{PendingRequestStore, SessionStore};

pub struct OAuthClient {
    config: Arc<AppConfig>,
    resolver: IdentityResolver,
    dpop: DpopClient,
    pending: PendingRequestStore,
    sessions: SessionStore,
}

impl OAuthClient {
    pub fn new(config: Arc<AppConfig>, store: DynStore) -> color_eyre::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .wrap_err("Failed to build HTTP client")?;

        // Keys of abandoned attempts outlive the pending request they belong to a little.
        let keys = P256KeyManager::new(store.clone(), config.pending_request_ttl * 2);

        Ok(Self::with_parts(config, store, http, Arc::new(keys)))
    }

    /// Assemble a client around an existing HTTP client and key manager
    pub fn with_parts(
        config: Arc<AppConfig>,
        store: DynStore,
        http: reqwest::Client,
        keys: Arc<dyn KeyManager>,
    ) -> Self {
        let resolver = IdentityResolver::new(
            http.clone(),
            config.handle_resolver_url.clone(),
            config.plc_directory_url.clone(),
            config.resolve_timeout,
        );

        Self {
            resolver,
            dpop: DpopClient::new(http, keys),
            pending: PendingRequestStore::new(store.clone(), config.pending_request_ttl),
            sessions: SessionStore::new(store),
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    fn keys(&self) -> &Arc<dyn KeyManager> {
        self.dpop.keys()
    }

    fn token_timeout(&self) -> Duration {
        self.config.token_timeout
    }

    /// Public keys of the confidential client, for the `jwks_uri`
    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: self
                .config
                .signing_key
                .iter()
                .map(|key| key.public_jwk())
                .collect(),
        }
    }
}

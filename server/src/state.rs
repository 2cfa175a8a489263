use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    config::AppConfig,
    oauth::OAuthClient,
    storage::{build_store, setup_db_pool, DynStore},
    user::{CookieSessionIssuer, SessionIssuer, StoreUserDirectory, UserDirectory},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub oauth: Arc<OAuthClient>,
    pub store: DynStore,
    pub users: Arc<dyn UserDirectory>,
    pub session_issuer: Arc<dyn SessionIssuer>,
}

impl AppState {
    pub async fn from_env() -> color_eyre::Result<Self> {
        let config = AppConfig::from_env()?;

        if config.signing_key.is_none() {
            warn!("ATPROTO_PRIVATE_KEY is not set; Bluesky sign-in will answer 503");
        }
        if config.site_url.is_none() {
            info!("SITE_URL not set, deriving client metadata URLs from the request host");
        }

        let pool = match &config.database_url {
            Some(url) => Some(setup_db_pool(url).await?),
            None => {
                info!("DATABASE_URL not set, keeping OAuth state in memory");
                None
            }
        };
        let store = build_store(pool, config.encryption_key.clone());

        Self::new(config, store)
    }

    /// Wire up the default collaborators around `store`
    pub fn new(config: AppConfig, store: DynStore) -> color_eyre::Result<Self> {
        let config = Arc::new(config);
        let oauth = OAuthClient::new(config.clone(), store.clone())?;

        Ok(Self {
            users: Arc::new(StoreUserDirectory::new(store.clone())),
            session_issuer: Arc::new(CookieSessionIssuer {
                secure: !config.development_mode,
            }),
            oauth: Arc::new(oauth),
            store,
            config,
        })
    }

    /// Cookies carry `Secure` outside development mode
    pub fn secure_cookies(&self) -> bool {
        !self.config.development_mode
    }
}

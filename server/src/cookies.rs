use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse as _, Response},
};
use tracing::error;

pub use tower_cookies::Cookie;

use crate::state::AppState;

/// Private (encrypted and authenticated) cookies, keyed by the app's cookie key
pub struct CookieJar {
    cookies: tower_cookies::Cookies,
    key: tower_cookies::Key,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for CookieJar {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = match tower_cookies::Cookies::from_request_parts(parts, state).await {
            Ok(cookies) => cookies,
            Err(_) => {
                error!("Failed to extract cookies from request");
                return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
        };

        Ok(CookieJar {
            cookies,
            key: state.config.cookie_key.clone(),
        })
    }
}

impl CookieJar {
    /// Add a new private cookie
    pub fn add(&self, cookie: Cookie<'static>) {
        self.cookies.private(&self.key).add(cookie);
    }

    /// Get a private cookie by name. Tampered cookies read as absent.
    pub fn get(&self, name: &str) -> Option<Cookie<'static>> {
        self.cookies.private(&self.key).get(name)
    }

    /// Removes the `cookie` from the jar.
    pub fn remove(&self, cookie: Cookie<'static>) {
        self.cookies.private(&self.key).remove(cookie);
    }
}

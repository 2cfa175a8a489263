use axum::routing::{get, post};
use tower_cookies::CookieManagerLayer;

use crate::{
    oauth::metadata::{
        CALLBACK_PATH, JWKS_PATH, NATIVE_CLIENT_METADATA_PATH, WEB_CLIENT_METADATA_PATH,
    },
    state::AppState,
};

pub mod oauth;

/// Build the application router with all routes
pub fn routes(app_state: AppState) -> axum::Router {
    axum::Router::new()
        // AT Protocol OAuth client documents
        .route(WEB_CLIENT_METADATA_PATH, get(oauth::client_metadata::web))
        .route(NATIVE_CLIENT_METADATA_PATH, get(oauth::client_metadata::native))
        .route(JWKS_PATH, get(oauth::client_metadata::jwks))
        // Authorization flow
        .route("/oauth/login", get(oauth::login::login))
        .route(CALLBACK_PATH, get(oauth::callback::callback))
        .route("/oauth/link", post(oauth::link::link))
        .layer(CookieManagerLayer::new())
        // Add trace layer for debugging
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}

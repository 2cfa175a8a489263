use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::{IntoResponse, Json, Response},
};

use super::request_origin;
use crate::{
    oauth::metadata::{native_client_metadata, web_client_metadata},
    state::AppState,
};

const CACHE_CONTROL: &str = "public, max-age=3600";

/// Confidential client document for the web app
pub async fn web(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let origin = state.config.public_origin(&request_origin(&headers));
    let metadata = web_client_metadata(&origin, &state.config.client_name);

    ([(header::CACHE_CONTROL, CACHE_CONTROL)], Json(metadata)).into_response()
}

/// Public client document for the mobile app
pub async fn native(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let origin = state.config.public_origin(&request_origin(&headers));
    let metadata = native_client_metadata(&origin, &state.config.client_name);

    ([(header::CACHE_CONTROL, CACHE_CONTROL)], Json(metadata)).into_response()
}

pub async fn jwks(State(state): State<AppState>) -> Response {
    ([(header::CACHE_CONTROL, CACHE_CONTROL)], Json(state.oauth.jwks())).into_response()
}

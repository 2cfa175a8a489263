use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::info;

use super::{found, request_origin};
use crate::{errors::ErrorBody, oauth::metadata::web_client_metadata, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginParams {
    pub handle: Option<String>,
    pub return_url: Option<String>,
}

/// Start a sign-in: resolve the handle, push the request, send the browser on
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> Response {
    let Some(handle) = params.handle.as_deref().map(str::trim).filter(|h| !h.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new("missing_handle", "A handle is required")),
        )
            .into_response();
    };

    let origin = state.config.public_origin(&request_origin(&headers));
    let client = web_client_metadata(&origin, &state.config.client_name);

    match state
        .oauth
        .start_authorization(handle, params.return_url.as_deref(), &client)
        .await
    {
        Ok(redirect) => {
            info!(%handle, "Redirecting to authorization server");
            found(&redirect.url)
        }
        Err(err) => err.into_response(),
    }
}

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::found;
use crate::{
    cookies::{Cookie, CookieJar},
    errors::ErrorBody,
    oauth::{par::sanitize_return_url, utils::now_unix},
    state::AppState,
    user::{IdentityLinkRecord, LinkError, SESSION_COOKIE_NAME},
};

/// Private cookie carrying the DID from the callback to the linking step
pub const LINK_MARKER_COOKIE: &str = "atproto_did";

pub const LINK_MARKER_MAX_AGE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMarker {
    pub did: String,
    pub issued_at: i64,
}

impl LinkMarker {
    fn is_expired_at(&self, now: i64) -> bool {
        now - self.issued_at > LINK_MARKER_MAX_AGE_SECS
    }
}

/// Remember `did` for the account-linking step. Never carries tokens.
pub(crate) fn set_link_marker(cookies: &CookieJar, did: &str, secure: bool) -> color_eyre::Result<()> {
    let marker = serde_json::to_string(&LinkMarker {
        did: did.to_string(),
        issued_at: now_unix(),
    })?;

    let mut cookie = Cookie::new(LINK_MARKER_COOKIE, marker);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(secure);
    cookie.set_same_site(tower_cookies::cookie::SameSite::Lax);
    cookie.set_max_age(Duration::seconds(LINK_MARKER_MAX_AGE_SECS));
    cookies.add(cookie);

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum AccountLinkError {
    #[error("no Bluesky account is waiting to be linked")]
    MissingMarker,

    #[error("the Bluesky account link has expired")]
    Expired,

    #[error(transparent)]
    Link(#[from] LinkError),
}

impl AccountLinkError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingMarker => "link_missing",
            Self::Expired => "link_expired",
            Self::Link(LinkError::AlreadyLinked { .. }) => "already_linked",
            Self::Link(LinkError::Storage(_)) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingMarker | Self::Expired => StatusCode::BAD_REQUEST,
            Self::Link(LinkError::AlreadyLinked { .. }) => StatusCode::CONFLICT,
            Self::Link(LinkError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AccountLinkError {
    fn into_response(self) -> Response {
        let description = match &self {
            Self::Link(LinkError::Storage(report)) => {
                tracing::error!(error = ?report, "Account link failed");
                "An unexpected error occurred".to_string()
            }
            other => other.to_string(),
        };
        (self.status(), Json(ErrorBody::new(self.code(), description))).into_response()
    }
}

/// Consume the link marker and attach its DID to `user_id`.
///
/// The marker is single use: it is cleared whether or not linking succeeds.
pub async fn complete_account_link(
    state: &AppState,
    cookies: &CookieJar,
    user_id: Uuid,
) -> Result<IdentityLinkRecord, AccountLinkError> {
    let cookie = cookies
        .get(LINK_MARKER_COOKIE)
        .ok_or(AccountLinkError::MissingMarker)?;
    let mut removal = Cookie::new(LINK_MARKER_COOKIE, "");
    removal.set_path("/");
    cookies.remove(removal);

    let marker: LinkMarker =
        serde_json::from_str(cookie.value()).map_err(|_| AccountLinkError::MissingMarker)?;
    if marker.is_expired_at(now_unix()) {
        return Err(AccountLinkError::Expired);
    }

    let record = state.users.link_user(&marker.did, user_id).await?;
    info!(did = %marker.did, %user_id, "Completed account link");
    Ok(record)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkParams {
    pub return_url: Option<String>,
}

/// Link the pending Bluesky account to the signed-in application user
pub async fn link(
    State(state): State<AppState>,
    cookies: CookieJar,
    Query(params): Query<LinkParams>,
) -> Response {
    let Some(user_id) = cookies
        .get(SESSION_COOKIE_NAME)
        .and_then(|cookie| Uuid::parse_str(cookie.value()).ok())
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::new("not_signed_in", "Sign in before linking an account")),
        )
            .into_response();
    };

    match complete_account_link(&state, &cookies, user_id).await {
        Ok(record) => {
            if let Err(err) = state
                .session_issuer
                .issue(&cookies, user_id, &record.did)
                .await
            {
                warn!(error = ?err, "Failed to refresh application session after linking");
            }
            found(&sanitize_return_url(params.return_url.as_deref()))
        }
        Err(err) => err.into_response(),
    }
}

//! Completion of the authorization flow.
//!
//! The callback walks `Received -> StateValidated -> TokenExchanged ->
//! IdentityResolved` and always ends in one of three redirects: signed in,
//! account linking required, or back to sign-in with an error code.

use axum::{
    extract::{Query, State},
    response::Response,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use super::{found, link::set_link_marker, with_query};
use crate::{config::AppConfig, cookies::CookieJar, oauth::OAuthError, state::AppState};

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub iss: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Terminal states of the callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    SignedIn { did: String, return_url: String },
    LinkRequired { did: String, return_url: String },
    Failed { error: String, description: String },
}

impl CallbackOutcome {
    fn failed(err: &OAuthError) -> Self {
        Self::Failed {
            error: err.code().to_string(),
            description: err.description(),
        }
    }

    /// Where the browser goes next
    pub fn location(&self, config: &AppConfig) -> String {
        match self {
            Self::SignedIn { return_url, .. } => return_url.clone(),
            Self::LinkRequired { return_url, .. } => {
                with_query(&config.link_account_path, &[("returnUrl", return_url.as_str())])
            }
            Self::Failed { error, description } => with_query(
                &config.sign_in_path,
                &[("error", error.as_str()), ("error_description", description.as_str())],
            ),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub async fn callback(
    State(state): State<AppState>,
    cookies: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    let outcome = complete_callback(&state, &cookies, params).await;

    match &outcome {
        CallbackOutcome::SignedIn { did, .. } => info!(%did, "Callback: signed in"),
        CallbackOutcome::LinkRequired { did, .. } => info!(%did, "Callback: link required"),
        CallbackOutcome::Failed { error, .. } => warn!(code = %error, "Callback: failed"),
    }

    found(&outcome.location(&state.config))
}

/// Run the callback state machine to a terminal state
pub async fn complete_callback(
    state: &AppState,
    cookies: &CookieJar,
    params: CallbackParams,
) -> CallbackOutcome {
    let pending_state = non_empty(params.state);

    if let Some(error) = non_empty(params.error) {
        if let Some(pending_state) = &pending_state {
            if let Err(err) = state.oauth.abandon_authorization(pending_state).await {
                warn!(error = %err, "Failed to discard abandoned authorization");
            }
        }
        return CallbackOutcome::Failed {
            description: non_empty(params.error_description)
                .unwrap_or_else(|| "The authorization server did not grant access".to_string()),
            error,
        };
    }

    let Some(pending_state) = pending_state else {
        return CallbackOutcome::failed(&OAuthError::InvalidOrExpiredState);
    };
    let Some(code) = non_empty(params.code) else {
        if let Err(err) = state.oauth.abandon_authorization(&pending_state).await {
            warn!(error = %err, "Failed to discard authorization without a code");
        }
        return CallbackOutcome::failed(&OAuthError::TokenExchange(
            "the authorization server returned no code".to_string(),
        ));
    };

    let exchanged = match state
        .oauth
        .exchange_code(&pending_state, &code, params.iss.as_deref())
        .await
    {
        Ok(exchanged) => exchanged,
        Err(err) => return CallbackOutcome::failed(&err),
    };
    info!(did = %exchanged.did, "Callback: token exchanged");

    let record = match state
        .users
        .record_identity(&exchanged.did, exchanged.handle.as_deref())
        .await
    {
        Ok(record) => record,
        Err(report) => {
            error!(error = ?report, "Failed to look up identity link");
            return CallbackOutcome::failed(&OAuthError::Internal(report));
        }
    };
    info!(did = %exchanged.did, linked = record.user_id.is_some(), "Callback: identity resolved");

    match record.user_id {
        Some(user_id) => {
            if let Err(report) = state
                .session_issuer
                .issue(cookies, user_id, &exchanged.did)
                .await
            {
                error!(error = ?report, "Failed to issue application session");
                return CallbackOutcome::failed(&OAuthError::Internal(report));
            }
            CallbackOutcome::SignedIn {
                did: exchanged.did,
                return_url: exchanged.return_url,
            }
        }
        None => {
            if let Err(report) = set_link_marker(cookies, &exchanged.did, state.secure_cookies()) {
                error!(error = ?report, "Failed to set link marker");
                return CallbackOutcome::failed(&OAuthError::Internal(report));
            }
            CallbackOutcome::LinkRequired {
                did: exchanged.did,
                return_url: exchanged.return_url,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_redirect_to_sign_in_with_code_and_description() {
        let config = AppConfig::default();
        let outcome = CallbackOutcome::failed(&OAuthError::InvalidOrExpiredState);

        let location = outcome.location(&config);
        assert!(location.starts_with("/sign-in?error=invalid_state&error_description="));
    }

    #[test]
    fn internal_failures_do_not_leak_details() {
        let config = AppConfig::default();
        let outcome = CallbackOutcome::failed(&OAuthError::Internal(color_eyre::eyre::eyre!(
            "postgres password authentication failed"
        )));

        let location = outcome.location(&config);
        assert!(!location.contains("postgres"));
        assert!(location.contains("error=server_error"));
    }

    #[test]
    fn link_required_preserves_return_url() {
        let config = AppConfig::default();
        let outcome = CallbackOutcome::LinkRequired {
            did: "did:plc:example123".to_string(),
            return_url: "/teams?tab=1".to_string(),
        };

        assert_eq!(
            outcome.location(&config),
            "/sign-up/link-bluesky?returnUrl=%2Fteams%3Ftab%3D1"
        );
    }
}

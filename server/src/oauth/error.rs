use axum::http::StatusCode;

/// Failures of the AT Protocol OAuth flow.
///
/// Every variant has a stable machine readable [`code`](OAuthError::code) and a
/// [`description`](OAuthError::description) that is safe to hand back to the
/// browser. `Internal` wraps infrastructure failures whose text is only logged.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("no DID found for handle {0}")]
    HandleNotFound(String),

    #[error("PDS unreachable: {0}")]
    PdsUnreachable(String),

    #[error("OAuth client is misconfigured: {0}")]
    MisconfiguredClient(String),

    #[error("authorization server rejected the request: {error}")]
    AuthServerRejected {
        error: String,
        description: Option<String>,
    },

    #[error("invalid or expired state")]
    InvalidOrExpiredState,

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("session expired")]
    SessionExpired,

    #[error("internal error")]
    Internal(color_eyre::Report),
}

impl OAuthError {
    pub fn code(&self) -> &str {
        match self {
            Self::HandleNotFound(_) => "handle_not_found",
            Self::PdsUnreachable(_) => "pds_unreachable",
            Self::MisconfiguredClient(_) => "server_misconfigured",
            Self::AuthServerRejected { error, .. } => error,
            Self::InvalidOrExpiredState => "invalid_state",
            Self::TokenExchange(_) => "token_exchange_failed",
            Self::SessionExpired => "session_expired",
            Self::Internal(_) => "server_error",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::HandleNotFound(handle) => format!("Could not resolve the handle {handle}"),
            Self::PdsUnreachable(reason) => format!("Could not reach your account's server: {reason}"),
            Self::MisconfiguredClient(_) => {
                "Bluesky sign-in is temporarily unavailable".to_string()
            }
            Self::AuthServerRejected { error, description } => description
                .clone()
                .unwrap_or_else(|| format!("The authorization server returned {error}")),
            Self::InvalidOrExpiredState => {
                "This sign-in attempt is invalid or has expired. Please try again".to_string()
            }
            Self::TokenExchange(reason) => format!("Could not complete sign-in: {reason}"),
            Self::SessionExpired => "Your Bluesky session has expired. Please sign in again".to_string(),
            Self::Internal(_) => "An unexpected error occurred".to_string(),
        }
    }

    /// Status used when the error is answered directly rather than redirected
    pub fn status(&self) -> StatusCode {
        match self {
            Self::HandleNotFound(_) => StatusCode::NOT_FOUND,
            Self::MisconfiguredClient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidOrExpiredState => StatusCode::BAD_REQUEST,
            Self::SessionExpired => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<color_eyre::Report> for OAuthError {
    fn from(report: color_eyre::Report) -> Self {
        Self::Internal(report)
    }
}

/// Key manager failures
#[derive(Debug, thiserror::Error)]
pub enum DpopError {
    #[error("DPoP key {0} not found")]
    KeyNotFound(String),

    #[error("stored DPoP key is invalid: {0}")]
    InvalidKey(String),

    #[error("DPoP key storage failed: {0}")]
    Storage(color_eyre::Report),

    #[error("signing DPoP proof failed: {0}")]
    Signing(color_eyre::Report),
}

impl From<DpopError> for OAuthError {
    fn from(err: DpopError) -> Self {
        match err {
            // A lost key cannot be reconstructed, so the session is gone with it.
            DpopError::KeyNotFound(_) => Self::SessionExpired,
            DpopError::InvalidKey(_) => Self::Internal(color_eyre::eyre::eyre!(err)),
            DpopError::Storage(report) | DpopError::Signing(report) => Self::Internal(report),
        }
    }
}

/// Failure to get any HTTP response out of a DPoP-bound request
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Dpop(#[from] DpopError),

    #[error("failed to prepare request")]
    Prepare(color_eyre::Report),

    #[error("request timed out")]
    Timeout,

    #[error("network error")]
    Network(#[source] reqwest::Error),
}

impl TransportError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err)
        }
    }

    /// Fold into the flow's taxonomy, using `wrap` for network level failures
    pub fn into_oauth_error(self, wrap: impl FnOnce(String) -> OAuthError) -> OAuthError {
        match self {
            Self::Dpop(err) => err.into(),
            Self::Prepare(report) => OAuthError::Internal(report),
            Self::Network(ref source) => {
                tracing::warn!(error = %source, "OAuth request failed");
                wrap(self.to_string())
            }
            Self::Timeout => wrap(self.to_string()),
        }
    }
}

use axum::response::{IntoResponse, Json, Response};

use crate::oauth::OAuthError;

/// JSON body for errors answered directly instead of redirected
#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_description: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: description.into(),
        }
    }
}

/// Render an OAuth failure as `status` + `{error, error_description}`.
///
/// Only the client-safe description goes out; the full error is logged.
impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        match &self {
            OAuthError::Internal(report) => tracing::error!(error = ?report, "OAuth request failed"),
            OAuthError::MisconfiguredClient(reason) => {
                tracing::error!(%reason, "OAuth client misconfigured")
            }
            other => tracing::warn!(code = other.code(), error = %other, "OAuth request failed"),
        }

        (
            self.status(),
            Json(ErrorBody::new(self.code(), self.description())),
        )
            .into_response()
    }
}

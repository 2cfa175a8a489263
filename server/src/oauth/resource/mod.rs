use reqwest::{Method, StatusCode};

use super::{
    dpop::{DpopRequest, DpopResponse, NonceTarget, RequestBody},
    error::OAuthError,
    session::OAuthSession,
    OAuthClient,
};

impl OAuthClient {
    /// Call a resource server (usually the account's PDS) on behalf of `did`.
    ///
    /// The session is refreshed up front when close to expiry, and once more if
    /// the resource server still reports the access token as invalid.
    #[tracing::instrument(skip(self, body), err)]
    pub async fn authorized_request(
        &self,
        did: &str,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<DpopResponse, OAuthError> {
        let session = self.get_valid_session(did).await?;
        let response = self.send_resource(&session, &method, url, body).await?;

        let token_rejected = response.status == StatusCode::UNAUTHORIZED
            && response.www_authenticate_error() == Some("invalid_token");
        if !token_rejected {
            return Ok(response);
        }

        tracing::info!(%did, "Access token rejected by resource server, refreshing");
        let refreshed = self.refresh_session(did, &session.access_token).await?;
        self.send_resource(&refreshed, &method, url, body).await
    }

    async fn send_resource(
        &self,
        session: &OAuthSession,
        method: &Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<DpopResponse, OAuthError> {
        let result = self
            .dpop
            .send(
                &session.dpop_key.handle,
                NonceTarget::Resource,
                DpopRequest {
                    method: method.clone(),
                    url,
                    access_token: Some(&session.access_token),
                    body: body.map_or(RequestBody::Empty, RequestBody::Json),
                },
                self.token_timeout(),
            )
            .await
            .map_err(|e| e.into_oauth_error(OAuthError::PdsUnreachable));

        if let Err(OAuthError::SessionExpired) = result {
            self.destroy_session(session).await?;
        }
        result
    }
}

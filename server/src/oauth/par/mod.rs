use reqwest::{Method, Url};
use serde::Deserialize;
use tracing::info;

use super::{
    dpop::{DpopRequest, NonceTarget, RequestBody},
    error::OAuthError,
    metadata::ClientMetadata,
    resolver::normalize_handle,
    session::PendingAuthorizationRequest,
    token::{rejection, ClientAuth},
    utils::{now_unix, random_token, Pkce},
    OAuthClient,
};

/// Where to send the browser, plus the state that will come back
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct ParResponse {
    request_uri: String,
}

/// Keep only same-site relative paths
pub fn sanitize_return_url(return_url: Option<&str>) -> String {
    match return_url.map(str::trim) {
        Some(url)
            if url.starts_with('/')
                && !url.starts_with("//")
                && !url.contains('\\')
                && !url.chars().any(char::is_control) =>
        {
            url.to_string()
        }
        _ => "/".to_string(),
    }
}

/// `authorization_endpoint?client_id=...&request_uri=...`
pub fn authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    request_uri: &str,
) -> Result<String, OAuthError> {
    let mut url = Url::parse(authorization_endpoint).map_err(|_| {
        OAuthError::PdsUnreachable("authorization endpoint is not a valid URL".to_string())
    })?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("request_uri", request_uri);
    Ok(url.to_string())
}

impl OAuthClient {
    /// Resolve `input`, push the authorization request and remember it under a
    /// fresh `state`.
    #[tracing::instrument(skip(self, client), fields(client_id = %client.client_id), err)]
    pub async fn start_authorization(
        &self,
        input: &str,
        return_url: Option<&str>,
        client: &ClientMetadata,
    ) -> Result<AuthorizationRedirect, OAuthError> {
        let client_auth = ClientAuth {
            client_id: client.client_id.clone(),
            confidential: client.is_confidential(),
        };
        let signing_key = self.config.signing_key.as_ref();
        client_auth.ensure_usable(signing_key)?;

        let identity = self.resolver.resolve(input).await?;
        let auth_server = &identity.auth_server;
        let par_endpoint = auth_server.par_endpoint().ok_or_else(|| {
            OAuthError::PdsUnreachable(
                "authorization server does not support pushed authorization requests".to_string(),
            )
        })?;

        let pkce = Pkce::generate();
        let state = random_token(32);
        let dpop_key = self.keys().create_key_pair().await?;

        let params = vec![
            ("response_type".to_string(), "code".to_string()),
            ("redirect_uri".to_string(), client.redirect_uri().to_string()),
            ("scope".to_string(), client.scope.clone()),
            ("state".to_string(), state.clone()),
            ("code_challenge".to_string(), pkce.challenge.clone()),
            ("code_challenge_method".to_string(), "S256".to_string()),
            ("dpop_jkt".to_string(), dpop_key.jkt.clone()),
            ("login_hint".to_string(), normalize_handle(input)),
        ];

        let issuer = auth_server.issuer.clone();
        let form_auth = client_auth.clone();
        let form = move || -> color_eyre::Result<Vec<(String, String)>> {
            let mut form = form_auth.form_params(signing_key, &issuer, now_unix())?;
            form.extend(params.iter().cloned());
            Ok(form)
        };

        let response = self
            .dpop
            .send(
                &dpop_key.handle,
                NonceTarget::AuthServer,
                DpopRequest {
                    method: Method::POST,
                    url: par_endpoint,
                    access_token: None,
                    body: RequestBody::Form(&form),
                },
                self.token_timeout(),
            )
            .await
            .map_err(|e| e.into_oauth_error(OAuthError::PdsUnreachable));

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.discard_key(&dpop_key.handle).await;
                return Err(err);
            }
        };

        if !response.status.is_success() {
            self.discard_key(&dpop_key.handle).await;
            if response.is_use_dpop_nonce(NonceTarget::AuthServer) {
                return Err(OAuthError::AuthServerRejected {
                    error: "use_dpop_nonce".to_string(),
                    description: Some("DPoP nonce challenge repeated".to_string()),
                });
            }
            return Err(rejection(&response, OAuthError::PdsUnreachable));
        }

        let par: ParResponse = response.json().map_err(|_| OAuthError::AuthServerRejected {
            error: "invalid_response".to_string(),
            description: Some("Malformed pushed authorization response".to_string()),
        })?;

        let pending = PendingAuthorizationRequest {
            state: state.clone(),
            code_verifier: pkce.verifier,
            did: identity.did.clone(),
            handle: identity.handle.clone(),
            pds_url: identity.pds_url.clone(),
            auth_server: identity.auth_server.clone(),
            client: client_auth,
            redirect_uri: client.redirect_uri().to_string(),
            dpop_key,
            return_url: sanitize_return_url(return_url),
            issued_at: now_unix(),
        };
        self.pending.put(&pending).await?;

        let url = authorization_url(
            &identity.auth_server.authorization_endpoint,
            &client.client_id,
            &par.request_uri,
        )?;
        info!(did = %identity.did, issuer = %identity.auth_server.issuer, "Pushed authorization request");

        Ok(AuthorizationRedirect { url, state })
    }

    pub(crate) async fn discard_key(&self, handle: &str) {
        if let Err(err) = self.keys().discard(handle).await {
            tracing::warn!(error = %err, "Failed to discard DPoP key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_urls_must_be_same_site_paths() {
        assert_eq!(sanitize_return_url(None), "/");
        assert_eq!(sanitize_return_url(Some("/dashboard?tab=1")), "/dashboard?tab=1");
        assert_eq!(sanitize_return_url(Some("//evil.example/path")), "/");
        assert_eq!(sanitize_return_url(Some("https://evil.example")), "/");
        assert_eq!(sanitize_return_url(Some("/\\evil.example")), "/");
        assert_eq!(sanitize_return_url(Some("dashboard")), "/");
        assert_eq!(sanitize_return_url(Some("/a\r\nb")), "/");
    }

    #[test]
    fn authorization_url_carries_only_client_id_and_request_uri() {
        let url = authorization_url(
            "https://bsky.social/oauth/authorize",
            "https://trainers.gg/oauth/client-metadata",
            "urn:ietf:params:oauth:request_uri:req-123",
        )
        .unwrap();
        let parsed = Url::parse(&url).unwrap();

        assert_eq!(parsed.host_str(), Some("bsky.social"));
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                (
                    "client_id".to_string(),
                    "https://trainers.gg/oauth/client-metadata".to_string()
                ),
                (
                    "request_uri".to_string(),
                    "urn:ietf:params:oauth:request_uri:req-123".to_string()
                ),
            ]
        );
    }
}

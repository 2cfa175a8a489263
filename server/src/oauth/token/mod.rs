use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    dpop::{DpopClient, DpopRequest, DpopResponse, NonceTarget, RequestBody},
    error::OAuthError,
    jwk::ClientSigningKey,
    utils::sign_es256_jwt,
};

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a client assertion
const CLIENT_ASSERTION_TTL_SECS: i64 = 60;

/// JWT payload for `private_key_jwt` client authentication
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientAssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Serialize)]
struct ClientAssertionHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

/// Sign a one-off client assertion for `audience` (the issuer)
pub fn client_assertion(
    key: &ClientSigningKey,
    client_id: &str,
    audience: &str,
    now: i64,
) -> color_eyre::Result<String> {
    let header = ClientAssertionHeader {
        alg: "ES256",
        typ: "JWT",
        kid: key.kid(),
    };
    let claims = ClientAssertionClaims {
        iss: client_id.to_string(),
        sub: client_id.to_string(),
        aud: audience.to_string(),
        jti: Uuid::new_v4().to_string(),
        iat: now,
        exp: now + CLIENT_ASSERTION_TTL_SECS,
    };

    sign_es256_jwt(key.signing_key(), &header, &claims)
}

/// How this client authenticates to the token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAuth {
    pub client_id: String,
    /// Confidential clients sign an assertion; public clients send only their id
    pub confidential: bool,
}

impl ClientAuth {
    /// Form members authenticating the client to `issuer`, freshly signed
    pub fn form_params(
        &self,
        signing_key: Option<&ClientSigningKey>,
        issuer: &str,
        now: i64,
    ) -> color_eyre::Result<Vec<(String, String)>> {
        let mut params = vec![("client_id".to_string(), self.client_id.clone())];
        if self.confidential {
            let key = signing_key.ok_or_else(|| {
                color_eyre::eyre::eyre!("Confidential client has no signing key")
            })?;
            params.push((
                "client_assertion_type".to_string(),
                CLIENT_ASSERTION_TYPE.to_string(),
            ));
            params.push((
                "client_assertion".to_string(),
                client_assertion(key, &self.client_id, issuer, now)?,
            ));
        }
        Ok(params)
    }

    /// Confidential clients cannot proceed without their key
    pub fn ensure_usable(&self, signing_key: Option<&ClientSigningKey>) -> Result<(), OAuthError> {
        if self.confidential && signing_key.is_none() {
            return Err(OAuthError::MisconfiguredClient(
                "ATPROTO_PRIVATE_KEY is not configured".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
}

impl TokenResponse {
    /// Check the response is DPoP-bound, for `expected_sub` and carries the atproto scope
    pub fn verify(&self, expected_sub: &str) -> Result<(), OAuthError> {
        if !self.token_type.eq_ignore_ascii_case("DPoP") {
            return Err(OAuthError::TokenExchange(format!(
                "unexpected token type {}",
                self.token_type
            )));
        }
        if self.sub.as_deref() != Some(expected_sub) {
            return Err(OAuthError::TokenExchange(
                "token subject does not match the account".to_string(),
            ));
        }
        let has_atproto_scope = self
            .scope
            .as_deref()
            .is_some_and(|scope| scope.split_whitespace().any(|s| s == "atproto"));
        if !has_atproto_scope {
            return Err(OAuthError::TokenExchange(
                "token is missing the atproto scope".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute expiry; tokens without `expires_in` are treated as 1 hour
    pub fn expires_at(&self, now: i64) -> i64 {
        now + self.expires_in.unwrap_or(3600)
    }
}

/// Turn an error response from the authorization server into the flow taxonomy.
///
/// A nonce challenge still standing after the single retry is fatal.
pub fn rejection(response: &DpopResponse, wrap: fn(String) -> OAuthError) -> OAuthError {
    if response.is_use_dpop_nonce(NonceTarget::AuthServer) {
        return wrap("DPoP nonce challenge repeated".to_string());
    }
    match response.oauth_error() {
        Some(body) => OAuthError::AuthServerRejected {
            error: body.error,
            description: body.error_description,
        },
        None => wrap(format!(
            "authorization server returned HTTP {}",
            response.status.as_u16()
        )),
    }
}

/// POST a grant to the token endpoint with DPoP, retrying once on a nonce challenge
#[tracing::instrument(skip(dpop, key_handle, form), err)]
pub async fn request_token(
    dpop: &DpopClient,
    key_handle: &str,
    token_endpoint: &str,
    form: &(dyn Fn() -> color_eyre::Result<Vec<(String, String)>> + Send + Sync),
    timeout: Duration,
) -> Result<TokenResponse, OAuthError> {
    let response = dpop
        .send(
            key_handle,
            NonceTarget::AuthServer,
            DpopRequest {
                method: Method::POST,
                url: token_endpoint,
                access_token: None,
                body: RequestBody::Form(form),
            },
            timeout,
        )
        .await
        .map_err(|e| e.into_oauth_error(OAuthError::TokenExchange))?;

    if !response.status.is_success() {
        return Err(rejection(&response, OAuthError::TokenExchange));
    }

    response.json().map_err(|e| {
        tracing::error!(error = %e, "Malformed token response");
        OAuthError::TokenExchange("malformed token response".to_string())
    })
}

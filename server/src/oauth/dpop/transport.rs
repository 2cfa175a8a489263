use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use reqwest::{header::HeaderMap, Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};

use super::{KeyManager, ProofRequest};
use crate::oauth::error::TransportError;

pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";

/// Who issued a nonce challenge; the two signal it differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTarget {
    AuthServer,
    Resource,
}

pub enum RequestBody<'a> {
    Empty,
    Json(&'a serde_json::Value),
    /// Rebuilt for every attempt so single-use members (client assertions) stay fresh
    Form(&'a (dyn Fn() -> color_eyre::Result<Vec<(String, String)>> + Send + Sync)),
}

pub struct DpopRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub access_token: Option<&'a str>,
    pub body: RequestBody<'a>,
}

#[derive(Debug, Clone)]
pub struct DpopResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// OAuth error body (RFC 6749 section 5.2)
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorBody {
    pub error: String,
    pub error_description: Option<String>,
}

impl DpopResponse {
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }

    pub fn oauth_error(&self) -> Option<OAuthErrorBody> {
        if self.status.is_success() {
            return None;
        }
        self.json().ok()
    }

    pub fn nonce(&self) -> Option<&str> {
        self.headers
            .get(DPOP_NONCE_HEADER)
            .and_then(|value| value.to_str().ok())
    }

    /// `error` from a `WWW-Authenticate: DPoP ...` challenge
    pub fn www_authenticate_error(&self) -> Option<&str> {
        let challenge = self
            .headers
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())?;
        if !challenge.starts_with("DPoP") {
            return None;
        }
        let (_, rest) = challenge.split_once("error=\"")?;
        rest.split('"').next()
    }

    pub fn is_use_dpop_nonce(&self, target: NonceTarget) -> bool {
        match target {
            NonceTarget::AuthServer => {
                self.status == StatusCode::BAD_REQUEST
                    && self
                        .oauth_error()
                        .is_some_and(|body| body.error == "use_dpop_nonce")
            }
            NonceTarget::Resource => {
                self.status == StatusCode::UNAUTHORIZED
                    && self.www_authenticate_error() == Some("use_dpop_nonce")
            }
        }
    }
}

/// Sends DPoP-bound requests and remembers the last nonce seen per origin
pub struct DpopClient {
    http: reqwest::Client,
    keys: Arc<dyn KeyManager>,
    nonces: DashMap<String, String>,
}

fn origin_of(url: &str) -> String {
    Url::parse(url)
        .map(|url| url.origin().ascii_serialization())
        .unwrap_or_else(|_| url.to_string())
}

impl DpopClient {
    pub fn new(http: reqwest::Client, keys: Arc<dyn KeyManager>) -> Self {
        Self {
            http,
            keys,
            nonces: DashMap::new(),
        }
    }

    pub fn keys(&self) -> &Arc<dyn KeyManager> {
        &self.keys
    }

    /// Send `request` with a DPoP proof from `key_handle`.
    ///
    /// A `use_dpop_nonce` challenge carrying a new nonce is retried exactly once
    /// with a fresh proof. Whatever the retry returns, including a second
    /// challenge, is handed back to the caller.
    pub async fn send(
        &self,
        key_handle: &str,
        target: NonceTarget,
        request: DpopRequest<'_>,
        timeout: Duration,
    ) -> Result<DpopResponse, TransportError> {
        let origin = origin_of(request.url);
        let sent_nonce = self.nonces.get(&origin).map(|nonce| nonce.value().clone());

        let response = self
            .attempt(key_handle, &request, sent_nonce.as_deref(), timeout)
            .await?;
        let fresh_nonce = response.nonce().map(str::to_string);
        if let Some(nonce) = &fresh_nonce {
            self.nonces.insert(origin.clone(), nonce.clone());
        }

        if !response.is_use_dpop_nonce(target) {
            return Ok(response);
        }
        let Some(nonce) = fresh_nonce.filter(|nonce| Some(nonce) != sent_nonce.as_ref()) else {
            return Ok(response);
        };

        tracing::debug!(%origin, "Retrying with server-issued DPoP nonce");
        let retried = self
            .attempt(key_handle, &request, Some(&nonce), timeout)
            .await?;
        if let Some(nonce) = retried.nonce() {
            self.nonces.insert(origin, nonce.to_string());
        }

        Ok(retried)
    }

    async fn attempt(
        &self,
        key_handle: &str,
        request: &DpopRequest<'_>,
        nonce: Option<&str>,
        timeout: Duration,
    ) -> Result<DpopResponse, TransportError> {
        let proof = self
            .keys
            .sign_proof(
                key_handle,
                ProofRequest {
                    htm: request.method.as_str(),
                    htu: request.url,
                    nonce,
                    access_token: request.access_token,
                },
            )
            .await?;

        let mut builder = self
            .http
            .request(request.method.clone(), request.url)
            .timeout(timeout)
            .header("DPoP", proof);
        if let Some(token) = request.access_token {
            builder = builder.header(reqwest::header::AUTHORIZATION, format!("DPoP {token}"));
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(build) => builder.form(&build().map_err(TransportError::Prepare)?),
        };

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(TransportError::from_reqwest)?;

        Ok(DpopResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{oauth::dpop::P256KeyManager, storage::MemoryStore};
    use axum::{
        http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::post,
        Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Token endpoint that demands a nonce on every request it sees without one
    async fn spawn_nonce_server(always_challenge: bool) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/oauth/token",
            post(move |headers: AxumHeaders| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let proof = headers
                        .get("DPoP")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let payload = proof.split('.').nth(1).unwrap_or_default();
                    let claims: serde_json::Value = serde_json::from_slice(
                        &base64::Engine::decode(
                            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                            payload,
                        )
                        .unwrap_or_default(),
                    )
                    .unwrap_or_default();

                    let nonce = format!("nonce-{n}");
                    if always_challenge || claims.get("nonce").is_none() {
                        return (
                            AxumStatus::BAD_REQUEST,
                            [("DPoP-Nonce", nonce)],
                            axum::Json(serde_json::json!({ "error": "use_dpop_nonce" })),
                        )
                            .into_response();
                    }
                    (
                        AxumStatus::OK,
                        [("DPoP-Nonce", nonce)],
                        axum::Json(serde_json::json!({ "ok": true })),
                    )
                        .into_response()
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (format!("http://{addr}/oauth/token"), calls)
    }

    fn client() -> DpopClient {
        let keys = P256KeyManager::new(Arc::new(MemoryStore::default()), Duration::from_secs(60));
        DpopClient::new(reqwest::Client::new(), Arc::new(keys))
    }

    fn form() -> color_eyre::Result<Vec<(String, String)>> {
        Ok(vec![("grant_type".to_string(), "authorization_code".to_string())])
    }

    #[tokio::test]
    async fn nonce_challenge_is_retried_once() {
        let (url, calls) = spawn_nonce_server(false).await;
        let client = client();
        let key = client.keys().create_key_pair().await.unwrap();

        let response = client
            .send(
                &key.handle,
                NonceTarget::AuthServer,
                DpopRequest {
                    method: Method::POST,
                    url: &url,
                    access_token: None,
                    body: RequestBody::Form(&form),
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The cached nonce is used up front next time.
        client
            .send(
                &key.handle,
                NonceTarget::AuthServer,
                DpopRequest {
                    method: Method::POST,
                    url: &url,
                    access_token: None,
                    body: RequestBody::Form(&form),
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn second_challenge_is_returned_not_retried() {
        let (url, calls) = spawn_nonce_server(true).await;
        let client = client();
        let key = client.keys().create_key_pair().await.unwrap();

        let response = client
            .send(
                &key.handle,
                NonceTarget::AuthServer,
                DpopRequest {
                    method: Method::POST,
                    url: &url,
                    access_token: None,
                    body: RequestBody::Form(&form),
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert!(response.is_use_dpop_nonce(NonceTarget::AuthServer));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn resource_challenges_come_from_www_authenticate() {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::WWW_AUTHENTICATE,
            r#"DPoP error="use_dpop_nonce", error_description="Resource server requires nonce""#
                .parse()
                .unwrap(),
        );
        let response = DpopResponse {
            status: StatusCode::UNAUTHORIZED,
            headers,
            body: String::new(),
        };

        assert!(response.is_use_dpop_nonce(NonceTarget::Resource));
        assert!(!response.is_use_dpop_nonce(NonceTarget::AuthServer));
    }
}

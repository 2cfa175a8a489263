//! Handle -> DID -> DID document -> PDS -> authorization server
//!
//! All lookups are plain unauthenticated GETs with a timeout; nothing here
//! mutates local state.

use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{error, info};

use super::error::OAuthError;

/// DID document, reduced to the members the OAuth flow reads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub service_endpoint: String,
}

impl DidDocument {
    /// The `#atproto_pds` service endpoint, if it is a usable http(s) URL
    pub fn pds_endpoint(&self) -> Option<String> {
        self.service
            .iter()
            .find(|service| {
                service.id == "#atproto_pds"
                    || service.id == format!("{}#atproto_pds", self.id)
            })
            .filter(|service| service.type_ == "AtprotoPersonalDataServer")
            .and_then(|service| Url::parse(&service.service_endpoint).ok())
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .map(|url| url.as_str().trim_end_matches('/').to_string())
    }

    /// First `at://` alias, which is the account's claimed handle
    pub fn handle(&self) -> Option<String> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub authorization_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub pushed_authorization_request_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Vec<String>,
}

impl AuthServerMetadata {
    pub fn par_endpoint(&self) -> Option<&str> {
        self.pushed_authorization_request_endpoint.as_deref()
    }

    /// Why this server cannot take our authorization requests, if it cannot
    pub fn unsupported_reason(&self) -> Option<&'static str> {
        if self.par_endpoint().is_none() {
            return Some("authorization server does not support pushed authorization requests");
        }
        if !self.dpop_signing_alg_values_supported.iter().any(|alg| alg == "ES256") {
            return Some("authorization server does not accept ES256 DPoP proofs");
        }
        if !self.scopes_supported.is_empty() && !self.scopes_supported.iter().any(|s| s == "atproto") {
            return Some("authorization server does not offer the atproto scope");
        }
        None
    }
}

/// Everything login needs to know about an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub did: String,
    pub handle: Option<String>,
    pub pds_url: String,
    pub auth_server: AuthServerMetadata,
}

/// Strip whitespace and a leading `@`
pub fn normalize_handle(input: &str) -> String {
    let trimmed = input.trim();
    trimmed.strip_prefix('@').unwrap_or(trimmed).trim().to_string()
}

/// Compare issuer URLs, ignoring default ports and a bare trailing slash
pub fn issuer_equivalent(a: &str, b: &str) -> bool {
    fn normalize(url: &Url) -> Option<(String, String, u16, String)> {
        if url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        let path = match url.path() {
            "" | "/" => "/".to_string(),
            other => other.trim_end_matches('/').to_string(),
        };
        Some((
            url.scheme().to_string(),
            url.host_str()?.to_ascii_lowercase(),
            url.port_or_known_default()?,
            path,
        ))
    }

    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => match (normalize(&a), normalize(&b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        _ => a == b,
    }
}

pub struct IdentityResolver {
    http: reqwest::Client,
    handle_resolver_url: String,
    plc_directory_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ResolveHandleOutput {
    did: String,
}

enum FetchError {
    NotFound,
    Failed(String),
}

impl IdentityResolver {
    pub fn new(
        http: reqwest::Client,
        handle_resolver_url: impl Into<String>,
        plc_directory_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            handle_resolver_url: handle_resolver_url.into().trim_end_matches('/').to_string(),
            plc_directory_url: plc_directory_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                error!(%url, error = %e, "Resolution request failed");
                if e.is_timeout() {
                    FetchError::Failed("request timed out".to_string())
                } else {
                    FetchError::Failed("request failed".to_string())
                }
            })?;

        let status = response.status();
        // resolveHandle answers unknown handles with 400 InvalidRequest
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Err(FetchError::NotFound);
        }
        if !status.is_success() {
            error!(%url, %status, "Resolution request returned an error status");
            return Err(FetchError::Failed(format!("HTTP {}", status.as_u16())));
        }

        response.json::<T>().await.map_err(|e| {
            error!(%url, error = %e, "Failed to decode resolution response");
            FetchError::Failed("malformed response".to_string())
        })
    }

    /// Resolve a handle to its DID via `com.atproto.identity.resolveHandle`
    #[tracing::instrument(skip(self), err)]
    pub async fn resolve_handle(&self, handle: &str) -> Result<String, OAuthError> {
        let url = format!(
            "{}/xrpc/com.atproto.identity.resolveHandle",
            self.handle_resolver_url
        );

        let output: ResolveHandleOutput = self
            .fetch_json(&url, &[("handle", handle)])
            .await
            .map_err(|e| match e {
                FetchError::NotFound => OAuthError::HandleNotFound(handle.to_string()),
                FetchError::Failed(reason) => {
                    OAuthError::PdsUnreachable(format!("handle resolution failed ({reason})"))
                }
            })?;

        if !output.did.starts_with("did:") {
            return Err(OAuthError::HandleNotFound(handle.to_string()));
        }
        Ok(output.did)
    }

    /// Fetch the DID document for a `did:plc` or `did:web` identifier
    #[tracing::instrument(skip(self), err)]
    pub async fn resolve_did_document(&self, did: &str) -> Result<DidDocument, OAuthError> {
        let url = if did.starts_with("did:plc:") {
            format!("{}/{}", self.plc_directory_url, did)
        } else if let Some(host) = did.strip_prefix("did:web:") {
            // Only host-level did:web is used for atproto accounts; `%3A` encodes a port.
            format!("https://{}/.well-known/did.json", host.replace("%3A", ":"))
        } else {
            return Err(OAuthError::HandleNotFound(did.to_string()));
        };

        info!(%did, %url, "Resolving DID document");
        let document: DidDocument = self.fetch_json(&url, &[]).await.map_err(|e| match e {
            FetchError::NotFound => OAuthError::HandleNotFound(did.to_string()),
            FetchError::Failed(reason) => {
                OAuthError::PdsUnreachable(format!("DID document unavailable ({reason})"))
            }
        })?;

        if document.id != did {
            error!(%did, document_id = %document.id, "DID document id mismatch");
            return Err(OAuthError::PdsUnreachable(
                "DID document does not match the DID".to_string(),
            ));
        }
        Ok(document)
    }

    /// Fetch and validate authorization server metadata for `issuer`
    #[tracing::instrument(skip(self), err)]
    pub async fn auth_server_metadata(&self, issuer: &str) -> Result<AuthServerMetadata, OAuthError> {
        let url = format!(
            "{}/.well-known/oauth-authorization-server",
            issuer.trim_end_matches('/')
        );
        let metadata: AuthServerMetadata = self.fetch_json(&url, &[]).await.map_err(|e| {
            OAuthError::PdsUnreachable(match e {
                FetchError::NotFound => "authorization server metadata not found".to_string(),
                FetchError::Failed(reason) => {
                    format!("authorization server metadata unavailable ({reason})")
                }
            })
        })?;

        if !issuer_equivalent(&metadata.issuer, issuer) {
            error!(expected = %issuer, actual = %metadata.issuer, "Issuer mismatch");
            return Err(OAuthError::PdsUnreachable(
                "authorization server issuer mismatch".to_string(),
            ));
        }
        if let Some(reason) = metadata.unsupported_reason() {
            error!(%issuer, reason, "Unusable authorization server");
            return Err(OAuthError::PdsUnreachable(reason.to_string()));
        }

        Ok(metadata)
    }

    /// Find the authorization server protecting a PDS
    #[tracing::instrument(skip(self), err)]
    pub async fn auth_server_for_pds(&self, pds_url: &str) -> Result<AuthServerMetadata, OAuthError> {
        let url = format!("{pds_url}/.well-known/oauth-protected-resource");
        let resource: ProtectedResourceMetadata =
            self.fetch_json(&url, &[]).await.map_err(|e| {
                OAuthError::PdsUnreachable(match e {
                    FetchError::NotFound => "PDS does not support OAuth".to_string(),
                    FetchError::Failed(reason) => format!("PDS metadata unavailable ({reason})"),
                })
            })?;

        let [issuer] = resource.authorization_servers.as_slice() else {
            return Err(OAuthError::PdsUnreachable(
                "PDS must name exactly one authorization server".to_string(),
            ));
        };

        self.auth_server_metadata(issuer).await
    }

    /// Resolve a handle (optionally `@`-prefixed) or DID all the way to its
    /// authorization server
    #[tracing::instrument(skip(self), err)]
    pub async fn resolve(&self, input: &str) -> Result<ResolvedIdentity, OAuthError> {
        let input = normalize_handle(input);
        if input.is_empty() {
            return Err(OAuthError::HandleNotFound(input));
        }

        let (did, typed_handle) = if input.starts_with("did:") {
            (input.clone(), None)
        } else {
            (self.resolve_handle(&input).await?, Some(input.clone()))
        };

        let document = self.resolve_did_document(&did).await?;
        let pds_url = document.pds_endpoint().ok_or_else(|| {
            OAuthError::PdsUnreachable("DID document has no PDS service endpoint".to_string())
        })?;
        let auth_server = self.auth_server_for_pds(&pds_url).await?;

        info!(%did, %pds_url, issuer = %auth_server.issuer, "Resolved identity");
        Ok(ResolvedIdentity {
            did,
            handle: typed_handle.or_else(|| document.handle()),
            pds_url,
            auth_server,
        })
    }
}

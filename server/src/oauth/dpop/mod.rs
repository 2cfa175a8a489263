//! DPoP (RFC 9449) keys and proofs
//!
//! Every OAuth session gets its own P-256 key. The private half never leaves the
//! [`KeyManager`]; callers only ever hold an opaque handle and receive signed
//! proofs for individual requests.

use std::time::Duration;

use base64::Engine as _;
use p256::ecdsa::SigningKey;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    error::DpopError,
    jwk::Jwk,
    utils::{base64_url_encode, now_unix, sha256_b64, sign_es256_jwt},
};
use crate::storage::{get_json, put_json, DynStore};

mod transport;

pub use transport::{DpopClient, DpopRequest, DpopResponse, NonceTarget, RequestBody};

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";

/// Public description of a freshly created key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpopKeyPair {
    /// Opaque reference used to ask the key manager for proofs
    pub handle: String,
    pub public_jwk: Jwk,
    /// RFC 7638 thumbprint of `public_jwk`
    pub jkt: String,
}

/// What a single proof is bound to
#[derive(Debug, Clone, Copy)]
pub struct ProofRequest<'a> {
    pub htm: &'a str,
    pub htu: &'a str,
    pub nonce: Option<&'a str>,
    /// Access token to bind via `ath`, for resource requests
    pub access_token: Option<&'a str>,
}

#[async_trait::async_trait]
pub trait KeyManager: Send + Sync {
    async fn create_key_pair(&self) -> Result<DpopKeyPair, DpopError>;

    async fn sign_proof(&self, handle: &str, request: ProofRequest<'_>) -> Result<String, DpopError>;

    /// Keep a key for the life of a session instead of the authorization attempt
    async fn retain(&self, handle: &str) -> Result<(), DpopError>;

    async fn discard(&self, handle: &str) -> Result<(), DpopError>;
}

#[derive(Serialize)]
struct DpopHeader<'a> {
    typ: &'static str,
    alg: &'static str,
    jwk: &'a Jwk,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DpopClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

/// `htu` is the target URI without query and fragment
pub fn normalize_htu(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    }
}

/// Build a compact ES256 DPoP proof with the public key embedded in the header.
///
/// Each call gets a fresh `jti`, so two proofs are never identical even for the
/// same method, URL and nonce.
pub fn build_dpop_proof(
    key: &SigningKey,
    request: ProofRequest<'_>,
    iat: i64,
) -> color_eyre::Result<String> {
    let jwk = Jwk::from_verifying_key(key.verifying_key());
    let header = DpopHeader {
        typ: JWT_HEADER_TYP_DPOP,
        alg: "ES256",
        jwk: &jwk,
    };
    let claims = DpopClaims {
        jti: Uuid::new_v4().to_string(),
        htm: request.htm.to_ascii_uppercase(),
        htu: normalize_htu(request.htu),
        iat,
        nonce: request.nonce.map(str::to_string),
        ath: request.access_token.map(|token| sha256_b64(token.as_bytes())),
    };

    sign_es256_jwt(key, &header, &claims)
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    /// base64url of the secret scalar
    d: String,
}

/// Key manager backed by the key-value store.
///
/// Keys are written with a provisional TTL when created, so keys of abandoned
/// authorization attempts age out, and made permanent by [`KeyManager::retain`].
pub struct P256KeyManager {
    store: DynStore,
    provisional_ttl: Duration,
}

impl P256KeyManager {
    pub fn new(store: DynStore, provisional_ttl: Duration) -> Self {
        Self {
            store,
            provisional_ttl,
        }
    }

    fn storage_key(handle: &str) -> String {
        format!("dpop_key:{handle}")
    }

    async fn load(&self, handle: &str) -> Result<(StoredKey, SigningKey), DpopError> {
        let stored: StoredKey = get_json(self.store.as_ref(), &Self::storage_key(handle))
            .await
            .map_err(DpopError::Storage)?
            .ok_or_else(|| DpopError::KeyNotFound(handle.to_string()))?;

        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&stored.d)
            .map_err(|e| DpopError::InvalidKey(e.to_string()))?;
        let key = SigningKey::from_slice(&bytes).map_err(|e| DpopError::InvalidKey(e.to_string()))?;

        Ok((stored, key))
    }
}

#[async_trait::async_trait]
impl KeyManager for P256KeyManager {
    #[tracing::instrument(skip(self))]
    async fn create_key_pair(&self) -> Result<DpopKeyPair, DpopError> {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let handle = Uuid::new_v4().to_string();
        let stored = StoredKey {
            d: base64_url_encode(&key.to_bytes()),
        };

        put_json(
            self.store.as_ref(),
            &Self::storage_key(&handle),
            &stored,
            Some(self.provisional_ttl),
        )
        .await
        .map_err(DpopError::Storage)?;

        let public_jwk = Jwk::from_verifying_key(key.verifying_key());
        let jkt = public_jwk.thumbprint();
        tracing::debug!(%handle, %jkt, "Created DPoP key");

        Ok(DpopKeyPair {
            handle,
            public_jwk,
            jkt,
        })
    }

    async fn sign_proof(&self, handle: &str, request: ProofRequest<'_>) -> Result<String, DpopError> {
        let (_, key) = self.load(handle).await?;
        build_dpop_proof(&key, request, now_unix()).map_err(DpopError::Signing)
    }

    async fn retain(&self, handle: &str) -> Result<(), DpopError> {
        let (stored, _) = self.load(handle).await?;
        put_json(self.store.as_ref(), &Self::storage_key(handle), &stored, None)
            .await
            .map_err(DpopError::Storage)
    }

    async fn discard(&self, handle: &str) -> Result<(), DpopError> {
        self.store
            .delete(&Self::storage_key(handle))
            .await
            .map(|_| ())
            .map_err(DpopError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
    use std::sync::Arc;

    fn manager() -> P256KeyManager {
        P256KeyManager::new(Arc::new(MemoryStore::default()), Duration::from_secs(600))
    }

    fn verify(proof: &str) -> (jsonwebtoken::Header, DpopClaims) {
        let header = decode_header(proof).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.typ.as_deref(), Some(JWT_HEADER_TYP_DPOP));

        let jwk: Jwk = serde_json::from_value(
            serde_json::to_value(header.jwk.as_ref().expect("proof embeds its jwk")).unwrap(),
        )
        .unwrap();
        let key = DecodingKey::from_ec_components(&jwk.x, &jwk.y).unwrap();

        let mut validation = Validation::new(Algorithm::ES256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let claims = decode::<DpopClaims>(proof, &key, &validation).unwrap().claims;

        (header, claims)
    }

    #[tokio::test]
    async fn proofs_are_signed_by_the_session_key() {
        let keys = manager();
        let pair = keys.create_key_pair().await.unwrap();

        let proof = keys
            .sign_proof(
                &pair.handle,
                ProofRequest {
                    htm: "post",
                    htu: "https://auth.example.com/oauth/token?x=1#frag",
                    nonce: Some("server-nonce"),
                    access_token: None,
                },
            )
            .await
            .unwrap();

        let (header, claims) = verify(&proof);
        let embedded: Jwk =
            serde_json::from_value(serde_json::to_value(header.jwk.unwrap()).unwrap()).unwrap();
        assert_eq!(embedded.thumbprint(), pair.jkt);
        assert_eq!(claims.htm, "POST");
        assert_eq!(claims.htu, "https://auth.example.com/oauth/token");
        assert_eq!(claims.nonce.as_deref(), Some("server-nonce"));
        assert_eq!(claims.ath, None);
    }

    #[tokio::test]
    async fn proofs_differ_per_request_and_per_call() {
        let keys = manager();
        let pair = keys.create_key_pair().await.unwrap();
        let request = |htm, htu| ProofRequest {
            htm,
            htu,
            nonce: Some("n"),
            access_token: None,
        };

        let par = keys
            .sign_proof(&pair.handle, request("POST", "https://as.example/oauth/par"))
            .await
            .unwrap();
        let token = keys
            .sign_proof(&pair.handle, request("POST", "https://as.example/oauth/token"))
            .await
            .unwrap();
        let token_again = keys
            .sign_proof(&pair.handle, request("POST", "https://as.example/oauth/token"))
            .await
            .unwrap();

        assert_ne!(par, token);
        assert_ne!(token, token_again);

        let (_, first) = verify(&token);
        let (_, second) = verify(&token_again);
        assert_ne!(first.jti, second.jti);
        assert_eq!(first.htu, second.htu);
    }

    #[tokio::test]
    async fn resource_proofs_carry_access_token_hash() {
        let keys = manager();
        let pair = keys.create_key_pair().await.unwrap();

        let proof = keys
            .sign_proof(
                &pair.handle,
                ProofRequest {
                    htm: "GET",
                    htu: "https://pds.example/xrpc/app.bsky.actor.getProfile?actor=x",
                    nonce: None,
                    access_token: Some("access-token-123"),
                },
            )
            .await
            .unwrap();

        let (_, claims) = verify(&proof);
        assert_eq!(claims.ath, Some(sha256_b64(b"access-token-123")));
        assert_eq!(claims.nonce, None);
    }

    #[tokio::test]
    async fn separate_sessions_get_separate_keys() {
        let keys = manager();
        let a = keys.create_key_pair().await.unwrap();
        let b = keys.create_key_pair().await.unwrap();

        assert_ne!(a.handle, b.handle);
        assert_ne!(a.jkt, b.jkt);
    }

    #[tokio::test]
    async fn discarded_keys_cannot_sign() {
        let keys = manager();
        let pair = keys.create_key_pair().await.unwrap();
        keys.discard(&pair.handle).await.unwrap();

        let err = keys
            .sign_proof(
                &pair.handle,
                ProofRequest {
                    htm: "POST",
                    htu: "https://as.example/oauth/token",
                    nonce: None,
                    access_token: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn retained_keys_outlive_the_provisional_ttl() {
        let keys = P256KeyManager::new(
            Arc::new(MemoryStore::default()),
            Duration::from_millis(20),
        );
        let kept = keys.create_key_pair().await.unwrap();
        let dropped = keys.create_key_pair().await.unwrap();
        keys.retain(&kept.handle).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = ProofRequest {
            htm: "POST",
            htu: "https://as.example/oauth/token",
            nonce: None,
            access_token: None,
        };
        assert!(keys.sign_proof(&kept.handle, request).await.is_ok());
        assert!(matches!(
            keys.sign_proof(&dropped.handle, request).await,
            Err(DpopError::KeyNotFound(_))
        ));
    }

    #[test]
    fn htu_drops_query_and_fragment() {
        assert_eq!(
            normalize_htu("https://pds.example/xrpc/foo?bar=1#x"),
            "https://pds.example/xrpc/foo"
        );
    }
}

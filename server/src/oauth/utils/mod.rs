use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use color_eyre::eyre::WrapErr;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use rand::{thread_rng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Helper function to create URL-safe base64 encoding without padding
pub fn base64_url_encode(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// SHA-256 of `input`, base64url encoded without padding
pub fn sha256_b64(input: &[u8]) -> String {
    base64_url_encode(&Sha256::digest(input))
}

/// Random unguessable token of `len` bytes, base64url encoded
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    thread_rng().fill_bytes(&mut bytes);
    base64_url_encode(&bytes)
}

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    /// Generate a PKCE code verifier and challenge using the S256 method.
    ///
    /// 32 random bytes encode to a 43 character verifier, the minimum RFC 7636 allows.
    pub fn generate() -> Self {
        let verifier = random_token(32);
        let challenge = sha256_b64(verifier.as_bytes());
        Self {
            verifier,
            challenge,
        }
    }
}

/// Sign `header.claims` as a compact ES256 JWS.
///
/// p256 produces the fixed-width `r || s` signature JWS expects, so no DER
/// conversion is needed.
pub fn sign_es256_jwt<H: Serialize, C: Serialize>(
    key: &SigningKey,
    header: &H,
    claims: &C,
) -> color_eyre::Result<String> {
    let header_json = serde_json::to_vec(header).wrap_err("Failed to serialize JWT header")?;
    let claims_json = serde_json::to_vec(claims).wrap_err("Failed to serialize JWT claims")?;

    let message = format!(
        "{}.{}",
        base64_url_encode(&header_json),
        base64_url_encode(&claims_json)
    );
    let signature: Signature = key.sign(message.as_bytes());

    Ok(format!(
        "{}.{}",
        message,
        base64_url_encode(&signature.to_bytes())
    ))
}

/// Current unix time in seconds
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

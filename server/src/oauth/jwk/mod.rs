use std::fmt;

use base64::Engine as _;
use color_eyre::eyre::{eyre, WrapErr};
use p256::{
    ecdsa::{SigningKey, VerifyingKey},
    pkcs8::DecodePrivateKey as _,
    SecretKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::utils::base64_url_encode;

/// JSON Web Key for a P-256 public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
}

/// A set of public keys, as served from a `jwks_uri`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl Jwk {
    /// Bare public JWK (`kty`, `crv`, `x`, `y`) for a verifying key
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        // An uncompressed point always carries both coordinates.
        let x = point.x().map(|x| base64_url_encode(x)).unwrap_or_default();
        let y = point.y().map(|y| base64_url_encode(y)).unwrap_or_default();

        Self {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x,
            y,
            kid: None,
            alg: None,
            use_: None,
        }
    }

    /// Calculate the JWK thumbprint for this key
    ///
    /// This follows RFC 7638: the required members in lexicographic order,
    /// serialized without whitespace, hashed with SHA-256.
    pub fn thumbprint(&self) -> String {
        let canonical = format!(
            r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
            self.crv, self.kty, self.x, self.y
        );
        base64_url_encode(&Sha256::digest(canonical.as_bytes()))
    }
}

/// Generate a key ID from the key's coordinates
pub fn generate_key_id(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let mut hasher = Sha256::new();
    if let (Some(x), Some(y)) = (point.x(), point.y()) {
        hasher.update(x);
        hasher.update(y);
    }
    base64_url_encode(&hasher.finalize())
}

/// The confidential (web) client's ES256 signing key.
///
/// Used for `private_key_jwt` client assertions; its public half is published
/// through the JWKS endpoint.
#[derive(Clone)]
pub struct ClientSigningKey {
    signing_key: SigningKey,
    kid: String,
}

impl fmt::Debug for ClientSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSigningKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl ClientSigningKey {
    pub fn new(signing_key: SigningKey) -> Self {
        let kid = generate_key_id(signing_key.verifying_key());
        Self { signing_key, kid }
    }

    /// Parse a PEM encoded P-256 private key.
    ///
    /// Accepts SEC1 (`EC PRIVATE KEY`) and PKCS#8 (`PRIVATE KEY`) documents,
    /// either raw or wrapped in standard base64 as is common in env vars.
    pub fn from_pem(input: &str) -> color_eyre::Result<Self> {
        let input = input.trim();
        let pem = if input.starts_with("-----BEGIN") {
            input.to_string()
        } else {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(input)
                .wrap_err("Failed to decode base64-encoded private key")?;
            String::from_utf8(decoded).wrap_err("Decoded private key is not valid UTF-8")?
        };
        // Env files often carry escaped newlines.
        let pem = pem.replace("\\n", "\n");

        let secret = if pem.contains("BEGIN EC PRIVATE KEY") {
            SecretKey::from_sec1_pem(&pem).map_err(|e| eyre!("Invalid SEC1 private key: {e}"))?
        } else if pem.contains("BEGIN PRIVATE KEY") {
            SecretKey::from_pkcs8_pem(&pem).map_err(|e| eyre!("Invalid PKCS#8 private key: {e}"))?
        } else {
            return Err(eyre!(
                "Private key must be a PEM encoded P-256 key (EC PRIVATE KEY or PRIVATE KEY)"
            ));
        };

        Ok(Self::new(SigningKey::from(secret)))
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Public JWK advertised to authorization servers
    pub fn public_jwk(&self) -> Jwk {
        Jwk {
            kid: Some(self.kid.clone()),
            alg: Some("ES256".to_string()),
            use_: Some("sig".to_string()),
            ..Jwk::from_verifying_key(self.signing_key.verifying_key())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::pkcs8::{EncodePrivateKey as _, LineEnding};

    fn random_key() -> SigningKey {
        SigningKey::random(&mut rand::rngs::OsRng)
    }

    #[test]
    fn thumbprint_ignores_optional_members() {
        let key = ClientSigningKey::new(random_key());
        let bare = Jwk::from_verifying_key(key.signing_key().verifying_key());

        assert_eq!(bare.thumbprint(), key.public_jwk().thumbprint());
        assert_eq!(bare.thumbprint().len(), 43);
    }

    #[test]
    fn thumbprint_differs_between_keys() {
        let a = Jwk::from_verifying_key(random_key().verifying_key());
        let b = Jwk::from_verifying_key(random_key().verifying_key());
        assert_ne!(a.thumbprint(), b.thumbprint());
    }

    #[test]
    fn parses_pkcs8_pem_raw_and_base64_wrapped() {
        let key = random_key();
        let pem = SecretKey::from(&key)
            .to_pkcs8_pem(LineEnding::LF)
            .unwrap()
            .to_string();

        let raw = ClientSigningKey::from_pem(&pem).unwrap();
        let wrapped = ClientSigningKey::from_pem(
            &base64::engine::general_purpose::STANDARD.encode(pem.as_bytes()),
        )
        .unwrap();

        assert_eq!(raw.kid(), wrapped.kid());
        assert_eq!(raw.kid(), generate_key_id(key.verifying_key()));
    }

    #[test]
    fn parses_sec1_pem() {
        let key = random_key();
        let pem = SecretKey::from(&key).to_sec1_pem(LineEnding::LF).unwrap();

        let parsed = ClientSigningKey::from_pem(&pem).unwrap();
        assert_eq!(parsed.public_jwk().x, Jwk::from_verifying_key(key.verifying_key()).x);
    }

    #[test]
    fn rejects_non_pem_input() {
        assert!(ClientSigningKey::from_pem("not a key").is_err());
    }

    #[test]
    fn debug_output_hides_key_material() {
        let key = ClientSigningKey::new(random_key());
        let debug = format!("{key:?}");
        assert!(debug.contains(key.kid()));
        assert!(!debug.contains("signing_key"));
    }
}

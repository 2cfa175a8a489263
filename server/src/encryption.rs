//! age encryption of values stored at rest.
//!
//! Sealed values are base64 so they fit the text columns of every store.

use std::sync::Arc;

use age::x25519::Identity;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::eyre::{eyre, Result, WrapErr};

/// Seals and opens values with one X25519 identity, encrypting to its own recipient
#[derive(Clone)]
pub struct Sealer {
    identity: Arc<Identity>,
}

impl Sealer {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self { identity }
    }

    pub async fn seal(&self, plaintext: &str) -> Result<String> {
        let identity = self.identity.clone();
        let plaintext = plaintext.as_bytes().to_vec();

        // age work is CPU bound
        tokio::task::spawn_blocking(move || seal_with(&identity, &plaintext))
            .await
            .wrap_err("Encryption task failed")?
    }

    pub async fn open(&self, sealed: &str) -> Result<String> {
        let identity = self.identity.clone();
        let sealed = sealed.to_string();

        tokio::task::spawn_blocking(move || open_with(&identity, &sealed))
            .await
            .wrap_err("Decryption task failed")?
    }
}

fn seal_with(identity: &Identity, plaintext: &[u8]) -> Result<String> {
    let ciphertext = age::encrypt(&identity.to_public(), plaintext)
        .map_err(|e| eyre!("Failed to encrypt value: {}", e))?;
    Ok(STANDARD.encode(ciphertext))
}

fn open_with(identity: &Identity, sealed: &str) -> Result<String> {
    let ciphertext = STANDARD
        .decode(sealed)
        .wrap_err("Sealed value is not base64")?;
    let plaintext =
        age::decrypt(identity, &ciphertext).map_err(|e| eyre!("Failed to decrypt value: {}", e))?;
    String::from_utf8(plaintext).wrap_err("Decrypted value is not UTF-8")
}

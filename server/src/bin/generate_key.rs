use age::{secrecy::ExposeSecret as _, x25519::Identity};
use base64::Engine as _;
use color_eyre::eyre::{eyre, Result};
use p256::{ecdsa::SigningKey, pkcs8::EncodePrivateKey as _, pkcs8::LineEnding};
use rand::RngCore as _;

/// Print fresh values for every secret the server reads from the environment
fn main() -> Result<()> {
    color_eyre::install()?;

    let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
    let pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| eyre!("Failed to encode signing key: {}", e))?;
    let pem_b64 = base64::engine::general_purpose::STANDARD.encode(pem.as_bytes());

    let identity = Identity::generate();
    let age_key = identity.to_string();

    let mut cookie_key = [0u8; 64];
    rand::rngs::OsRng.fill_bytes(&mut cookie_key);
    let cookie_key = base64::engine::general_purpose::STANDARD.encode(cookie_key);

    println!("Add the following to your .env file:");
    println!();
    println!("ATPROTO_PRIVATE_KEY=\"{}\"", pem_b64);
    println!("ENCRYPTION_KEY=\"{}\"", age_key.expose_secret());
    println!("COOKIE_KEY=\"{}\"", cookie_key);

    Ok(())
}

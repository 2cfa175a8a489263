use std::{str::FromStr, sync::Arc, time::Duration};

use age::x25519::Identity;
use base64::Engine as _;
use color_eyre::eyre::{eyre, WrapErr};
use reqwest::Url;
use tower_cookies::Key;

use crate::oauth::jwk::ClientSigningKey;

pub const DEFAULT_HANDLE_RESOLVER_URL: &str = "https://public.api.bsky.app";
pub const DEFAULT_PLC_DIRECTORY_URL: &str = "https://plc.directory";

/// Application configuration, resolved once at startup
#[derive(Clone)]
pub struct AppConfig {
    /// Explicit public origin, e.g. `https://trainers.gg`, without a trailing slash
    pub site_url: Option<String>,
    pub signing_key: Option<ClientSigningKey>,
    pub handle_resolver_url: String,
    pub plc_directory_url: String,
    pub client_name: String,
    pub sign_in_path: String,
    pub link_account_path: String,
    pub pending_request_ttl: Duration,
    pub token_refresh_margin: Duration,
    pub resolve_timeout: Duration,
    pub token_timeout: Duration,
    pub cookie_key: Key,
    pub encryption_key: Option<Arc<Identity>>,
    pub database_url: Option<String>,
    pub development_mode: bool,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            site_url: None,
            signing_key: None,
            handle_resolver_url: DEFAULT_HANDLE_RESOLVER_URL.to_string(),
            plc_directory_url: DEFAULT_PLC_DIRECTORY_URL.to_string(),
            client_name: "trainers.gg".to_string(),
            sign_in_path: "/sign-in".to_string(),
            link_account_path: "/sign-up/link-bluesky".to_string(),
            pending_request_ttl: Duration::from_secs(600),
            token_refresh_margin: Duration::from_secs(60),
            resolve_timeout: Duration::from_millis(5000),
            token_timeout: Duration::from_millis(10000),
            cookie_key: Key::generate(),
            encryption_key: None,
            database_url: None,
            development_mode: false,
            port: 3000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from an arbitrary variable source.
    ///
    /// Malformed values are errors. Only the signing key may be absent, in which
    /// case login is refused at request time.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> color_eyre::Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let site_url = var("SITE_URL")
            .map(|raw| normalize_base_url(&raw).wrap_err("Invalid SITE_URL"))
            .transpose()?;

        let signing_key = var("ATPROTO_PRIVATE_KEY")
            .map(|raw| ClientSigningKey::from_pem(&raw).wrap_err("Invalid ATPROTO_PRIVATE_KEY"))
            .transpose()?;

        let handle_resolver_url = match var("HANDLE_RESOLVER_URL") {
            Some(raw) => normalize_base_url(&raw).wrap_err("Invalid HANDLE_RESOLVER_URL")?,
            None => defaults.handle_resolver_url,
        };
        let plc_directory_url = match var("PLC_DIRECTORY_URL") {
            Some(raw) => normalize_base_url(&raw).wrap_err("Invalid PLC_DIRECTORY_URL")?,
            None => defaults.plc_directory_url,
        };

        let sign_in_path = match var("SIGN_IN_PATH") {
            Some(path) => relative_path(&path).wrap_err("Invalid SIGN_IN_PATH")?,
            None => defaults.sign_in_path,
        };
        let link_account_path = match var("LINK_ACCOUNT_PATH") {
            Some(path) => relative_path(&path).wrap_err("Invalid LINK_ACCOUNT_PATH")?,
            None => defaults.link_account_path,
        };

        let cookie_key = match var("COOKIE_KEY") {
            Some(raw) => parse_cookie_key(&raw)?,
            None => {
                tracing::warn!("COOKIE_KEY not set, generating a key for this process");
                defaults.cookie_key
            }
        };

        let encryption_key = var("ENCRYPTION_KEY")
            .map(|raw| {
                Identity::from_str(raw.trim())
                    .map(Arc::new)
                    .map_err(|e| eyre!("Failed to parse ENCRYPTION_KEY: {}", e))
            })
            .transpose()?;

        Ok(Self {
            site_url,
            signing_key,
            handle_resolver_url,
            plc_directory_url,
            client_name: var("OAUTH_CLIENT_NAME").unwrap_or(defaults.client_name),
            sign_in_path,
            link_account_path,
            pending_request_ttl: duration_var(&var, "PENDING_REQUEST_TTL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.pending_request_ttl),
            token_refresh_margin: duration_var(&var, "TOKEN_REFRESH_MARGIN_SECS", Duration::from_secs)?
                .unwrap_or(defaults.token_refresh_margin),
            resolve_timeout: duration_var(&var, "RESOLVE_TIMEOUT_MS", Duration::from_millis)?
                .unwrap_or(defaults.resolve_timeout),
            token_timeout: duration_var(&var, "TOKEN_TIMEOUT_MS", Duration::from_millis)?
                .unwrap_or(defaults.token_timeout),
            cookie_key,
            encryption_key,
            database_url: var("DATABASE_URL"),
            development_mode: var("DEVELOPMENT_MODE").is_some_and(|v| v == "1"),
            port: var("PORT")
                .map(|raw| raw.parse::<u16>().wrap_err("Invalid PORT"))
                .transpose()?
                .unwrap_or(defaults.port),
        })
    }

    /// Origin used for client metadata: the override if set, otherwise the request's
    pub fn public_origin(&self, request_origin: &str) -> String {
        self.site_url
            .clone()
            .unwrap_or_else(|| request_origin.trim_end_matches('/').to_string())
    }
}

fn duration_var(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    unit: fn(u64) -> Duration,
) -> color_eyre::Result<Option<Duration>> {
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(unit)
                .wrap_err_with(|| format!("Invalid {name}"))
        })
        .transpose()
}

/// Parse an http(s) URL and return it without a trailing slash
pub fn normalize_base_url(raw: &str) -> color_eyre::Result<String> {
    let url = Url::parse(raw.trim()).wrap_err("Not a valid URL")?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(eyre!("URL must use http or https, got {}", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err(eyre!("URL must have a host"));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn relative_path(raw: &str) -> color_eyre::Result<String> {
    let path = raw.trim();
    if !path.starts_with('/') || path.starts_with("//") {
        return Err(eyre!("{path} must be a path starting with a single /"));
    }
    Ok(path.to_string())
}

fn parse_cookie_key(raw: &str) -> color_eyre::Result<Key> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .wrap_err("COOKIE_KEY must be standard base64")?;
    Key::try_from(bytes.as_slice())
        .map_err(|_| eyre!("COOKIE_KEY must decode to at least 64 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> color_eyre::Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.site_url, None);
        assert!(config.signing_key.is_none());
        assert_eq!(config.handle_resolver_url, DEFAULT_HANDLE_RESOLVER_URL);
        assert_eq!(config.sign_in_path, "/sign-in");
        assert_eq!(config.link_account_path, "/sign-up/link-bluesky");
        assert_eq!(config.pending_request_ttl, Duration::from_secs(600));
        assert_eq!(config.port, 3000);
        assert!(!config.development_mode);
    }

    #[test]
    fn site_url_is_normalized() {
        let config = config_from(&[("SITE_URL", "https://trainers.gg/")]).unwrap();
        assert_eq!(config.site_url.as_deref(), Some("https://trainers.gg"));
        assert_eq!(
            config.public_origin("http://internal:8080"),
            "https://trainers.gg"
        );
    }

    #[test]
    fn request_origin_is_used_without_override() {
        let config = config_from(&[]).unwrap();
        assert_eq!(
            config.public_origin("https://abc.ngrok.app/"),
            "https://abc.ngrok.app"
        );
    }

    #[test]
    fn malformed_values_fail_fast() {
        assert!(config_from(&[("SITE_URL", "trainers.gg")]).is_err());
        assert!(config_from(&[("SITE_URL", "ftp://trainers.gg")]).is_err());
        assert!(config_from(&[("ATPROTO_PRIVATE_KEY", "garbage")]).is_err());
        assert!(config_from(&[("COOKIE_KEY", "c2hvcnQ=")]).is_err());
        assert!(config_from(&[("PENDING_REQUEST_TTL_SECS", "ten")]).is_err());
        assert!(config_from(&[("SIGN_IN_PATH", "https://evil.example")]).is_err());
        assert!(config_from(&[("ENCRYPTION_KEY", "not-an-age-key")]).is_err());
    }

    #[test]
    fn cookie_key_round_trips_through_base64() {
        let key = Key::generate();
        let encoded = base64::engine::general_purpose::STANDARD.encode(key.master());

        let config = config_from(&[("COOKIE_KEY", &encoded)]).unwrap();
        assert_eq!(config.cookie_key.master(), key.master());
    }

    #[test]
    fn development_mode_requires_exactly_one() {
        assert!(config_from(&[("DEVELOPMENT_MODE", "1")]).unwrap().development_mode);
        assert!(!config_from(&[("DEVELOPMENT_MODE", "true")]).unwrap().development_mode);
    }
}

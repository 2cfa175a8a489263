use serde::{Deserialize, Serialize};

/// Scope requested by both client profiles
pub const SCOPE: &str = "atproto transition:generic";

/// Deep link the mobile app registers for the callback
pub const NATIVE_REDIRECT_URI: &str = "gg.trainers:/oauth/atproto-callback";

pub const WEB_CLIENT_METADATA_PATH: &str = "/oauth/client-metadata";
pub const NATIVE_CLIENT_METADATA_PATH: &str = "/oauth/mobile-client-metadata";
pub const CALLBACK_PATH: &str = "/oauth/callback";
pub const JWKS_PATH: &str = "/oauth/jwks.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationType {
    Web,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    PrivateKeyJwt,
    None,
}

/// OAuth client registration document, served at its own `client_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub client_name: String,
    pub client_uri: String,
    pub redirect_uris: Vec<String>,
    pub scope: String,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub application_type: ApplicationType,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    pub dpop_bound_access_tokens: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_signing_alg: Option<String>,
}

impl ClientMetadata {
    pub fn is_confidential(&self) -> bool {
        self.token_endpoint_auth_method == TokenEndpointAuthMethod::PrivateKeyJwt
    }

    pub fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }
}

fn base(origin: &str, client_name: &str, client_id: String) -> ClientMetadata {
    ClientMetadata {
        client_id,
        client_name: client_name.to_string(),
        client_uri: origin.to_string(),
        redirect_uris: vec![],
        scope: SCOPE.to_string(),
        grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
        response_types: vec!["code".to_string()],
        application_type: ApplicationType::Web,
        token_endpoint_auth_method: TokenEndpointAuthMethod::None,
        dpop_bound_access_tokens: true,
        jwks_uri: None,
        token_endpoint_auth_signing_alg: None,
    }
}

/// Confidential client metadata for the site served at `origin`
pub fn web_client_metadata(origin: &str, client_name: &str) -> ClientMetadata {
    let origin = origin.trim_end_matches('/');
    ClientMetadata {
        redirect_uris: vec![format!("{origin}{CALLBACK_PATH}")],
        application_type: ApplicationType::Web,
        token_endpoint_auth_method: TokenEndpointAuthMethod::PrivateKeyJwt,
        jwks_uri: Some(format!("{origin}{JWKS_PATH}")),
        token_endpoint_auth_signing_alg: Some("ES256".to_string()),
        ..base(
            origin,
            client_name,
            format!("{origin}{WEB_CLIENT_METADATA_PATH}"),
        )
    }
}

/// Public client metadata for the mobile app.
///
/// The redirect is always the app's deep link regardless of `site_url`, and no
/// signing keys are advertised.
pub fn native_client_metadata(site_url: &str, client_name: &str) -> ClientMetadata {
    let origin = site_url.trim_end_matches('/');
    ClientMetadata {
        redirect_uris: vec![NATIVE_REDIRECT_URI.to_string()],
        application_type: ApplicationType::Native,
        token_endpoint_auth_method: TokenEndpointAuthMethod::None,
        ..base(
            origin,
            client_name,
            format!("{origin}{NATIVE_CLIENT_METADATA_PATH}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_metadata_is_self_referential() {
        let metadata = web_client_metadata("https://trainers.gg", "trainers.gg");

        assert_eq!(metadata.client_id, "https://trainers.gg/oauth/client-metadata");
        assert_eq!(metadata.redirect_uris, vec!["https://trainers.gg/oauth/callback"]);
        assert_eq!(
            metadata.jwks_uri.as_deref(),
            Some("https://trainers.gg/oauth/jwks.json")
        );
        assert!(metadata.is_confidential());
        assert!(metadata.dpop_bound_access_tokens);
    }

    #[test]
    fn web_metadata_serializes_wire_names() {
        let json = serde_json::to_value(web_client_metadata("https://trainers.gg/", "trainers.gg"))
            .unwrap();

        assert_eq!(json["application_type"], "web");
        assert_eq!(json["token_endpoint_auth_method"], "private_key_jwt");
        assert_eq!(json["token_endpoint_auth_signing_alg"], "ES256");
        assert_eq!(json["scope"], "atproto transition:generic");
        assert_eq!(
            json["grant_types"],
            serde_json::json!(["authorization_code", "refresh_token"])
        );
        assert_eq!(json["response_types"], serde_json::json!(["code"]));
    }

    #[test]
    fn native_metadata_uses_deep_link_regardless_of_host() {
        for host in ["https://trainers.gg", "http://localhost:3000"] {
            let metadata = native_client_metadata(host, "trainers.gg");

            assert_eq!(metadata.redirect_uris, vec![NATIVE_REDIRECT_URI]);
            assert_eq!(
                metadata.token_endpoint_auth_method,
                TokenEndpointAuthMethod::None
            );
            assert_eq!(metadata.application_type, ApplicationType::Native);
        }
    }

    #[test]
    fn native_metadata_advertises_no_signing_keys() {
        let json =
            serde_json::to_value(native_client_metadata("https://trainers.gg", "trainers.gg")).unwrap();

        assert_eq!(json["token_endpoint_auth_method"], "none");
        assert_eq!(json["application_type"], "native");
        assert!(json.get("jwks_uri").is_none());
        assert!(json.get("token_endpoint_auth_signing_alg").is_none());
        assert_eq!(
            json["client_id"],
            "https://trainers.gg/oauth/mobile-client-metadata"
        );
    }
}

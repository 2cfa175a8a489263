use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fixtures::{Fixture, FixtureOptions, NonceMode};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const JWK: &str = r#"{"kty":"EC","crv":"P-256","x":"f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU","y":"x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0"}"#;

/// An unsigned proof; the fixture only inspects claims and the key
fn proof(htm: &str, htu: &str, nonce: Option<&str>) -> String {
    let header = json!({ "typ": "dpop+jwt", "alg": "ES256", "jwk": serde_json::from_str::<Value>(JWK).unwrap() });
    let mut claims = json!({ "jti": uuid::Uuid::new_v4().to_string(), "htm": htm, "htu": htu, "iat": 1_700_000_000 });
    if let Some(nonce) = nonce {
        claims["nonce"] = json!(nonce);
    }
    format!(
        "{}.{}.c2ln",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

fn jkt() -> String {
    fixtures::network::jwk_thumbprint(&serde_json::from_str(JWK).unwrap()).unwrap()
}

fn par_form(challenge: &str) -> Vec<(&'static str, String)> {
    vec![
        ("client_id", "http://localhost/oauth/client-metadata".to_string()),
        ("response_type", "code".to_string()),
        ("redirect_uri", "http://127.0.0.1/oauth/callback".to_string()),
        ("scope", "atproto transition:generic".to_string()),
        ("state", "state-123".to_string()),
        ("code_challenge", challenge.to_string()),
        ("code_challenge_method", "S256".to_string()),
        ("dpop_jkt", jkt()),
        ("login_hint", "ash.bsky.social".to_string()),
    ]
}

fn no_redirects() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_identity_resolution() {
    let fixture = Fixture::spawn(FixtureOptions::default()).await.unwrap();
    let client = reqwest::Client::new();

    let json: Value = client
        .get(format!(
            "{}/xrpc/com.atproto.identity.resolveHandle?handle=ash.bsky.social",
            fixture.base_url()
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["did"], "did:plc:example123");

    let unknown = client
        .get(format!(
            "{}/xrpc/com.atproto.identity.resolveHandle?handle=nobody.bsky.social",
            fixture.base_url()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::BAD_REQUEST);

    let document: Value = client
        .get(format!("{}/did:plc:example123", fixture.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(document["id"], "did:plc:example123");
    assert_eq!(document["alsoKnownAs"][0], "at://ash.bsky.social");
    assert_eq!(document["service"][0]["serviceEndpoint"], fixture.base_url());
}

#[tokio::test]
async fn test_oauth_metadata() {
    let fixture = Fixture::spawn(FixtureOptions::default()).await.unwrap();
    let client = reqwest::Client::new();

    let resource: Value = client
        .get(format!(
            "{}/.well-known/oauth-protected-resource",
            fixture.base_url()
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resource["authorization_servers"][0], fixture.base_url());

    let server: Value = client
        .get(format!(
            "{}/.well-known/oauth-authorization-server",
            fixture.base_url()
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(server["issuer"], fixture.base_url());
    assert_eq!(
        server["pushed_authorization_request_endpoint"],
        format!("{}/oauth/par", fixture.base_url())
    );
    assert_eq!(server["dpop_signing_alg_values_supported"][0], "ES256");
}

#[tokio::test]
async fn test_par_requires_dpop_proof() {
    let fixture = Fixture::spawn(FixtureOptions::default()).await.unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}/oauth/par", fixture.base_url()))
        .form(&par_form("challenge"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"], "invalid_dpop_proof");
}

#[tokio::test]
async fn test_par_nonce_challenge() {
    let fixture = Fixture::spawn(FixtureOptions {
        par_nonce: NonceMode::Required,
        ..FixtureOptions::default()
    })
    .await
    .unwrap();
    let client = reqwest::Client::new();
    let par_url = format!("{}/oauth/par", fixture.base_url());

    let challenged = client
        .post(&par_url)
        .header("DPoP", proof("POST", &par_url, None))
        .form(&par_form("challenge"))
        .send()
        .await
        .unwrap();
    assert_eq!(challenged.status(), reqwest::StatusCode::BAD_REQUEST);
    let nonce = challenged.headers()["dpop-nonce"].to_str().unwrap().to_string();
    let json: Value = challenged.json().await.unwrap();
    assert_eq!(json["error"], "use_dpop_nonce");

    let accepted = client
        .post(&par_url)
        .header("DPoP", proof("POST", &par_url, Some(&nonce)))
        .form(&par_form("challenge"))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), reqwest::StatusCode::CREATED);
    let json: Value = accepted.json().await.unwrap();
    assert!(json["request_uri"]
        .as_str()
        .unwrap()
        .starts_with("urn:ietf:params:oauth:request_uri:"));

    let counters = fixture.counters();
    assert_eq!(counters.par_requests, 2);
    assert_eq!(counters.nonce_challenges, 1);
}

#[tokio::test]
async fn test_full_code_grant_and_profile() {
    let fixture = Fixture::spawn(FixtureOptions::default()).await.unwrap();
    let client = no_redirects();
    let base = fixture.base_url().to_string();

    let verifier = "a-very-long-code-verifier-for-the-fixture-tests-0123456789";
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));

    let par: Value = client
        .post(format!("{base}/oauth/par"))
        .header("DPoP", proof("POST", &format!("{base}/oauth/par"), None))
        .form(&par_form(&challenge))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let redirect = client
        .get(format!("{base}/oauth/authorize"))
        .query(&[
            ("client_id", "http://localhost/oauth/client-metadata"),
            ("request_uri", par["request_uri"].as_str().unwrap()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(redirect.status(), reqwest::StatusCode::FOUND);
    let location = reqwest::Url::parse(redirect.headers()["location"].to_str().unwrap()).unwrap();
    let params: std::collections::HashMap<String, String> =
        location.query_pairs().into_owned().collect();
    assert_eq!(params["state"], "state-123");
    assert_eq!(params["iss"], base);

    let token_url = format!("{base}/oauth/token");
    let token_form = [
        ("client_id", "http://localhost/oauth/client-metadata"),
        ("grant_type", "authorization_code"),
        ("code", params["code"].as_str()),
        ("redirect_uri", "http://127.0.0.1/oauth/callback"),
        ("code_verifier", verifier),
    ];
    let token: Value = client
        .post(&token_url)
        .header("DPoP", proof("POST", &token_url, None))
        .form(&token_form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(token["token_type"], "DPoP");
    assert_eq!(token["sub"], "did:plc:example123");

    let reused = client
        .post(&token_url)
        .header("DPoP", proof("POST", &token_url, None))
        .form(&token_form)
        .send()
        .await
        .unwrap();
    assert_eq!(reused.status(), reqwest::StatusCode::BAD_REQUEST);

    let access_token = token["access_token"].as_str().unwrap();
    let profile = client
        .get(fixture.profile_url())
        .header("Authorization", format!("DPoP {access_token}"))
        .header("DPoP", proof_with_ath(&fixture.profile_url(), access_token))
        .send()
        .await
        .unwrap();
    assert_eq!(profile.status(), reqwest::StatusCode::OK);
    let json: Value = profile.json().await.unwrap();
    assert_eq!(json["handle"], "ash.bsky.social");

    fixture.invalidate_access_tokens();
    let rejected = client
        .get(fixture.profile_url())
        .header("Authorization", format!("DPoP {access_token}"))
        .header("DPoP", proof_with_ath(&fixture.profile_url(), access_token))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert!(rejected.headers()["www-authenticate"]
        .to_str()
        .unwrap()
        .contains(r#"error="invalid_token""#));
}

fn proof_with_ath(htu: &str, access_token: &str) -> String {
    let header = json!({ "typ": "dpop+jwt", "alg": "ES256", "jwk": serde_json::from_str::<Value>(JWK).unwrap() });
    let claims = json!({
        "jti": uuid::Uuid::new_v4().to_string(),
        "htm": "GET",
        "htu": htu,
        "iat": 1_700_000_000,
        "ath": URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes())),
    });
    format!(
        "{}.{}.c2ln",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

//! A stand-in for the slice of the AT Protocol network a sign-in touches.
//!
//! One listener serves handle resolution, a PLC directory, a PDS and the
//! PDS's authorization server. The authorization server checks what a real
//! one would: DPoP proofs and their key binding, PKCE, client assertions,
//! nonces and single-use codes and refresh tokens.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::{Form, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub const PROFILE_PATH: &str = "/xrpc/app.bsky.actor.getProfile";

const SCOPE: &str = "atproto transition:generic";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const DPOP_NONCE: &str = "dpop-nonce";

#[derive(Debug, Clone)]
pub struct FixtureAccount {
    pub handle: String,
    pub did: String,
}

impl FixtureAccount {
    pub fn new(handle: &str, did: &str) -> Self {
        Self {
            handle: handle.to_string(),
            did: did.to_string(),
        }
    }
}

/// How an endpoint treats DPoP nonces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NonceMode {
    #[default]
    Off,
    /// Proofs must carry the current nonce
    Required,
    /// Every proof is challenged with a fresh nonce
    AlwaysReject,
}

/// Deviations from a well-behaved token response
#[derive(Debug, Clone, Default)]
pub struct TokenOverrides {
    pub token_type: Option<String>,
    pub sub: Option<String>,
    pub scope: Option<String>,
    pub omit_refresh_token: bool,
}

#[derive(Debug, Clone)]
pub struct FixtureOptions {
    pub accounts: Vec<FixtureAccount>,
    pub par_nonce: NonceMode,
    pub token_nonce: NonceMode,
    pub resource_nonce: NonceMode,
    pub access_token_expires_in: i64,
    /// Held before answering each refresh grant
    pub refresh_delay: Duration,
    pub token: TokenOverrides,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            accounts: vec![FixtureAccount::new("ash.bsky.social", "did:plc:example123")],
            par_nonce: NonceMode::Off,
            token_nonce: NonceMode::Off,
            resource_nonce: NonceMode::Off,
            access_token_expires_in: 3600,
            refresh_delay: Duration::ZERO,
            token: TokenOverrides::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    par: AtomicUsize,
    token: AtomicUsize,
    refresh: AtomicUsize,
    revoke: AtomicUsize,
    resource: AtomicUsize,
    nonce_challenges: AtomicUsize,
}

/// Request counts, challenged requests included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub par_requests: usize,
    pub token_requests: usize,
    /// Refresh grants that got past the DPoP checks
    pub refresh_grants: usize,
    pub revocations: usize,
    pub resource_requests: usize,
    pub nonce_challenges: usize,
}

#[derive(Debug, Clone)]
struct AuthorizationRequest {
    client_id: String,
    redirect_uri: String,
    state: String,
    code_challenge: String,
    dpop_jkt: String,
    did: String,
}

#[derive(Debug, Clone)]
struct Grant {
    did: String,
    client_id: String,
    jkt: String,
}

#[derive(Debug)]
struct AccessGrant {
    grant: Grant,
    expires_at: i64,
}

#[derive(Debug, Default)]
struct Grants {
    requests: HashMap<String, AuthorizationRequest>,
    codes: HashMap<String, AuthorizationRequest>,
    access_tokens: HashMap<String, AccessGrant>,
    refresh_tokens: HashMap<String, Grant>,
    assertion_ids: HashSet<String>,
}

struct Proof {
    jkt: String,
    htm: String,
    htu: String,
    nonce: Option<String>,
    ath: Option<String>,
}

struct Network {
    base_url: String,
    options: FixtureOptions,
    counters: Counters,
    nonce: AtomicUsize,
    fail_refresh: AtomicBool,
    refresh_outage: AtomicBool,
    grants: Mutex<Grants>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn sha256_b64(input: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(input.as_bytes()))
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response()
}

fn invalid_request(description: &str) -> Response {
    oauth_error(StatusCode::BAD_REQUEST, "invalid_request", description)
}

fn invalid_grant(description: &str) -> Response {
    oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", description)
}

fn invalid_client(description: &str) -> Response {
    oauth_error(StatusCode::UNAUTHORIZED, "invalid_client", description)
}

fn invalid_proof(description: &str) -> Response {
    oauth_error(StatusCode::BAD_REQUEST, "invalid_dpop_proof", description)
}

/// 401 with a `WWW-Authenticate: DPoP` challenge, the way a PDS answers
fn resource_challenge(error: &str, description: &str) -> Response {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": error, "message": description })),
    )
        .into_response();
    let challenge = format!(r#"DPoP error="{error}", error_description="{description}""#);
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

fn set_nonce(response: &mut Response, nonce: &str) {
    if let Ok(value) = HeaderValue::from_str(nonce) {
        response.headers_mut().insert(DPOP_NONCE, value);
    }
}

fn required<'a>(form: &'a HashMap<String, String>, name: &str) -> Result<&'a str, Response> {
    form.get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| invalid_request(&format!("missing {name}")))
}

fn decode_segment(segment: &str) -> Option<Value> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Header and claims of a compact JWS. Signatures are not checked.
fn jwt_parts(token: &str) -> Option<(Value, Value)> {
    let mut parts = token.split('.');
    let (Some(header), Some(claims), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    Some((decode_segment(header)?, decode_segment(claims)?))
}

/// RFC 7638 thumbprint of an EC public JWK
pub fn jwk_thumbprint(jwk: &Value) -> Option<String> {
    let field = |name: &str| jwk.get(name).and_then(Value::as_str);
    let canonical = format!(
        r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
        field("crv")?,
        field("kty")?,
        field("x")?,
        field("y")?
    );
    Some(sha256_b64(&canonical))
}

fn parse_proof(headers: &HeaderMap) -> Result<Proof, Response> {
    let raw = headers
        .get("dpop")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| invalid_proof("missing DPoP proof"))?;
    let (header, claims) = jwt_parts(raw).ok_or_else(|| invalid_proof("malformed DPoP proof"))?;

    if header["typ"] != "dpop+jwt" || header["alg"] != "ES256" {
        return Err(invalid_proof("unexpected DPoP proof header"));
    }
    let jkt = jwk_thumbprint(&header["jwk"]).ok_or_else(|| invalid_proof("DPoP proof has no key"))?;
    if !claims["jti"].is_string() || !claims["iat"].is_i64() {
        return Err(invalid_proof("DPoP proof is missing jti or iat"));
    }

    let text = |name: &str| claims.get(name).and_then(Value::as_str).map(str::to_string);
    Ok(Proof {
        jkt,
        htm: text("htm").unwrap_or_default(),
        htu: text("htu").unwrap_or_default(),
        nonce: text("nonce"),
        ath: text("ath"),
    })
}

impl Network {
    fn new(addr: SocketAddr, options: FixtureOptions) -> Self {
        Self {
            base_url: format!("http://{addr}"),
            options,
            counters: Counters::default(),
            nonce: AtomicUsize::new(0),
            fail_refresh: AtomicBool::new(false),
            refresh_outage: AtomicBool::new(false),
            grants: Mutex::new(Grants::default()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn grants(&self) -> MutexGuard<'_, Grants> {
        self.grants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn account_by_handle(&self, handle: &str) -> Option<&FixtureAccount> {
        self.options
            .accounts
            .iter()
            .find(|account| account.handle.eq_ignore_ascii_case(handle))
    }

    fn account_by_did(&self, did: &str) -> Option<&FixtureAccount> {
        self.options.accounts.iter().find(|account| account.did == did)
    }

    fn current_nonce(&self) -> String {
        format!("nonce-{}", self.nonce.load(Ordering::SeqCst))
    }

    /// `Err` carries the nonce to challenge with
    fn check_nonce(&self, mode: NonceMode, proof: &Proof) -> Result<(), String> {
        match mode {
            NonceMode::Off => Ok(()),
            NonceMode::Required if proof.nonce.as_deref() == Some(self.current_nonce().as_str()) => {
                Ok(())
            }
            NonceMode::Required => Err(self.current_nonce()),
            NonceMode::AlwaysReject => {
                let next = self.nonce.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("nonce-{next}"))
            }
        }
    }

    /// Advertise the current nonce unless the response already names one
    fn with_nonce(&self, mode: NonceMode, mut response: Response) -> Response {
        if mode != NonceMode::Off && !response.headers().contains_key(DPOP_NONCE) {
            set_nonce(&mut response, &self.current_nonce());
        }
        response
    }

    fn auth_server_proof(
        &self,
        headers: &HeaderMap,
        path: &str,
        mode: NonceMode,
    ) -> Result<Proof, Response> {
        let proof = parse_proof(headers)?;
        if proof.htm != "POST" || proof.htu != self.url(path) {
            return Err(invalid_proof("DPoP proof is for another request"));
        }

        if let Err(nonce) = self.check_nonce(mode, &proof) {
            self.counters.nonce_challenges.fetch_add(1, Ordering::SeqCst);
            let mut response = oauth_error(
                StatusCode::BAD_REQUEST,
                "use_dpop_nonce",
                "Authorization server requires nonce in DPoP proof",
            );
            set_nonce(&mut response, &nonce);
            return Err(response);
        }
        Ok(proof)
    }

    /// Public clients name themselves; confidential ones also send a fresh
    /// assertion addressed to this issuer.
    fn authenticate_client(&self, form: &HashMap<String, String>) -> Result<String, Response> {
        let client_id = required(form, "client_id")?.to_string();

        match form.get("client_assertion_type").map(String::as_str) {
            None => Ok(client_id),
            Some(CLIENT_ASSERTION_TYPE) => {
                let (_, claims) = form
                    .get("client_assertion")
                    .and_then(|assertion| jwt_parts(assertion))
                    .ok_or_else(|| invalid_client("malformed client assertion"))?;
                if claims["iss"] != client_id.as_str()
                    || claims["sub"] != client_id.as_str()
                    || claims["aud"] != self.base_url.as_str()
                {
                    return Err(invalid_client("client assertion is for another client"));
                }
                let jti = claims["jti"]
                    .as_str()
                    .ok_or_else(|| invalid_client("client assertion has no jti"))?;
                if !self.grants().assertion_ids.insert(jti.to_string()) {
                    return Err(invalid_client("client assertion was replayed"));
                }
                Ok(client_id)
            }
            Some(_) => Err(invalid_client("unsupported client assertion type")),
        }
    }

    fn push_request(
        &self,
        headers: &HeaderMap,
        form: &HashMap<String, String>,
    ) -> Result<Response, Response> {
        let proof = self.auth_server_proof(headers, "/oauth/par", self.options.par_nonce)?;
        let client_id = self.authenticate_client(form)?;

        if required(form, "response_type")? != "code" {
            return Err(invalid_request("response_type must be code"));
        }
        if required(form, "code_challenge_method")? != "S256" {
            return Err(invalid_request("code_challenge_method must be S256"));
        }
        let dpop_jkt = required(form, "dpop_jkt")?;
        if dpop_jkt != proof.jkt {
            return Err(invalid_request("dpop_jkt does not match the proof key"));
        }
        if !required(form, "scope")?.split(' ').any(|scope| scope == "atproto") {
            return Err(oauth_error(
                StatusCode::BAD_REQUEST,
                "invalid_scope",
                "atproto scope is required",
            ));
        }

        let did = form
            .get("login_hint")
            .and_then(|hint| {
                self.account_by_handle(hint)
                    .or_else(|| self.account_by_did(hint))
            })
            .or_else(|| self.options.accounts.first())
            .map(|account| account.did.clone())
            .ok_or_else(|| invalid_request("no accounts on this server"))?;

        let request = AuthorizationRequest {
            client_id,
            redirect_uri: required(form, "redirect_uri")?.to_string(),
            state: required(form, "state")?.to_string(),
            code_challenge: required(form, "code_challenge")?.to_string(),
            dpop_jkt: dpop_jkt.to_string(),
            did,
        };
        let request_uri = format!(
            "urn:ietf:params:oauth:request_uri:req-{}",
            Uuid::new_v4().simple()
        );
        self.grants().requests.insert(request_uri.clone(), request);

        Ok((
            StatusCode::CREATED,
            Json(json!({ "request_uri": request_uri, "expires_in": 60 })),
        )
            .into_response())
    }

    fn exchange(
        &self,
        headers: &HeaderMap,
        form: &HashMap<String, String>,
    ) -> Result<Response, Response> {
        let proof = self.auth_server_proof(headers, "/oauth/token", self.options.token_nonce)?;
        let client_id = self.authenticate_client(form)?;

        match required(form, "grant_type")? {
            "authorization_code" => self.redeem_code(&proof, &client_id, form),
            "refresh_token" => {
                self.counters.refresh.fetch_add(1, Ordering::SeqCst);
                self.refresh(&proof, &client_id, form)
            }
            _ => Err(oauth_error(
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type",
                "unsupported grant type",
            )),
        }
    }

    fn redeem_code(
        &self,
        proof: &Proof,
        client_id: &str,
        form: &HashMap<String, String>,
    ) -> Result<Response, Response> {
        let code = required(form, "code")?;
        let verifier = required(form, "code_verifier")?;
        let redirect_uri = required(form, "redirect_uri")?;

        let mut grants = self.grants();
        let request = grants
            .codes
            .remove(code)
            .ok_or_else(|| invalid_grant("unknown or already used authorization code"))?;

        if request.client_id != client_id || request.redirect_uri != redirect_uri {
            return Err(invalid_grant("code was issued to another client"));
        }
        if sha256_b64(verifier) != request.code_challenge {
            return Err(invalid_grant("PKCE verification failed"));
        }
        if proof.jkt != request.dpop_jkt {
            return Err(invalid_grant("DPoP key does not match the authorization request"));
        }

        info!(did = %request.did, "Fixture issuing tokens for authorization code");
        Ok(self.issue_tokens(
            &mut grants,
            Grant {
                did: request.did,
                client_id: request.client_id,
                jkt: request.dpop_jkt,
            },
        ))
    }

    fn refresh(
        &self,
        proof: &Proof,
        client_id: &str,
        form: &HashMap<String, String>,
    ) -> Result<Response, Response> {
        let refresh_token = required(form, "refresh_token")?;
        let mut grants = self.grants();

        if self.fail_refresh.load(Ordering::SeqCst) {
            grants.refresh_tokens.remove(refresh_token);
            return Err(invalid_grant("refresh token has been revoked"));
        }
        let grant = grants
            .refresh_tokens
            .remove(refresh_token)
            .ok_or_else(|| invalid_grant("unknown or already used refresh token"))?;
        if grant.client_id != client_id || grant.jkt != proof.jkt {
            return Err(invalid_grant("refresh token is bound to another client or key"));
        }

        info!(did = %grant.did, "Fixture rotating refresh token");
        Ok(self.issue_tokens(&mut grants, grant))
    }

    fn issue_tokens(&self, grants: &mut Grants, grant: Grant) -> Response {
        let overrides = &self.options.token;
        let access_token = format!("at-{}", Uuid::new_v4().simple());

        let mut body = json!({
            "access_token": access_token,
            "token_type": overrides.token_type.as_deref().unwrap_or("DPoP"),
            "expires_in": self.options.access_token_expires_in,
            "scope": overrides.scope.as_deref().unwrap_or(SCOPE),
            "sub": overrides.sub.as_deref().unwrap_or(&grant.did),
        });
        if !overrides.omit_refresh_token {
            let refresh_token = format!("rt-{}", Uuid::new_v4().simple());
            body["refresh_token"] = json!(refresh_token);
            grants.refresh_tokens.insert(refresh_token, grant.clone());
        }
        grants.access_tokens.insert(
            access_token,
            AccessGrant {
                grant,
                expires_at: now() + self.options.access_token_expires_in,
            },
        );

        Json(body).into_response()
    }

    fn revoke(
        &self,
        headers: &HeaderMap,
        form: &HashMap<String, String>,
    ) -> Result<Response, Response> {
        self.auth_server_proof(headers, "/oauth/revoke", self.options.token_nonce)?;
        self.authenticate_client(form)?;
        let token = required(form, "token")?;

        let mut grants = self.grants();
        grants.refresh_tokens.remove(token);
        grants.access_tokens.remove(token);
        self.counters.revoke.fetch_add(1, Ordering::SeqCst);

        Ok(StatusCode::OK.into_response())
    }

    fn profile(&self, headers: &HeaderMap) -> Result<Response, Response> {
        let access_token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("DPoP "))
            .ok_or_else(|| resource_challenge("invalid_token", "DPoP access token required"))?;

        let proof = parse_proof(headers)?;
        if proof.htm != "GET" || proof.htu != self.url(PROFILE_PATH) {
            return Err(invalid_proof("DPoP proof is for another request"));
        }
        if proof.ath.as_deref() != Some(sha256_b64(access_token).as_str()) {
            return Err(resource_challenge(
                "invalid_dpop_proof",
                "DPoP proof is not bound to the access token",
            ));
        }

        if let Err(nonce) = self.check_nonce(self.options.resource_nonce, &proof) {
            self.counters.nonce_challenges.fetch_add(1, Ordering::SeqCst);
            let mut response = resource_challenge(
                "use_dpop_nonce",
                "Resource server requires nonce in DPoP proof",
            );
            set_nonce(&mut response, &nonce);
            return Err(response);
        }

        let grants = self.grants();
        let grant = grants
            .access_tokens
            .get(access_token)
            .filter(|access| access.expires_at > now() && access.grant.jkt == proof.jkt)
            .map(|access| &access.grant)
            .ok_or_else(|| resource_challenge("invalid_token", "access token is not valid"))?;

        let handle = self
            .account_by_did(&grant.did)
            .map(|account| account.handle.clone());
        Ok(Json(json!({ "did": grant.did, "handle": handle })).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct ResolveHandleQuery {
    handle: String,
}

async fn resolve_handle(
    State(network): State<Arc<Network>>,
    Query(query): Query<ResolveHandleQuery>,
) -> Response {
    match network.account_by_handle(&query.handle) {
        Some(account) => Json(json!({ "did": account.did })).into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "InvalidRequest", "message": "Unable to resolve handle" })),
        )
            .into_response(),
    }
}

async fn did_document(State(network): State<Arc<Network>>, Path(did): Path<String>) -> Response {
    let Some(account) = network.account_by_did(&did) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "DID not registered" })))
            .into_response();
    };

    Json(json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": account.did,
        "alsoKnownAs": [format!("at://{}", account.handle)],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": network.base_url,
        }],
    }))
    .into_response()
}

async fn protected_resource(State(network): State<Arc<Network>>) -> Json<Value> {
    Json(json!({
        "resource": network.base_url,
        "authorization_servers": [network.base_url],
        "scopes_supported": [],
        "bearer_methods_supported": ["header"],
    }))
}

async fn authorization_server(State(network): State<Arc<Network>>) -> Json<Value> {
    Json(json!({
        "issuer": network.base_url,
        "authorization_endpoint": network.url("/oauth/authorize"),
        "token_endpoint": network.url("/oauth/token"),
        "pushed_authorization_request_endpoint": network.url("/oauth/par"),
        "revocation_endpoint": network.url("/oauth/revoke"),
        "require_pushed_authorization_requests": true,
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none", "private_key_jwt"],
        "token_endpoint_auth_signing_alg_values_supported": ["ES256"],
        "scopes_supported": ["atproto", "transition:generic"],
        "dpop_signing_alg_values_supported": ["ES256"],
        "authorization_response_iss_parameter_supported": true,
    }))
}

async fn pushed_authorization_request(
    State(network): State<Arc<Network>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    network.counters.par.fetch_add(1, Ordering::SeqCst);
    let response = network
        .push_request(&headers, &form)
        .unwrap_or_else(|rejection| rejection);
    network.with_nonce(network.options.par_nonce, response)
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    client_id: String,
    request_uri: String,
    /// Simulates the user declining consent
    #[serde(default)]
    deny: Option<String>,
}

/// Approves (or with `deny` set, declines) the pushed request straight away
async fn authorize(
    State(network): State<Arc<Network>>,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let mut grants = network.grants();
    let Some(request) = grants.requests.remove(&query.request_uri) else {
        return invalid_request("unknown or already used request_uri");
    };
    if request.client_id != query.client_id {
        return invalid_request("request_uri was pushed by another client");
    }

    let params = if query.deny.is_some() {
        vec![
            ("error", "access_denied".to_string()),
            ("error_description", "The user denied the request".to_string()),
            ("state", request.state.clone()),
            ("iss", network.base_url.clone()),
        ]
    } else {
        let code = format!("code-{}", Uuid::new_v4().simple());
        grants.codes.insert(code.clone(), request.clone());
        vec![
            ("code", code),
            ("state", request.state.clone()),
            ("iss", network.base_url.clone()),
        ]
    };

    match serde_urlencoded::to_string(&params) {
        Ok(query) => (
            StatusCode::FOUND,
            [(header::LOCATION, format!("{}?{}", request.redirect_uri, query))],
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "Fixture failed to encode redirect");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn token(
    State(network): State<Arc<Network>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    network.counters.token.fetch_add(1, Ordering::SeqCst);
    let refreshing = form.get("grant_type").map(String::as_str) == Some("refresh_token");
    if refreshing && !network.options.refresh_delay.is_zero() {
        tokio::time::sleep(network.options.refresh_delay).await;
    }
    if refreshing && network.refresh_outage.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/html")],
            "<html><body>503 Service Unavailable</body></html>",
        )
            .into_response();
    }

    let response = network
        .exchange(&headers, &form)
        .unwrap_or_else(|rejection| rejection);
    network.with_nonce(network.options.token_nonce, response)
}

async fn revoke(
    State(network): State<Arc<Network>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let response = network
        .revoke(&headers, &form)
        .unwrap_or_else(|rejection| rejection);
    network.with_nonce(network.options.token_nonce, response)
}

async fn get_profile(State(network): State<Arc<Network>>, headers: HeaderMap) -> Response {
    network.counters.resource.fetch_add(1, Ordering::SeqCst);
    let response = network.profile(&headers).unwrap_or_else(|rejection| rejection);
    network.with_nonce(network.options.resource_nonce, response)
}

fn routes(network: Arc<Network>) -> Router {
    Router::new()
        .route(
            "/xrpc/com.atproto.identity.resolveHandle",
            get(resolve_handle),
        )
        .route(PROFILE_PATH, get(get_profile))
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server),
        )
        .route("/oauth/par", post(pushed_authorization_request))
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/token", post(token))
        .route("/oauth/revoke", post(revoke))
        .route("/:did", get(did_document))
        .with_state(network)
}

/// The whole network as a router, advertising URLs under `addr`
pub fn router(addr: SocketAddr, options: FixtureOptions) -> Router {
    routes(Arc::new(Network::new(addr, options)))
}

/// A network running in the background on an ephemeral loopback port.
///
/// The server stops when the fixture is dropped.
pub struct Fixture {
    network: Arc<Network>,
    server: JoinHandle<()>,
}

impl Fixture {
    pub async fn spawn(options: FixtureOptions) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let network = Arc::new(Network::new(listener.local_addr()?, options));
        let app = routes(network.clone());

        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(error = %err, "Fixture network stopped");
            }
        });

        Ok(Self { network, server })
    }

    /// Base URL of every service: resolver, PLC directory, PDS and issuer
    pub fn base_url(&self) -> &str {
        &self.network.base_url
    }

    pub fn profile_url(&self) -> String {
        self.network.url(PROFILE_PATH)
    }

    pub fn account(&self) -> &FixtureAccount {
        &self.network.options.accounts[0]
    }

    pub fn counters(&self) -> CounterSnapshot {
        let counters = &self.network.counters;
        let load = |counter: &AtomicUsize| counter.load(Ordering::SeqCst);
        CounterSnapshot {
            par_requests: load(&counters.par),
            token_requests: load(&counters.token),
            refresh_grants: load(&counters.refresh),
            revocations: load(&counters.revoke),
            resource_requests: load(&counters.resource),
            nonce_challenges: load(&counters.nonce_challenges),
        }
    }

    /// Make every refresh grant fail with `invalid_grant`
    pub fn set_fail_refresh(&self, fail: bool) {
        self.network.fail_refresh.store(fail, Ordering::SeqCst);
    }

    /// Answer refresh grants with a bare HTML 503, as a proxy in front of an outage would
    pub fn set_refresh_outage(&self, outage: bool) {
        self.network.refresh_outage.store(outage, Ordering::SeqCst);
    }

    /// Forget all access tokens so resource requests answer `invalid_token`
    pub fn invalidate_access_tokens(&self) {
        self.network.grants().access_tokens.clear();
    }

    pub fn live_refresh_tokens(&self) -> usize {
        self.network.grants().refresh_tokens.len()
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, Response, StatusCode},
};
use fixtures::{Fixture, FixtureOptions};
use tower::ServiceExt;
use trainers_auth::{
    config::AppConfig, oauth::jwk::ClientSigningKey, routes::routes, state::AppState,
    storage::MemoryStore,
};

pub const SITE_URL: &str = "http://127.0.0.1:3000";

/// The app wired to an in-process fake AT Protocol network
pub struct TestApp {
    pub state: AppState,
    pub fixture: Fixture,
    browser: reqwest::Client,
}

pub fn test_config(fixture: &Fixture) -> AppConfig {
    AppConfig {
        site_url: Some(SITE_URL.to_string()),
        signing_key: Some(ClientSigningKey::new(p256::ecdsa::SigningKey::random(
            &mut rand::rngs::OsRng,
        ))),
        handle_resolver_url: fixture.base_url().to_string(),
        plc_directory_url: fixture.base_url().to_string(),
        development_mode: true,
        ..AppConfig::default()
    }
}

pub async fn spawn_app(options: FixtureOptions) -> TestApp {
    spawn_app_with(options, |_| {}).await
}

pub async fn spawn_app_with(options: FixtureOptions, adjust: impl FnOnce(&mut AppConfig)) -> TestApp {
    let fixture = Fixture::spawn(options)
        .await
        .expect("Failed to start fixture network");
    let mut config = test_config(&fixture);
    adjust(&mut config);

    let state = AppState::new(config, Arc::new(MemoryStore::default()))
        .expect("Failed to build app state");
    let browser = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to build HTTP client");

    TestApp {
        state,
        fixture,
        browser,
    }
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("response has no Location")
        .to_str()
        .unwrap()
        .to_string()
}

/// The full `Set-Cookie` line for `name`, if the response sets it
pub fn set_cookie(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with(&format!("{name}=")))
        .map(str::to_string)
}

/// `name=value` of a `Set-Cookie` line, ready for a `Cookie` header
pub fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split(';').next().unwrap_or_default().to_string()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}

impl TestApp {
    pub fn did(&self) -> String {
        self.fixture.account().did.clone()
    }

    pub fn handle(&self) -> String {
        self.fixture.account().handle.clone()
    }

    pub async fn request(&self, method: Method, uri: &str, cookie: Option<&str>) -> Response<Body> {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }

        routes(self.state.clone())
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Method::GET, uri, None).await
    }

    pub async fn login(&self, handle: &str, return_url: &str) -> Response<Body> {
        let query = serde_urlencoded::to_string([("handle", handle), ("returnUrl", return_url)])
            .unwrap();
        self.get(&format!("/oauth/login?{query}")).await
    }

    /// Follow the authorization server redirect the way a browser would and
    /// return the callback path the server sends back
    pub async fn authorize(&self, authorization_url: &str, deny: bool) -> String {
        let mut url = authorization_url.to_string();
        if deny {
            url.push_str("&deny=1");
        }

        let response = self
            .browser
            .get(&url)
            .send()
            .await
            .expect("Authorization request failed");
        assert_eq!(response.status(), reqwest::StatusCode::FOUND);

        let callback = response.headers()[reqwest::header::LOCATION]
            .to_str()
            .unwrap()
            .to_string();
        callback
            .strip_prefix(SITE_URL)
            .expect("callback goes to the app")
            .to_string()
    }

    /// Log in and authorize, returning the callback path
    pub async fn callback_path(&self, return_url: &str) -> String {
        let login = self.login(&self.handle(), return_url).await;
        assert_eq!(login.status(), StatusCode::FOUND);
        self.authorize(&location(&login), false).await
    }

    /// Run a whole sign-in and return the callback response
    pub async fn sign_in(&self, return_url: &str) -> Response<Body> {
        let callback = self.callback_path(return_url).await;
        self.get(&callback).await
    }
}

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

pub mod callback;
pub mod client_metadata;
pub mod link;
pub mod login;

/// `302 Found` to `location`
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Origin the request was addressed to, honouring a fronting proxy
pub(crate) fn request_origin(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let host = header("x-forwarded-host")
        .or_else(|| header(header::HOST.as_str()))
        .unwrap_or("localhost");
    let proto = header("x-forwarded-proto").unwrap_or_else(|| {
        if is_loopback(host) {
            "http"
        } else {
            "https"
        }
    });

    format!("{proto}://{host}")
}

fn is_loopback(host: &str) -> bool {
    let name = host.rsplit_once(':').map_or(host, |(name, _)| name);
    matches!(name, "localhost" | "127.0.0.1" | "[::1]")
}

/// `path?query`, with `query` form encoded
pub(crate) fn with_query(path: &str, query: &[(&str, &str)]) -> String {
    match serde_urlencoded::to_string(query) {
        Ok(encoded) if !encoded.is_empty() => format!("{path}?{encoded}"),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn origin_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:8080"));
        assert_eq!(request_origin(&headers), "https://internal:8080");

        headers.insert("x-forwarded-host", HeaderValue::from_static("trainers.gg"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(request_origin(&headers), "https://trainers.gg");
    }

    #[test]
    fn loopback_hosts_default_to_http() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1:3000"));
        assert_eq!(request_origin(&headers), "http://127.0.0.1:3000");
    }

    #[test]
    fn queries_are_encoded() {
        assert_eq!(
            with_query("/sign-in", &[("error", "invalid_state"), ("error_description", "a b&c")]),
            "/sign-in?error=invalid_state&error_description=a+b%26c"
        );
        assert_eq!(with_query("/sign-in", &[]), "/sign-in");
    }
}

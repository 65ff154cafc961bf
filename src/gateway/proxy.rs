//! Remote content proxy: `GET /api/proxy?url=...` (also `/api/static/*`).
//!
//! Fetches the URL server-side and relays status, body and content type with
//! a permissive CORS header, so the browser can embed content it could not
//! load cross-origin.

use super::error::ApiError;
use super::AppState;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

pub const MISSING_URL: &str = "URL parameter is required";
pub const FETCH_FAILED: &str = "Failed to fetch content";
const DEFAULT_CONTENT_TYPE: &str = "text/html";

#[derive(Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
}

/// GET /api/proxy - relay the resource named by `url`.
pub async fn handle_proxy(
    State(state): State<AppState>,
    Query(params): Query<ProxyQuery>,
) -> Response {
    let url = match params.url {
        Some(u) if !u.trim().is_empty() => u,
        _ => return ApiError::BadRequest(MISSING_URL.to_string()).into_response(),
    };

    if !host_allowed(&state.config.proxy.allowed_hosts, &url) {
        tracing::warn!(url = %url, "Proxy target host is not allowed");
        return ApiError::Forbidden("Host is not allowed".to_string()).into_response();
    }

    match fetch(&state.http, &url).await {
        Ok((status, content_type, body)) => (
            status,
            [
                (header::CONTENT_TYPE, content_type),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
            ],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(url = %url, "Proxy fetch failed: {e}");
            ApiError::Internal(FETCH_FAILED).into_response()
        }
    }
}

async fn fetch(http: &reqwest::Client, url: &str) -> anyhow::Result<(StatusCode, String, Body)> {
    let resp = http.get(url).send().await?;

    let status = resp.status();
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let body = resp.bytes().await?;

    Ok((status, content_type, Body::from(body)))
}

/// An empty allow-list permits every host. Unparseable URLs pass through so
/// the fetch reports them like any other failure.
fn host_allowed(allowed: &[String], url: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return true;
    };
    parsed
        .host_str()
        .is_some_and(|host| allowed.iter().any(|a| a.eq_ignore_ascii_case(host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_everything() {
        assert!(host_allowed(&[], "https://example.com/page"));
    }

    #[test]
    fn allow_list_matches_host_case_insensitively() {
        let allowed = vec!["Example.com".to_string()];
        assert!(host_allowed(&allowed, "https://example.com/a?b=c"));
        assert!(!host_allowed(&allowed, "https://evil.test/"));
        assert!(!host_allowed(&allowed, "https://sub.example.com/"));
    }

    #[test]
    fn malformed_urls_are_left_to_the_fetch() {
        let allowed = vec!["example.com".to_string()];
        assert!(host_allowed(&allowed, "not a url"));
    }
}

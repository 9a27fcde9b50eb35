//! The Agent URL rewrite contract (§6, §4.F) and header sanitation, implemented once so the
//! server side (rewriting `location`/`x-goog-upload-url` before relaying them to the HTTP
//! client) and the in-page agent's own documented behavior (extracting `__proxy_host__`
//! before `fetch`) describe the exact same bytes.

use relaygate_protocol::{PROXY_HOST_PARAM, STRIPPED_REQUEST_HEADERS, STRIPPED_RESPONSE_HEADER_PREFIXES, STRIPPED_RESPONSE_HEADERS};
use url::Url;

const DUMMY_BASE: &str = "http://relaygate.invalid";

/// Extracts a `__proxy_host__` override from `path_and_query` (§4.F): if present, the query
/// parameter is stripped from the returned path and its value becomes the target host;
/// otherwise `default_host` is used unchanged.
pub fn resolve_target_host(path_and_query: &str, default_host: &str) -> (String, String) {
    let Ok(mut url) = Url::options().base_url(Some(&base())).parse(path_and_query) else {
        return (path_and_query.to_string(), default_host.to_string());
    };

    let mut override_host = None;
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, value)| {
            if key == PROXY_HOST_PARAM {
                override_host = Some(value.to_string());
                false
            } else {
                true
            }
        })
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if remaining.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut()
            .clear()
            .extend_pairs(remaining.iter().map(|(key, value)| (key.as_str(), value.as_str())));
    }

    let cleaned = format!("{}{}", url.path(), url.query().map(|q| format!("?{q}")).unwrap_or_default());
    (cleaned, override_host.unwrap_or_else(|| default_host.to_string()))
}

/// Server-side half of the same contract (§6): when relaying an upstream `location` or
/// `x-goog-upload-url` header, rewrite its authority to `own_authority` and append
/// `__proxy_host__=<original host>` so a subsequent client request against the rewritten URL
/// round-trips back to the correct upstream. Returns `None` if `header_value` isn't an
/// absolute URL (nothing to rewrite) or already targets `own_authority`.
pub fn rewrite_upstream_location(header_value: &str, own_authority: &str, own_scheme: &str) -> Option<String> {
    let mut url = Url::parse(header_value).ok()?;
    let upstream_host = url.host_str()?.to_string();
    if upstream_host == own_authority {
        return None;
    }

    url.query_pairs_mut().append_pair(PROXY_HOST_PARAM, &upstream_host);
    let _ = url.set_scheme(own_scheme);
    let _ = url.set_host(Some(own_authority_host(own_authority)));
    let _ = url.set_port(own_authority_port(own_authority));

    Some(url.to_string())
}

fn own_authority_host(authority: &str) -> &str {
    authority.split(':').next().unwrap_or(authority)
}

fn own_authority_port(authority: &str) -> Option<u16> {
    authority.split(':').nth(1).and_then(|port| port.parse().ok())
}

fn base() -> Url {
    #[allow(clippy::unwrap_used)]
    Url::parse(DUMMY_BASE).unwrap()
}

/// Request headers the agent strips before `fetch`ing the upstream origin (§6).
pub fn sanitize_request_headers(headers: &serde_json::Map<String, serde_json::Value>) -> serde_json::Map<String, serde_json::Value> {
    headers
        .iter()
        .filter(|(key, _)| !STRIPPED_REQUEST_HEADERS.contains(&key.to_ascii_lowercase().as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Response headers the server drops when relaying an agent response to the HTTP client (§6).
pub fn sanitize_response_headers(headers: &serde_json::Map<String, serde_json::Value>) -> serde_json::Map<String, serde_json::Value> {
    headers
        .iter()
        .filter(|(key, _)| {
            let lower = key.to_ascii_lowercase();
            !STRIPPED_RESPONSE_HEADERS.contains(&lower.as_str())
                && !STRIPPED_RESPONSE_HEADER_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn proxy_host_param_is_extracted_and_stripped() {
        let (cleaned, host) = resolve_target_host("/v1beta/models/x:generateContent?__proxy_host__=googleapis.com", "default.example");
        assert_eq!(cleaned, "/v1beta/models/x:generateContent");
        assert_eq!(host, "googleapis.com");
    }

    #[test]
    fn absent_proxy_host_param_falls_back_to_default() {
        let (cleaned, host) = resolve_target_host("/v1beta/models/x:generateContent", "default.example");
        assert_eq!(cleaned, "/v1beta/models/x:generateContent");
        assert_eq!(host, "default.example");
    }

    #[test]
    fn other_query_params_survive_the_strip() {
        let (cleaned, host) = resolve_target_host("/foo?alt=sse&__proxy_host__=googleapis.com", "default.example");
        assert_eq!(cleaned, "/foo?alt=sse");
        assert_eq!(host, "googleapis.com");
    }

    #[test]
    fn location_header_round_trips_through_proxy_host_hint() {
        let rewritten = rewrite_upstream_location("https://googleapis.com/foo", "gateway.example", "https").unwrap();
        assert!(rewritten.starts_with("https://gateway.example/foo"));
        assert!(rewritten.contains("__proxy_host__=googleapis.com"));

        let (path_and_query, host) = {
            let url = Url::parse(&rewritten).unwrap();
            (format!("{}?{}", url.path(), url.query().unwrap_or_default()), "gateway.example".to_string())
        };
        let (_, resolved_host) = resolve_target_host(&path_and_query, &host);
        assert_eq!(resolved_host, "googleapis.com");
    }

    #[test]
    fn location_already_at_own_authority_is_left_alone() {
        assert!(rewrite_upstream_location("https://gateway.example/foo", "gateway.example", "https").is_none());
    }

    #[test]
    fn request_header_sanitation_drops_stripped_set() {
        let headers = serde_json::Map::from_iter([
            ("Host".to_string(), json!("upstream.example")),
            ("Content-Type".to_string(), json!("application/json")),
        ]);
        let sanitized = sanitize_request_headers(&headers);
        assert!(!sanitized.contains_key("Host"));
        assert!(sanitized.contains_key("Content-Type"));
    }

    #[test]
    fn response_header_sanitation_drops_cors_and_content_length() {
        let headers = serde_json::Map::from_iter([
            ("access-control-allow-origin".to_string(), json!("*")),
            ("content-length".to_string(), json!("123")),
            ("content-type".to_string(), json!("application/json")),
        ]);
        let sanitized = sanitize_response_headers(&headers);
        assert_eq!(sanitized.len(), 1);
        assert!(sanitized.contains_key("content-type"));
    }
}

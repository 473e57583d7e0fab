pub mod bypass;
pub mod health;
pub mod metrics;
pub mod mx;
pub mod playlist;
pub mod segment;
pub mod select;
pub mod stream;

use crate::error::{ProxyError, Result};
use axum::response::{IntoResponse, Response};
use std::time::Instant;

/// Extract the upstream URL from a raw query string.
///
/// A raw `url=http...` as the first parameter takes the rest of the query
/// verbatim, so unencoded upstream tokens containing `&` survive. Anything
/// else goes through regular form decoding.
pub fn source_param(raw_query: Option<&str>) -> Option<String> {
    let query = raw_query?;

    if let Some(rest) = query.strip_prefix("url=")
        && (rest.starts_with("http://") || rest.starts_with("https://"))
    {
        return Some(rest.to_string());
    }

    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Record request metrics for a finished handler, success or not.
pub(crate) fn finish(handler: &'static str, start: Instant, result: Result<Response>) -> Response {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            if matches!(
                e,
                ProxyError::UpstreamError { .. } | ProxyError::UpstreamUnreachable { .. }
            ) {
                crate::metrics::record_upstream_error(e.kind());
            }
            e.into_response()
        }
    };
    crate::metrics::record_request(handler, response.status().as_u16());
    crate::metrics::record_duration(handler, start);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_url_swallows_rest_of_query() {
        let query = "url=https://cdn.example.com/live.m3u8?token=abc&expires=123";
        assert_eq!(
            source_param(Some(query)).as_deref(),
            Some("https://cdn.example.com/live.m3u8?token=abc&expires=123")
        );
    }

    #[test]
    fn encoded_url_is_decoded() {
        let query = "foo=1&url=https%3A%2F%2Fcdn.example.com%2Flive.m3u8%3Ftoken%3Dabc%26e%3D1";
        assert_eq!(
            source_param(Some(query)).as_deref(),
            Some("https://cdn.example.com/live.m3u8?token=abc&e=1")
        );
    }

    #[test]
    fn missing_or_empty_url() {
        assert_eq!(source_param(None), None);
        assert_eq!(source_param(Some("")), None);
        assert_eq!(source_param(Some("url=")), None);
        assert_eq!(source_param(Some("other=1")), None);
    }
}

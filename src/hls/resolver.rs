//! Upstream URL resolution for playlist references.
//!
//! Relative references are joined against the playlist's directory (RFC 3986,
//! dot segments removed). The playlist's query string is kept as an opaque
//! token and re-attached to every resolved URL that has no query of its own,
//! which keeps token-gated origins serving segments to the relay.

use crate::error::{ProxyError, Result};
use url::Url;

/// Resolves playlist references against one playlist URL.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlResolver {
    /// Playlist URL with query and fragment stripped
    base: Url,
    /// Entire query string of the playlist URL, without the leading `?`
    token: Option<String>,
}

impl UrlResolver {
    /// Build a resolver from a full playlist URL; its query becomes the token.
    pub fn from_playlist_url(playlist_url: &str) -> Result<Self> {
        let mut base = parse_base(playlist_url)?;
        let token = base
            .query()
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self { base, token })
    }

    /// Build a resolver from a stored base URL and token.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let mut base = parse_base(base_url)?;
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self {
            base,
            token: token.filter(|t| !t.is_empty()).map(str::to_string),
        })
    }

    /// Use `token` when the playlist URL itself carried none.
    ///
    /// Redirected playlists often land on a token-less URL; the session's
    /// original token still has to ride along on segment requests.
    pub fn with_fallback_token(mut self, token: Option<&str>) -> Self {
        if self.token.is_none() {
            self.token = token.filter(|t| !t.is_empty()).map(str::to_string);
        }
        self
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Compute the absolute upstream URL for `reference`.
    ///
    /// Absolute references come back unchanged apart from token injection.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        let reference = reference.trim();

        if is_absolute(reference) {
            return Ok(self.inject_token(reference.to_string()));
        }

        let joined = self.base.join(reference).map_err(|e| {
            ProxyError::InvalidSource(format!(
                "cannot resolve '{}' against {}: {}",
                reference, self.base, e
            ))
        })?;

        Ok(self.inject_token(joined.into()))
    }

    fn inject_token(&self, url: String) -> String {
        let Some(token) = self.token.as_deref() else {
            return url;
        };

        let (head, fragment) = match url.split_once('#') {
            Some((head, fragment)) => (head, Some(fragment)),
            None => (url.as_str(), None),
        };

        // Upstream-supplied queries win over the stored token
        if head.contains('?') {
            return url;
        }

        let mut out = String::with_capacity(url.len() + token.len() + 1);
        out.push_str(head);
        out.push('?');
        out.push_str(token);
        if let Some(fragment) = fragment {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

/// Resolve `reference` against the playlist at `base_url`.
///
/// Convenience wrapper over [`UrlResolver::from_playlist_url`].
pub fn resolve(base_url: &str, reference: &str) -> Result<String> {
    UrlResolver::from_playlist_url(base_url)?.resolve(reference)
}

fn parse_base(url: &str) -> Result<Url> {
    let parsed = Url::parse(url)
        .map_err(|e| ProxyError::InvalidSource(format!("{}: {}", url, e)))?;
    if parsed.cannot_be_a_base() {
        return Err(ProxyError::InvalidSource(format!(
            "{} cannot be used as a base URL",
            url
        )));
    }
    Ok(parsed)
}

fn is_absolute(reference: &str) -> bool {
    Url::parse(reference).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKENIZED: &str = "https://host/path/live.m3u8?tok=abc";

    #[test]
    fn relative_segment_gets_directory_and_token() {
        assert_eq!(
            resolve(TOKENIZED, "seg1.ts").unwrap(),
            "https://host/path/seg1.ts?tok=abc"
        );
        assert_eq!(
            resolve(TOKENIZED, "seg2.ts").unwrap(),
            "https://host/path/seg2.ts?tok=abc"
        );
    }

    #[test]
    fn absolute_reference_unchanged_without_token() {
        let url = "https://cdn.other.net/a/b/seg.ts";
        assert_eq!(
            resolve("https://host/path/live.m3u8", url).unwrap(),
            url
        );
    }

    #[test]
    fn absolute_reference_gets_token_when_query_missing() {
        assert_eq!(
            resolve(TOKENIZED, "https://cdn.other.net/seg.ts").unwrap(),
            "https://cdn.other.net/seg.ts?tok=abc"
        );
    }

    #[test]
    fn absolute_reference_is_not_normalized() {
        // Exact text is kept; only the token is appended
        let url = "HTTPS://CDN.Example.com/a/./seg.ts";
        assert_eq!(
            resolve("https://host/live.m3u8", url).unwrap(),
            url
        );
    }

    #[test]
    fn reference_query_is_never_overwritten() {
        assert_eq!(
            resolve(TOKENIZED, "seg1.ts?sig=zzz").unwrap(),
            "https://host/path/seg1.ts?sig=zzz"
        );
        assert_eq!(
            resolve(TOKENIZED, "https://cdn.other.net/seg.ts?sig=zzz").unwrap(),
            "https://cdn.other.net/seg.ts?sig=zzz"
        );
    }

    #[test]
    fn dot_segments_are_normalized() {
        let resolved = resolve(TOKENIZED, "../other/./deeper/../seg.ts").unwrap();
        assert_eq!(resolved, "https://host/other/seg.ts?tok=abc");

        let path = Url::parse(&resolved).unwrap().path().to_string();
        assert!(!path.split('/').any(|s| s == "." || s == ".."));
    }

    #[test]
    fn root_and_scheme_relative_references() {
        assert_eq!(
            resolve(TOKENIZED, "/hls/seg.ts").unwrap(),
            "https://host/hls/seg.ts?tok=abc"
        );
        assert_eq!(
            resolve(TOKENIZED, "//edge.example.net/seg.ts").unwrap(),
            "https://edge.example.net/seg.ts?tok=abc"
        );
    }

    #[test]
    fn whole_query_string_is_the_token() {
        let r = UrlResolver::from_playlist_url(
            "https://host/live/index.m3u8?token=x1&expires=99&sig=ab%2Fc",
        )
        .unwrap();
        assert_eq!(r.token(), Some("token=x1&expires=99&sig=ab%2Fc"));
        assert_eq!(r.base_url(), "https://host/live/index.m3u8");
        assert_eq!(
            r.resolve("chunk_001.ts").unwrap(),
            "https://host/live/chunk_001.ts?token=x1&expires=99&sig=ab%2Fc"
        );
    }

    #[test]
    fn fragment_stays_after_injected_token() {
        assert_eq!(
            resolve(TOKENIZED, "seg.ts#t=10").unwrap(),
            "https://host/path/seg.ts?tok=abc#t=10"
        );
    }

    #[test]
    fn fallback_token_only_fills_gaps() {
        let r = UrlResolver::from_playlist_url("https://redirected.example.com/a/live.m3u8")
            .unwrap()
            .with_fallback_token(Some("tok=orig"));
        assert_eq!(
            r.resolve("seg.ts").unwrap(),
            "https://redirected.example.com/a/seg.ts?tok=orig"
        );

        let r = UrlResolver::from_playlist_url(TOKENIZED)
            .unwrap()
            .with_fallback_token(Some("tok=orig"));
        assert_eq!(r.token(), Some("tok=abc"));
    }

    #[test]
    fn stored_base_and_token_round_trip() {
        let r = UrlResolver::new("https://host/path/live.m3u8", Some("tok=abc")).unwrap();
        assert_eq!(r, UrlResolver::from_playlist_url(TOKENIZED).unwrap());
    }

    #[test]
    fn invalid_base_is_rejected() {
        assert!(matches!(
            resolve("not a url", "seg.ts"),
            Err(ProxyError::InvalidSource(_))
        ));
        assert!(matches!(
            resolve("mailto:someone@example.com", "seg.ts"),
            Err(ProxyError::InvalidSource(_))
        ));
    }
}

//! Opaque proxy references.
//!
//! A reference is the URL-safe base64 form of the absolute upstream URL plus
//! a file extension hint (`.m3u8` for sub-playlists, the segment's own short
//! extension otherwise). The relay recovers the upstream URL from the
//! reference alone, so segment requests that arrive after the playlist has
//! moved on still resolve.

use crate::error::{ProxyError, Result};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use url::Url;

/// Extension used when a segment URL has no usable one.
const DEFAULT_SEGMENT_EXT: &str = "ts";

/// Longest extension copied from an upstream segment path.
const MAX_EXT_LEN: usize = 5;

/// What an absolute playlist reference points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    /// Variant / sub-playlist (`.m3u8`)
    Playlist,
    /// Media segment, typically `.ts`
    Segment,
}

impl UriKind {
    /// Classify by path suffix, ignoring query and fragment.
    pub fn of(url: &str) -> Self {
        if path_of(url).to_ascii_lowercase().ends_with(".m3u8") {
            UriKind::Playlist
        } else {
            UriKind::Segment
        }
    }

    /// Content-Type served for this kind.
    pub fn content_type(&self) -> &'static str {
        match self {
            UriKind::Playlist => "application/vnd.apple.mpegurl",
            UriKind::Segment => "video/mp2t",
        }
    }
}

/// Encode an absolute upstream URL as an opaque reference.
pub fn encode(absolute_url: &str, kind: UriKind) -> String {
    let ext = match kind {
        UriKind::Playlist => "m3u8".to_string(),
        UriKind::Segment => segment_extension(absolute_url),
    };
    format!("{}.{}", URL_SAFE_NO_PAD.encode(absolute_url), ext)
}

/// Recover the absolute upstream URL from a reference.
pub fn decode(reference: &str) -> Result<String> {
    let encoded = reference
        .split_once('.')
        .map(|(encoded, _)| encoded)
        .unwrap_or(reference);

    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ProxyError::InvalidSource(format!("undecodable reference: {}", e)))?;
    let url = String::from_utf8(bytes)
        .map_err(|_| ProxyError::InvalidSource("reference is not UTF-8".to_string()))?;

    match Url::parse(&url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(url),
        _ => Err(ProxyError::InvalidSource(format!(
            "reference does not name an http(s) URL: {}",
            url
        ))),
    }
}

/// Build the proxy URI for `absolute_url` inside `session_id`.
///
/// `proxy_base` is empty for root-relative URIs, or an external origin such
/// as `https://relay.example.com` (no trailing slash).
pub fn proxy_uri(proxy_base: &str, session_id: &str, absolute_url: &str, kind: UriKind) -> String {
    format!(
        "{}/segment/{}/{}",
        proxy_base.trim_end_matches('/'),
        session_id,
        encode(absolute_url, kind)
    )
}

fn path_of(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

fn segment_extension(url: &str) -> String {
    let path = path_of(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXT_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => DEFAULT_SEGMENT_EXT.to_string(),
    }
}

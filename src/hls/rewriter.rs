//! Line-oriented M3U8 rewriting.
//!
//! Playlists are rewritten line by line instead of parse-and-serialize so
//! that every directive, comment and blank line survives byte-for-byte
//! (byte ranges, keys and durations are position-sensitive). Only URI lines
//! change: each becomes a proxy URI under the owning session.

use super::reference::{self, UriKind};
use super::resolver::UrlResolver;
use crate::error::ProxyError;
use m3u8_rs::{Playlist, parse_playlist_res};
use tracing::{debug, warn};

/// One line of playlist text, without its line ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistLine<'a> {
    /// `#EXTM3U`, `#EXTINF`, `#EXT-X-*`
    Directive(&'a str),
    /// Any other `#` line
    Comment(&'a str),
    /// Empty or whitespace-only
    Blank(&'a str),
    /// Segment or sub-playlist reference
    Uri(&'a str),
}

impl<'a> PlaylistLine<'a> {
    pub fn classify(content: &'a str) -> Self {
        let trimmed = content.trim_start_matches('\u{feff}').trim();
        if trimmed.is_empty() {
            PlaylistLine::Blank(content)
        } else if trimmed.starts_with("#EXT") {
            PlaylistLine::Directive(content)
        } else if trimmed.starts_with('#') {
            PlaylistLine::Comment(content)
        } else {
            PlaylistLine::Uri(content)
        }
    }

    /// Original text of the line.
    pub fn raw(&self) -> &'a str {
        match self {
            PlaylistLine::Directive(s)
            | PlaylistLine::Comment(s)
            | PlaylistLine::Blank(s)
            | PlaylistLine::Uri(s) => s,
        }
    }
}

/// Split playlist text into classified lines, each paired with its exact
/// line ending (`"\n"`, `"\r\n"` or `""` for an unterminated last line).
pub fn split_lines(text: &str) -> impl Iterator<Item = (PlaylistLine<'_>, &str)> {
    text.split_inclusive('\n').map(|chunk| {
        let content = chunk
            .strip_suffix("\r\n")
            .or_else(|| chunk.strip_suffix('\n'))
            .unwrap_or(chunk);
        let ending = &chunk[content.len()..];
        (PlaylistLine::classify(content), ending)
    })
}

/// Playlist flavour as reported by `m3u8-rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Master,
    Media,
    /// Failed structural validation
    Unknown,
}

impl PlaylistKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistKind::Master => "master",
            PlaylistKind::Media => "media",
            PlaylistKind::Unknown => "unknown",
        }
    }
}

/// Structural check of upstream playlist text.
///
/// # Errors
/// [`ProxyError::MalformedPlaylist`] when the `#EXTM3U` header is missing or
/// `m3u8-rs` rejects the text. Callers treat this as non-fatal.
pub fn validate(text: &str) -> Result<PlaylistKind, ProxyError> {
    if !text
        .trim_start_matches('\u{feff}')
        .trim_start()
        .starts_with("#EXTM3U")
    {
        return Err(ProxyError::MalformedPlaylist(
            "missing #EXTM3U header".to_string(),
        ));
    }

    match parse_playlist_res(text.as_bytes()) {
        Ok(Playlist::MasterPlaylist(_)) => Ok(PlaylistKind::Master),
        Ok(Playlist::MediaPlaylist(_)) => Ok(PlaylistKind::Media),
        Err(e) => Err(ProxyError::MalformedPlaylist(format!("{:?}", e))),
    }
}

/// Result of rewriting one playlist.
#[derive(Debug, Clone)]
pub struct Rewritten {
    /// Playlist text with every URI line replaced by a proxy URI
    pub body: String,
    /// Absolute upstream URLs, in playlist order
    pub referenced: Vec<String>,
    pub kind: PlaylistKind,
    /// Input failed validation and was rewritten best-effort
    pub malformed: bool,
}

/// Rewrite every URI line of `text` into a proxy URI owned by `session_id`.
///
/// `resolver` is built from the playlist's own URL; `proxy_base` is the
/// prefix for emitted URIs (empty for root-relative).
pub fn rewrite(
    session_id: &str,
    resolver: &UrlResolver,
    text: &str,
    proxy_base: &str,
) -> Rewritten {
    let (kind, malformed) = match validate(text) {
        Ok(kind) => (kind, false),
        Err(e) => {
            warn!(
                "{} (session {}, base {}); rewriting best-effort",
                e,
                session_id,
                resolver.base_url()
            );
            (PlaylistKind::Unknown, true)
        }
    };

    let mut body = String::with_capacity(text.len() * 2);
    let mut referenced = Vec::new();

    for (line, ending) in split_lines(text) {
        match line {
            PlaylistLine::Uri(raw) => match resolver.resolve(raw) {
                Ok(absolute) => {
                    let uri_kind = UriKind::of(&absolute);
                    body.push_str(&reference::proxy_uri(
                        proxy_base, session_id, &absolute, uri_kind,
                    ));
                    referenced.push(absolute);
                }
                Err(e) => {
                    warn!("Leaving unresolvable URI line untouched: {}", e);
                    body.push_str(raw);
                }
            },
            other => body.push_str(other.raw()),
        }
        body.push_str(ending);
    }

    debug!(
        "Rewrote {} playlist for session {}: {} URIs",
        kind.as_str(),
        session_id,
        referenced.len()
    );

    Rewritten {
        body,
        referenced,
        kind,
        malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://host/path/live.m3u8?tok=abc";

    const MEDIA_PLAYLIST: &str = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:120
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x1234
#EXTINF:10.0,
seg120.ts
# plain comment

#EXT-X-BYTERANGE:1000@0
#EXTINF:10.0,
https://cdn.other.net/seg121.ts
#EXTINF:10.0,
../alt/seg122.ts?sig=q
#EXT-X-ENDLIST
";

    const MASTER_PLAYLIST: &str = "\
#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720
720p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=640000,RESOLUTION=640x360
360p/index.m3u8?variant=low
";

    fn resolver() -> UrlResolver {
        UrlResolver::from_playlist_url(BASE).unwrap()
    }

    fn uri_lines(body: &str) -> Vec<&str> {
        body.lines().filter(|l| l.starts_with("/segment/")).collect()
    }

    fn deref(proxy: &str) -> String {
        let reference = proxy.rsplit('/').next().unwrap();
        reference::decode(reference).unwrap()
    }

    #[test]
    fn minimal_scenario_dereferences_with_token() {
        let text = "#EXTM3U\n#EXT-X-VERSION:3\nseg1.ts\nseg2.ts\n";
        let out = rewrite("sess1", &resolver(), text, "");

        let lines: Vec<&str> = out.body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert!(lines[2].starts_with("/segment/sess1/"));
        assert!(lines[3].starts_with("/segment/sess1/"));
        assert_eq!(deref(lines[2]), "https://host/path/seg1.ts?tok=abc");
        assert_eq!(deref(lines[3]), "https://host/path/seg2.ts?tok=abc");
        assert_eq!(
            out.referenced,
            vec![
                "https://host/path/seg1.ts?tok=abc".to_string(),
                "https://host/path/seg2.ts?tok=abc".to_string(),
            ]
        );
        assert!(out.body.ends_with('\n'));
    }

    #[test]
    fn non_uri_lines_are_byte_identical() {
        let out = rewrite("s", &resolver(), MEDIA_PLAYLIST, "");

        let input: Vec<&str> = MEDIA_PLAYLIST.split('\n').collect();
        let output: Vec<&str> = out.body.split('\n').collect();
        assert_eq!(input.len(), output.len(), "line count must be preserved");

        for (before, after) in input.iter().zip(&output) {
            match PlaylistLine::classify(before) {
                PlaylistLine::Uri(_) => assert_ne!(before, after),
                _ => assert_eq!(before, after),
            }
        }
    }

    #[test]
    fn uri_order_is_preserved() {
        let out = rewrite("s", &resolver(), MEDIA_PLAYLIST, "");
        let derefs: Vec<String> = uri_lines(&out.body).into_iter().map(deref).collect();
        assert_eq!(
            derefs,
            vec![
                "https://host/path/seg120.ts?tok=abc",
                "https://cdn.other.net/seg121.ts?tok=abc",
                "https://host/alt/seg122.ts?sig=q",
            ]
        );
        assert_eq!(derefs, out.referenced);
    }

    #[test]
    fn crlf_endings_survive() {
        let text = "#EXTM3U\r\n#EXTINF:4.0,\r\nseg1.ts\r\n#EXT-X-ENDLIST";
        let out = rewrite("s", &resolver(), text, "");

        let chunks: Vec<&str> = out.body.split_inclusive('\n').collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], "#EXTM3U\r\n");
        assert_eq!(chunks[1], "#EXTINF:4.0,\r\n");
        assert!(chunks[2].ends_with("\r\n"));
        assert_eq!(chunks[3], "#EXT-X-ENDLIST");
    }

    #[test]
    fn master_playlist_variants_become_playlist_references() {
        let out = rewrite("s", &resolver(), MASTER_PLAYLIST, "");
        assert_eq!(out.kind, PlaylistKind::Master);
        assert!(!out.malformed);

        let uris = uri_lines(&out.body);
        assert_eq!(uris.len(), 2);
        assert!(uris.iter().all(|u| u.ends_with(".m3u8")));
        assert_eq!(deref(uris[0]), "https://host/path/720p/index.m3u8?tok=abc");
        assert_eq!(deref(uris[1]), "https://host/path/360p/index.m3u8?variant=low");
    }

    #[test]
    fn media_playlist_is_recognised() {
        let text = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXTINF:10.0,
seg0.ts
#EXTINF:10.0,
seg1.ts
#EXT-X-ENDLIST
";
        let out = rewrite("s", &resolver(), text, "");
        assert_eq!(out.kind, PlaylistKind::Media);
        assert!(!out.malformed);
    }

    #[test]
    fn headerless_playlist_is_rewritten_best_effort() {
        let text = "#EXTINF:10,\nseg1.ts\n";
        let out = rewrite("s", &resolver(), text, "");
        assert!(out.malformed);
        assert_eq!(out.kind, PlaylistKind::Unknown);
        assert_eq!(out.referenced, vec!["https://host/path/seg1.ts?tok=abc"]);
        assert!(out.body.starts_with("#EXTINF:10,\n/segment/s/"));
    }

    #[test]
    fn proxy_base_prefixes_uris() {
        let text = "#EXTM3U\nseg1.ts\n";
        let out = rewrite("s", &resolver(), text, "https://relay.example.com");
        assert!(
            out.body
                .lines()
                .nth(1)
                .unwrap()
                .starts_with("https://relay.example.com/segment/s/")
        );
    }

    #[test]
    fn classify_line_kinds() {
        assert_eq!(PlaylistLine::classify("#EXTM3U"), PlaylistLine::Directive("#EXTM3U"));
        assert_eq!(
            PlaylistLine::classify("\u{feff}#EXTM3U"),
            PlaylistLine::Directive("\u{feff}#EXTM3U")
        );
        assert_eq!(PlaylistLine::classify("# note"), PlaylistLine::Comment("# note"));
        assert_eq!(PlaylistLine::classify("   "), PlaylistLine::Blank("   "));
        assert_eq!(PlaylistLine::classify("a.ts"), PlaylistLine::Uri("a.ts"));
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let out = rewrite("s", &resolver(), "", "");
        assert!(out.body.is_empty());
        assert!(out.referenced.is_empty());
        assert!(out.malformed);
    }
}

//! Upstream request profiles.
//!
//! Some origins only serve playlists to requests that look like they come
//! from their own web player. A profile decides the User-Agent, Accept and
//! Referer headers sent upstream for every request made on behalf of a
//! session.

use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue, ORIGIN, PRAGMA,
    REFERER, USER_AGENT,
};
use tracing::warn;
use url::Url;

/// Mobile Chrome, accepted by most referer/UA-locked origins.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 11; SM-G973F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

/// MX Player's own User-Agent.
pub const MX_PLAYER_USER_AGENT: &str = "MXPlayer/1.46.15 (Android)";

/// Origins that only answer requests made from one embedding page.
struct EmbedRule {
    /// Matched against the source host
    host_marker: &'static str,
    user_agent: &'static str,
    referer: &'static str,
    origin: &'static str,
}

const TVNATION_UA: &str = "Mozilla/5.0 (Linux; Android 11; Infinix X657B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.7151.89 Mobile Safari/537.36";

const EMBED_RULES: &[EmbedRule] = &[
    EmbedRule {
        host_marker: "elderflower",
        user_agent: TVNATION_UA,
        referer: "http://www.tvnation.me/flix.php?url=kxrOyaORnebzor2",
        origin: "http://www.tvnation.me",
    },
    EmbedRule {
        host_marker: "radon",
        user_agent: TVNATION_UA,
        referer: "http://www.tvnation.me/flix.php?url=kxrOyaORnebzor2",
        origin: "http://www.tvnation.me",
    },
];

fn embed_rule(source: Option<&Url>) -> Option<&'static EmbedRule> {
    let host = source?.host_str()?.to_ascii_lowercase();
    EMBED_RULES
        .iter()
        .find(|rule| host.contains(rule.host_marker))
}

const HLS_ACCEPT: &str = "application/x-mpegURL,application/vnd.apple.mpegurl,video/mp2t,*/*";
const MX_ACCEPT: &str = "application/x-mpegURL,video/*,*/*";

/// Which kind of client the relay impersonates upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientProfile {
    /// Browser / generic HLS player
    Browser,
    /// MX Player tuned requests
    MxPlayer,
}

impl ClientProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientProfile::Browser => "browser",
            ClientProfile::MxPlayer => "mx",
        }
    }

    /// Pick the profile for a downstream client by its User-Agent.
    pub fn for_client(user_agent: Option<&str>) -> Self {
        match user_agent {
            Some(ua) if ua.contains("MX Player") || ua.contains("MXPlayer") => {
                ClientProfile::MxPlayer
            }
            _ => ClientProfile::Browser,
        }
    }
}

/// Operator overrides applied on top of every profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderOverrides {
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

/// Build the upstream header set for `profile` talking to `source_url`.
///
/// Tokenized sources get the origin as Referer/Origin, which is what
/// domain-locked CDNs check before honouring the token. Hosts with a known
/// embedding page get that page's Referer/Origin instead.
pub fn upstream_headers(
    profile: ClientProfile,
    source_url: &str,
    overrides: &HeaderOverrides,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let parsed = Url::parse(source_url).ok();
    let tokenized = parsed
        .as_ref()
        .and_then(|u| u.query())
        .is_some_and(|q| !q.is_empty());

    match profile {
        ClientProfile::Browser => {
            let rule = embed_rule(parsed.as_ref());
            let user_agent = rule.map_or(BROWSER_USER_AGENT, |rule| rule.user_agent);
            insert(&mut headers, USER_AGENT, user_agent);
            insert(&mut headers, ACCEPT, HLS_ACCEPT);
            insert(&mut headers, ACCEPT_LANGUAGE, "en-US,en;q=0.9");
            if let Some(rule) = rule {
                insert(&mut headers, CACHE_CONTROL, "no-cache");
                insert(&mut headers, REFERER, rule.referer);
                insert(&mut headers, ORIGIN, rule.origin);
            } else if tokenized {
                insert(&mut headers, CACHE_CONTROL, "no-cache");
                insert(&mut headers, PRAGMA, "no-cache");
                insert(&mut headers, HeaderName::from_static("sec-fetch-dest"), "video");
                insert(&mut headers, HeaderName::from_static("sec-fetch-mode"), "cors");
                insert(&mut headers, HeaderName::from_static("sec-fetch-site"), "cross-site");
                if let Some(origin) = parsed.as_ref().map(origin_of) {
                    insert(&mut headers, REFERER, &format!("{}/", origin));
                    insert(&mut headers, ORIGIN, &origin);
                }
            } else {
                insert(&mut headers, CACHE_CONTROL, "max-age=0");
            }
        }
        ClientProfile::MxPlayer => {
            insert(&mut headers, USER_AGENT, MX_PLAYER_USER_AGENT);
            insert(&mut headers, ACCEPT, MX_ACCEPT);
            insert(&mut headers, ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        }
    }

    if let Some(ua) = &overrides.user_agent {
        insert(&mut headers, USER_AGENT, ua);
    }
    if let Some(referer) = &overrides.referer {
        insert(&mut headers, REFERER, referer);
    }

    headers
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => warn!("Skipping invalid upstream header value for {}", name),
    }
}

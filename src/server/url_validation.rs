use crate::error::ProxyError;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Check that an upstream URL may be fetched on a client's behalf.
///
/// Source URLs from `?url=` / `POST /select` and URLs decoded from proxy
/// references both pass through here before any request is made.
///
/// **IP literals** in private or reserved ranges are refused unless
/// `allow_private` is set (dev mode, local test origins).
/// **Hostnames** are accepted without DNS resolution, so a public name
/// pointing at a private address still gets through.
///
/// # Errors
/// Returns [`ProxyError::InvalidSource`] for:
/// - Invalid or relative URLs
/// - Non-HTTP(S) schemes
/// - URLs without a host
/// - Private/reserved IP literals when `allow_private` is false
pub fn validate_source_url(url: &str, allow_private: bool) -> Result<(), ProxyError> {
    let parsed =
        Url::parse(url).map_err(|_| ProxyError::InvalidSource(format!("not a URL: {url}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ProxyError::InvalidSource(format!(
                "scheme '{scheme}' not supported, use http or https"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| ProxyError::InvalidSource(format!("no host in {url}")))?;

    if allow_private {
        return Ok(());
    }

    match host {
        Host::Ipv4(ip) if is_blocked_ipv4(ip) => Err(ProxyError::InvalidSource(format!(
            "private or reserved address not allowed: {ip}"
        ))),
        Host::Ipv6(ip) if is_blocked_ipv6(ip) => Err(ProxyError::InvalidSource(format!(
            "private or reserved address not allowed: {ip}"
        ))),
        Host::Domain(domain) if domain.eq_ignore_ascii_case("localhost") => Err(
            ProxyError::InvalidSource("localhost upstreams not allowed".to_string()),
        ),
        _ => Ok(()),
    }
}

/// Blocked IPv4 ranges:
/// - `0.0.0.0/8`      "this" network
/// - `10.0.0.0/8`     RFC 1918
/// - `127.0.0.0/8`    loopback
/// - `169.254.0.0/16` link-local / cloud metadata
/// - `172.16.0.0/12`  RFC 1918
/// - `192.168.0.0/16` RFC 1918
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();

    a == 0
        || a == 10
        || a == 127
        || (a == 169 && b == 254)
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
}

/// Blocked IPv6 ranges: loopback, `fe80::/10` link-local, `fc00::/7`
/// unique-local, and IPv4-mapped addresses in a blocked IPv4 range.
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let s = ip.segments();

    ip.is_loopback() || (s[0] & 0xffc0) == 0xfe80 || (s[0] & 0xfe00) == 0xfc00
}

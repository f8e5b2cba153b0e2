// Helpers to strip hop-by-hop headers and add the Via header. Applied to requests sent
// upstream and to responses returned to the client.

use http::Version;
use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};

const PROXY_NAME: &str = "spac";

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

// Not standard, but sent by browsers that are configured to use a proxy
const PROXY_CONNECTION: &str = "proxy-connection";
const KEEP_ALIVE: &str = "keep-alive";

pub fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

/// Appends this proxy to the Via header.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let version_str = match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => {
            tracing::debug!(?version, "unknown HTTP version, skipping Via header");
            return;
        }
    };

    let via_value = format!("{version_str} {PROXY_NAME}");

    let combined = match headers.get(VIA).map(|v| v.to_str()) {
        Some(Ok(existing)) => format!("{existing}, {via_value}"),
        // Leave an unreadable Via header alone
        Some(Err(_)) => return,
        None => via_value,
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(VIA, value);
    }
}

/// Removes hop-by-hop headers from an HTTP/1.x message: the standard set, the
/// proxy-connection header, anything listed in Connection, and keep-alive.
///
/// HTTP/2 and HTTP/3 have no hop-by-hop headers, so nothing is removed for them.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !is_http1(version) {
        return headers;
    }

    let extra_drops: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }
    for name in extra_drops {
        headers.remove(&name);
    }
    headers.remove(PROXY_CONNECTION);
    headers.remove(KEEP_ALIVE);

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    #[test]
    fn test_filter_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, custom"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert("cusTOM", HeaderValue::from_static("some-value"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));

        let filtered = filter_hop_by_hop(&mut headers, Version::HTTP_11);

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get(CONTENT_TYPE).unwrap(), "text/html");
        assert!(filtered.get("custom").is_none());
        assert!(filtered.get("proxy-connection").is_none());
    }

    #[test]
    fn test_http2_headers_untouched() {
        let mut headers = HeaderMap::new();
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        assert_eq!(filter_hop_by_hop(&mut headers, Version::HTTP_2).len(), 1);
    }

    #[test]
    fn test_via_header() {
        let mut headers = HeaderMap::new();
        add_via_header(&mut headers, Version::HTTP_11);
        assert_eq!(headers[VIA], "1.1 spac");

        add_via_header(&mut headers, Version::HTTP_2);
        assert_eq!(headers[VIA], "1.1 spac, 2 spac");
    }
}

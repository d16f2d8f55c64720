use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Reasons a source URL is refused by [`validate_source_url`].
#[derive(Error, Debug)]
pub enum UrlPolicyError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("Private or loopback address not allowed: {0}")]
    PrivateHost(String),
}

/// Validates a feed URL before it is stored as a source.
///
/// Only `http` and `https` are accepted. Unless `allow_private_hosts` is set,
/// `localhost`, loopback, RFC 1918, link-local and unique-local addresses are
/// rejected so an admin typo cannot point the poller at internal services.
///
/// # Examples
///
/// ```
/// use media_monitor::util::validate_source_url;
///
/// assert!(validate_source_url("https://stratechery.com/feed/", false).is_ok());
/// assert!(validate_source_url("http://192.168.1.1/feed", false).is_err());
/// assert!(validate_source_url("http://127.0.0.1:8080/feed", true).is_ok());
/// assert!(validate_source_url("file:///etc/passwd", true).is_err());
/// ```
pub fn validate_source_url(url_str: &str, allow_private_hosts: bool) -> Result<Url, UrlPolicyError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlPolicyError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlPolicyError::MissingHost)?;
    if allow_private_hosts {
        return Ok(url);
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(UrlPolicyError::PrivateHost(host.to_owned()));
    }

    let bare = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_internal(&ip) {
            return Err(UrlPolicyError::PrivateHost(ip.to_string()));
        }
    }

    Ok(url)
}

fn is_internal(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // fc00::/7
                || (first & 0xffc0) == 0xfe80 // fe80::/10
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_feeds_accepted() {
        assert!(validate_source_url("https://a16z.com/feed/", false).is_ok());
        assert!(validate_source_url("http://feeds.megaphone.fm/allinpodcast", false).is_ok());
    }

    #[test]
    fn test_surrounding_whitespace_tolerated() {
        let url = validate_source_url("  https://digiday.com/feed/ ", false).unwrap();
        assert_eq!(url.host_str(), Some("digiday.com"));
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        assert!(matches!(
            validate_source_url("ftp://example.com/feed", false),
            Err(UrlPolicyError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_internal_hosts_rejected() {
        for url in [
            "http://localhost/feed",
            "http://127.0.0.1/feed",
            "http://10.0.0.1/feed",
            "http://172.16.0.1:3000/feed",
            "http://169.254.1.1/feed",
            "http://0.0.0.0/feed",
            "http://[::1]/feed",
            "http://[fe80::1]/feed",
            "http://[fd00::1]/feed",
        ] {
            assert!(
                matches!(validate_source_url(url, false), Err(UrlPolicyError::PrivateHost(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_private_hosts_allowed_when_configured() {
        assert!(validate_source_url("http://localhost:8080/feed", true).is_ok());
        assert!(validate_source_url("http://10.0.0.1/feed", true).is_ok());
    }
}

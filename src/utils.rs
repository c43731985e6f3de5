//! Seed list helpers.

use crate::error::Result;

use reqwest::Client;
use url::Url;

const KNOWN_SCHEMES: &[&str] = &["socks5h://", "socks5://", "socks4a://", "socks4://"];

/// Fetch a newline-delimited proxy list from a URL or a file path.
pub(crate) async fn fetch_endpoints_from_source(source: &str) -> Result<Vec<String>> {
    let content = if source.starts_with("http") {
        let client = Client::new();
        let response = client.get(source).send().await?.error_for_status()?;
        response.text().await?
    } else {
        tokio::fs::read_to_string(source).await?
    };
    Ok(parse_endpoint_list(&content))
}

/// Extract `host:port` endpoints from text, one per line.
///
/// Blank lines and `#` comments are skipped; SOCKS scheme prefixes are
/// stripped since the protocol is negotiated during validation anyway.
pub fn parse_endpoint_list(content: &str) -> Vec<String> {
    content.lines().filter_map(normalize_endpoint).collect()
}

/// Canonical `host:port` form of a candidate, or `None` if it is unusable.
pub fn normalize_endpoint(raw: &str) -> Option<String> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let bare = KNOWN_SCHEMES
        .iter()
        .find_map(|scheme| {
            line.get(..scheme.len())
                .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
                .map(|_| &line[scheme.len()..])
        })
        .unwrap_or(line)
        .trim_end_matches('/');

    // Url does the host validation for us, including bracketed IPv6.
    let parsed = Url::parse(&format!("socks5://{}", bare)).ok()?;
    if !parsed.username().is_empty() || parsed.path() != "" {
        return None;
    }
    let host = parsed.host_str()?;
    let port = parsed.port()?;
    if port == 0 {
        return None;
    }
    Some(format!("{}:{}", host, port))
}

//! Cache key derivation.
//!
//! # Responsibilities
//! - Normalize request URLs (host case, tracking parameters, query order)
//! - Fingerprint the request headers that participate in keying
//! - Produce the `{METHOD}_{hash12}` key used as the on-disk file stem
//! - Normalize hosts into on-disk domain directory names
//!
//! # Design Decisions
//! - Only `User-Agent` and `Accept-Language` feed the header fingerprint;
//!   any other header churn maps to the same key
//! - Query parameters are sorted by key with a stable sort, so repeated keys
//!   keep their relative order
//! - The domain name is independent of the cache key

use axum::http::{header, HeaderMap, Method};
use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters dropped before keying.
pub const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "ref"];

/// Any query parameter starting with this prefix is dropped before keying.
pub const TRACKING_PREFIX: &str = "utm_";

/// Length of the hex hash suffix in a cache key.
const HASH_LEN: usize = 12;

fn is_tracking_param(name: &str) -> bool {
    name.starts_with(TRACKING_PREFIX) || TRACKING_PARAMS.contains(&name)
}

/// Normalize a URL for keying.
///
/// Lower-cases the host, drops tracking parameters and the fragment, and
/// re-serializes the remaining query sorted by parameter name.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    if let Some(host) = url.host_str() {
        let lowered = host.to_ascii_lowercase();
        if lowered != host {
            // Special schemes already lower-case on parse; this only matters for
            // URLs assembled by hand.
            let _ = normalized.set_host(Some(&lowered));
        }
    }

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));

    if params.is_empty() {
        normalized.set_query(None);
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        normalized.set_query(Some(&query));
    }

    normalized.to_string()
}

/// SHA-256 fingerprint of the keying header subset, hex encoded.
pub fn header_fingerprint(headers: &HeaderMap) -> String {
    let user_agent = header_str(headers, header::USER_AGENT);
    let accept_language = header_str(headers, header::ACCEPT_LANGUAGE);

    let mut hasher = Sha256::new();
    hasher.update(user_agent.as_bytes());
    hasher.update(b"\n");
    hasher.update(accept_language.as_bytes());
    hex::encode(hasher.finalize())
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Generate the cache key for a request.
///
/// Identical method, semantically equal URL, and identical
/// `User-Agent`/`Accept-Language` always give the same key.
pub fn generate_key(method: &Method, url: &Url, headers: &HeaderMap) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(url).as_bytes());
    hasher.update(b"\n");
    hasher.update(header_fingerprint(headers).as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!(
        "{}_{}",
        method.as_str().to_ascii_uppercase(),
        &digest[..HASH_LEN]
    )
}

/// Normalize a host into its on-disk domain directory name.
///
/// `www.CalgaryHerald.com` becomes `calgaryherald-com`. Any port is dropped.
pub fn normalize_domain(host: &str) -> String {
    let host = strip_port(host).to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    host.replace('.', "-")
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals carry colons inside the brackets.
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

use axum::http::HeaderMap;
use std::net::IpAddr;

#[cfg(test)]
mod tests;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_QUERY_PARAM: &str = "api_key";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Client address header set by the CDN in front of the gateway
pub const CDN_CLIENT_IP_HEADER: &str = "cf-connecting-ip";

/// Extract the presented API key from a request.
///
/// Sources, first match wins:
/// 1. `x-api-key` header
/// 2. `api_key` query parameter
/// 3. `Authorization: Bearer <prefix>_...` where `<prefix>` is one of `prefixes`
///
/// Bearer tokens with any other shape are left for other authentication
/// schemes and do not count as a presented key.
pub fn extract_presented_key(
    headers: &HeaderMap,
    query: Option<&str>,
    prefixes: &[&str],
) -> Result<String, TokenError> {
    if let Some(value) = headers.get(API_KEY_HEADER) {
        let key = value.to_str().map_err(|_| TokenError::InvalidFormat)?.trim();
        if key.is_empty() {
            return Err(TokenError::Empty);
        }
        return Ok(key.to_string());
    }

    if let Some(key) = query.and_then(query_api_key) {
        if key.is_empty() {
            return Err(TokenError::Empty);
        }
        return Ok(key);
    }

    match extract_bearer_token(headers) {
        Ok(token) if has_key_prefix(&token, prefixes) => Ok(token),
        Ok(_) | Err(TokenError::Missing) | Err(TokenError::InvalidFormat) => {
            Err(TokenError::Missing)
        }
        Err(e) => Err(e),
    }
}

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Resolve the client address.
///
/// Order: first `x-forwarded-for` hop, `x-real-ip`, CDN client header,
/// then the transport-level peer address.
pub fn extract_client_ip(headers: &HeaderMap, remote: Option<IpAddr>) -> Option<String> {
    let forwarded = header_str(headers, FORWARDED_FOR_HEADER)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| header_str(headers, REAL_IP_HEADER))
        .or_else(|| header_str(headers, CDN_CLIENT_IP_HEADER))
        .map(normalize_ip)
        .or_else(|| remote.map(|ip| ip.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Canonical textual form when the value parses as an address
fn normalize_ip(raw: &str) -> String {
    raw.parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

fn query_api_key(query: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
    pairs
        .into_iter()
        .find(|(name, _)| name == API_KEY_QUERY_PARAM)
        .map(|(_, value)| value.trim().to_string())
}

fn has_key_prefix(token: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| {
        token
            .strip_prefix(prefix)
            .map_or(false, |rest| rest.starts_with('_'))
    })
}

/// Parse bearer token from Authorization header value
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    // Expect "Bearer <token>"
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(TokenError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();

    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Key extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// No key in any accepted location
    Missing,
    /// Header value is not valid text or not "Bearer <token>"
    InvalidFormat,
    /// Key location present but empty
    Empty,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "API key not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid API key encoding"),
            TokenError::Empty => write!(f, "API key is empty"),
        }
    }
}

impl std::error::Error for TokenError {}

//! Bearer-token parsing and constant-time verification for the hub's
//! `Authorization` header.
//!
//! Grounded on [`crate::security::ApiKeyValidator`]'s format-checking
//! idiom, generalized to HAPI's `token[:namespace]` encoding and
//! switched to a constant-time comparison so token length/prefix
//! differences can't leak through response timing.

use rand::Rng;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("missing Authorization header")]
    Missing,
    #[error("Authorization header is not a Bearer token")]
    NotBearer,
    #[error("token does not match the configured secret")]
    Mismatch,
}

/// A parsed `Authorization: Bearer <token>[:<namespace>]` header.
///
/// Namespace defaults to `"default"` when the client omits the
/// `:namespace` suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedBearer {
    pub token: String,
    pub namespace: String,
}

pub const DEFAULT_NAMESPACE: &str = "default";

/// Split a raw `Authorization` header value into token and namespace.
pub fn parse_bearer_header(header_value: &str) -> Result<ParsedBearer, TokenError> {
    let rest = header_value.strip_prefix("Bearer ").ok_or(TokenError::NotBearer)?;
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(TokenError::NotBearer);
    }
    match rest.split_once(':') {
        Some((token, namespace)) if !namespace.is_empty() => Ok(ParsedBearer {
            token: token.to_string(),
            namespace: namespace.to_string(),
        }),
        _ => Ok(ParsedBearer {
            token: rest.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }),
    }
}

/// Compare `candidate` against `expected` in constant time, independent
/// of where (or whether) the two strings differ.
pub fn tokens_match(candidate: &str, expected: &str) -> bool {
    candidate.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Verify the full `Authorization` header against the configured
/// secret, returning the parsed namespace on success.
pub fn verify_header(header_value: Option<&str>, expected_token: &str) -> Result<ParsedBearer, TokenError> {
    let header_value = header_value.ok_or(TokenError::Missing)?;
    let parsed = parse_bearer_header(header_value)?;
    if !tokens_match(&parsed.token, expected_token) {
        warn!("rejected request with mismatched bearer token");
        return Err(TokenError::Mismatch);
    }
    Ok(parsed)
}

/// Resolves the hub's bearer-token secret: the configured value wins,
/// then the `HAPI_CLI_API_TOKEN` environment variable, then a freshly
/// generated random token (logged once at startup so an operator
/// without a configured token can still authenticate the first CLI).
pub fn resolve_cli_api_token(configured: Option<&str>) -> String {
    if let Some(token) = configured.filter(|t| !t.is_empty()) {
        return token.to_string();
    }
    if let Ok(token) = std::env::var("HAPI_CLI_API_TOKEN") {
        if !token.is_empty() {
            return token;
        }
    }
    let generated = generate_token();
    info!("no cli_api_token configured — generated an ephemeral one for this run");
    generated
}

fn generate_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

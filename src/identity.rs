//! Resolving who is asking for a terminal.
//!
//! The relay never authenticates users itself. An explicit identity passed to
//! `/api/connect` wins; otherwise an [`IdentityProvider`] supplied at startup
//! is asked for the caller's name.

use axum::http::{HeaderMap, HeaderName};

use crate::error::{RelayError, RelayResult};

const MAX_IDENTITY_LEN: usize = 32;

pub trait IdentityProvider: Send + Sync {
    /// The username of the caller behind this request, if known.
    fn resolve(&self, headers: &HeaderMap) -> Option<String>;
}

/// Trusts a header set by an authenticating reverse proxy.
pub struct TrustedHeader {
    header: HeaderName,
}

impl TrustedHeader {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl IdentityProvider for TrustedHeader {
    fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Every caller is the user the server runs as.
pub struct ProcessOwner;

impl IdentityProvider for ProcessOwner {
    fn resolve(&self, _headers: &HeaderMap) -> Option<String> {
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

/// Rejects names that could be mistaken for options or paths when handed to
/// `su` or exported to the child environment.
pub fn validate_identity(identity: &str) -> RelayResult<()> {
    let valid = !identity.is_empty()
        && identity.len() <= MAX_IDENTITY_LEN
        && !identity.starts_with('-')
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RelayError::InvalidIdentity(identity.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn trusted_header_reads_configured_header() {
        let provider = TrustedHeader::new(HeaderName::from_static("x-remote-user"));
        let mut headers = HeaderMap::new();
        assert_eq!(provider.resolve(&headers), None);

        headers.insert("x-remote-user", HeaderValue::from_static(" alice "));
        assert_eq!(provider.resolve(&headers).as_deref(), Some("alice"));

        headers.insert("x-remote-user", HeaderValue::from_static(""));
        assert_eq!(provider.resolve(&headers), None);
    }

    #[test]
    fn identity_validation() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("first.last_2-x").is_ok());

        assert!(validate_identity("").is_err());
        assert!(validate_identity("-c").is_err());
        assert!(validate_identity("alice bob").is_err());
        assert!(validate_identity("../root").is_err());
        assert!(validate_identity(&"a".repeat(33)).is_err());
    }
}

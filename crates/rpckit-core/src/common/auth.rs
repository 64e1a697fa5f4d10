//! Bearer credential extraction from call metadata.

use crate::common::error::{AuthError, Result};
use tonic::metadata::MetadataMap;

/// Metadata key carrying the credentials.
pub const AUTH_HEADER: &str = "authorization";

/// The only accepted authorization scheme (case-insensitive).
pub const AUTH_SCHEME: &str = "bearer";

/// Returns the token from `authorization: bearer <token>`.
///
/// # Errors
///
/// - [`AuthError::MissingCredentials`] if the key is absent.
/// - [`AuthError::BadScheme`] if the value is not valid ASCII, uses another
///   scheme, or has nothing after the scheme.
pub fn bearer_token(metadata: &MetadataMap) -> Result<&str> {
    let value = metadata
        .get(AUTH_HEADER)
        .ok_or(AuthError::MissingCredentials)?
        .to_str()
        .map_err(|_| AuthError::BadScheme)?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case(AUTH_SCHEME) && !token.is_empty() => {
            Ok(token)
        }
        _ => Err(AuthError::BadScheme),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with(value: &'static str) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        metadata.insert(AUTH_HEADER, value.parse().unwrap());
        metadata
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(bearer_token(&metadata_with("bearer a.b.c")), Ok("a.b.c"));
        assert_eq!(bearer_token(&metadata_with("Bearer a.b.c")), Ok("a.b.c"));
    }

    #[test]
    fn missing_header() {
        assert_eq!(
            bearer_token(&MetadataMap::new()),
            Err(AuthError::MissingCredentials)
        );
    }

    #[test]
    fn wrong_scheme_or_empty_token() {
        for value in ["basic dXNlcjpwYXNz", "bearer", "bearer ", "a.b.c"] {
            assert_eq!(
                bearer_token(&metadata_with(value)),
                Err(AuthError::BadScheme),
                "{value}"
            );
        }
    }
}

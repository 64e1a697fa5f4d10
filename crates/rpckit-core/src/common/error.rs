//! Error types for identity extraction.
//!
//! This module defines [`AuthError`], which captures every way an inbound call
//! can fail to produce a tenant identity. It implements `From<AuthError>` for
//! `tonic::Status` so the authentication stage can surface any of them as a
//! uniform `Unauthenticated` failure that still carries the original message.
//!
//! ## Error Cases
//! - `MalformedToken`: The token is not three dot-delimited segments, its
//!   payload is not valid base64url, or the payload is not the expected JSON.
//! - `MissingClaim`: The token parsed but a required claim was empty.
//! - `MissingCredentials`: No `authorization` metadata was present.
//! - `BadScheme`: The `authorization` metadata did not use the `bearer` scheme.

use core::fmt;
use tonic::Status;

pub type Result<T> = core::result::Result<T, AuthError>;

/// A claim that every token-derived identity must carry.
///
/// Variants are declared in the order they are validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Claim {
    Subject,
    Scopes,
    Tenant,
    Connection,
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subject => f.write_str("subject"),
            Self::Scopes => f.write_str("scopes"),
            Self::Tenant => f.write_str("tenant"),
            Self::Connection => f.write_str("connection"),
        }
    }
}

/// Unified error type for identity extraction.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// The token could not be decoded into a claim set.
    #[error("unable to parse token into tenant claims: {reason}")]
    MalformedToken { reason: String },

    /// A required claim was absent or empty.
    #[error("no {0} present on token")]
    MissingClaim(Claim),

    /// The call carried no `authorization` metadata.
    #[error("request unauthenticated with bearer")]
    MissingCredentials,

    /// The `authorization` metadata used another scheme or had no token.
    #[error("bad authorization string")]
    BadScheme,
}

impl AuthError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedToken {
            reason: reason.into(),
        }
    }
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        Status::unauthenticated(err.to_string())
    }
}

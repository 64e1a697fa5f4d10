//! Unverified bearer-token claims parsing.
//!
//! [`parse_unverified`] establishes the *shape* of a token, never its trust:
//! the signature segment is ignored entirely. Anything built from its output
//! must be treated as unverified unless a signature check happened upstream.
//!
//! ## Token layout
//!
//! ```text
//! header.payload.signature
//! ```
//!
//! The payload is base64url-encoded JSON. Both padded and unpadded payloads are
//! accepted.

use crate::common::error::{AuthError, Result};
use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use serde::{Deserialize, de::DeserializeOwned};

/// Claim key carrying the tenant an identity operates under.
pub const TENANT_CLAIM: &str = "https://dev.zing.ninja/tenant";
/// Claim key carrying the identity's email address.
pub const EMAIL_CLAIM: &str = "https://dev.zing.ninja/email";
/// Claim key carrying the identity provider connection.
pub const CONNECTION_CLAIM: &str = "https://dev.zing.ninja/connection";
/// Claim key carrying the OAuth client id.
pub const CLIENT_ID_CLAIM: &str = "https://dev.zing.ninja/clientid";
/// Claim key carrying group memberships.
pub const GROUPS_CLAIM: &str = "https://zenoss.com/groups";
/// Claim key carrying role assignments.
pub const ROLES_CLAIM: &str = "https://zenoss.com/roles";

const SEGMENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decodes the payload segment of `token` into `T` without verifying the
/// signature.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the token does not have exactly
/// three `.`-delimited segments, if the payload is not base64url, or if the
/// decoded bytes do not deserialize into `T`.
pub fn parse_unverified<T: DeserializeOwned>(token: &str) -> Result<T> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AuthError::malformed("wrong number of segments"));
    };

    let bytes = SEGMENT.decode(payload).map_err(|e| {
        AuthError::malformed(format!("unable to decode claims segment: {e}"))
    })?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::malformed(format!("unable to deserialize claims: {e}")))
}

/// The claim set carried by a tenant bearer token.
///
/// Every string claim defaults to empty when absent so that required-claim
/// validation can report *which* claim is missing rather than failing the
/// whole decode.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct TenantClaims {
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<Audience>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub jti: Option<String>,

    /// Legacy space-delimited scope list. Preferred over `scopes`.
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub scopes: String,

    #[serde(default, rename = "https://dev.zing.ninja/tenant")]
    pub tenant: String,
    #[serde(default, rename = "https://dev.zing.ninja/email")]
    pub email: String,
    #[serde(default, rename = "https://dev.zing.ninja/connection")]
    pub connection: String,
    #[serde(default, rename = "https://dev.zing.ninja/clientid")]
    pub client_id: String,
    #[serde(default, rename = "https://zenoss.com/groups")]
    pub groups: Option<Vec<String>>,
    #[serde(default, rename = "https://zenoss.com/roles")]
    pub roles: Option<Vec<String>>,
}

/// The `aud` registered claim, which may be a single string or a list.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde_json::{Value, json};

    /// Builds `header.payload.signature` around an arbitrary JSON payload.
    pub(crate) fn token_with(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.c2lnbmF0dXJl")
    }

    #[test]
    fn decodes_custom_claim_keys() {
        let token = token_with(&json!({
            "sub": "auth0|abc",
            "scope": "read write",
            TENANT_CLAIM: "acme",
            EMAIL_CLAIM: "user@acme.example.com",
            CONNECTION_CLAIM: "google-oauth2",
            CLIENT_ID_CLAIM: "cid",
            GROUPS_CLAIM: ["ops"],
            "aud": ["api", "web"],
            "exp": 1_900_000_000,
        }));

        let claims: TenantClaims = parse_unverified(&token).unwrap();
        assert_eq!(claims.sub, "auth0|abc");
        assert_eq!(claims.tenant, "acme");
        assert_eq!(claims.email, "user@acme.example.com");
        assert_eq!(claims.connection, "google-oauth2");
        assert_eq!(claims.client_id, "cid");
        assert_eq!(claims.groups, Some(vec!["ops".to_string()]));
        assert_eq!(claims.roles, None);
        assert_eq!(
            claims.aud,
            Some(Audience::Many(vec!["api".into(), "web".into()]))
        );
        assert_eq!(claims.exp, Some(1_900_000_000));
    }

    #[test]
    fn rejects_wrong_segment_counts() {
        let good = token_with(&json!({ "sub": "x" }));
        let mut parts = good.split('.');
        let (h, p, s) = (
            parts.next().unwrap(),
            parts.next().unwrap(),
            parts.next().unwrap(),
        );

        for token in [
            String::new(),
            h.to_string(),
            format!("{h}.{p}"),
            format!("{h}.{p}.{s}.{s}"),
            format!("{h}.{p}.{s}."),
        ] {
            let err = parse_unverified::<TenantClaims>(&token).unwrap_err();
            assert!(
                matches!(err, AuthError::MalformedToken { .. }),
                "{token:?} -> {err:?}"
            );
        }
    }

    #[test]
    fn rejects_undecodable_payload() {
        let err = parse_unverified::<TenantClaims>("a.!!!not-base64!!!.c").unwrap_err();
        assert!(matches!(err, AuthError::MalformedToken { .. }));
        assert!(err.to_string().contains("decode"));
    }

    #[test]
    fn rejects_non_json_payload() {
        let payload = URL_SAFE_NO_PAD.encode("not json");
        let err = parse_unverified::<TenantClaims>(&format!("a.{payload}.c")).unwrap_err();
        assert!(err.to_string().contains("deserialize"));
    }

    #[test]
    fn rejects_mistyped_claims() {
        let token = token_with(&json!({ "sub": 42 }));
        let err = parse_unverified::<TenantClaims>(&token).unwrap_err();
        assert!(matches!(err, AuthError::MalformedToken { .. }));
    }

    #[test]
    fn accepts_padded_payload() {
        let padded = base64::engine::general_purpose::URL_SAFE.encode(r#"{"sub":"abc"}"#);
        assert!(padded.ends_with('='));
        let claims: TenantClaims = parse_unverified(&format!("h.{padded}.s")).unwrap();
        assert_eq!(claims.sub, "abc");
    }

    #[test]
    fn signature_is_not_checked() {
        let token = token_with(&json!({ "sub": "x" }));
        let forged = format!("{}.forged", token.rsplit_once('.').unwrap().0);
        assert!(parse_unverified::<TenantClaims>(&forged).is_ok());
    }
}

//! Tenant identities attached to every authenticated call.
//!
//! A [`TenantIdentity`] is either derived from a bearer token
//! ([`TenantIdentity::from_token`]) or, when authentication is disabled,
//! populated from static development defaults
//! ([`TenantIdentity::from_development_defaults`]). Both variants expose the
//! same accessors; groups and roles fall back to empty when the variant has
//! none.
//!
//! ## Validation
//!
//! A token-derived identity is only constructed when all of the following are
//! non-empty, checked in this order:
//!
//! 1. `sub`
//! 2. `scope` or `scopes`
//! 3. tenant
//! 4. connection
//!
//! The first failing check determines the [`Claim`] reported.

use crate::common::{
    claims::{TenantClaims, parse_unverified},
    error::{AuthError, Claim, Result},
};

/// Static values used to build the development identity.
///
/// Only consulted when authentication is disabled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DevIdentityDefaults {
    pub tenant: String,
    pub user: String,
    pub email: String,
    pub connection: String,
    pub scopes: Vec<String>,
    pub groups: Vec<String>,
    pub roles: Vec<String>,
    pub client_id: String,
}

/// Authentication settings consumed by the authentication stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// When `true`, every call receives the development identity and no
    /// `authorization` metadata is read.
    pub disabled: bool,
    pub dev: DevIdentityDefaults,
}

/// Identity derived from an unverified bearer token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenIdentity {
    subject: String,
    email: String,
    tenant: String,
    connection: String,
    scopes: Vec<String>,
    groups: Option<Vec<String>>,
    roles: Option<Vec<String>>,
    client_id: String,
}

/// Identity built from [`DevIdentityDefaults`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevIdentity {
    id: String,
    email: String,
    tenant: String,
    connection: String,
    scopes: Vec<String>,
    groups: Vec<String>,
    roles: Vec<String>,
    client_id: String,
}

/// An identity operating under a tenant.
///
/// Immutable once built; cloned into each call's request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantIdentity {
    Token(TokenIdentity),
    Development(DevIdentity),
}

impl TenantIdentity {
    /// Builds an identity from an unverified bearer token.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MalformedToken`] if the token cannot be parsed.
    /// - [`AuthError::MissingClaim`] for the first empty required claim.
    pub fn from_token(token: &str) -> Result<Self> {
        let claims: TenantClaims = parse_unverified(token)?;
        TokenIdentity::try_from(claims).map(Self::Token)
    }

    /// Builds the development identity. Never fails.
    pub fn from_development_defaults(defaults: &DevIdentityDefaults) -> Self {
        Self::Development(DevIdentity {
            id: defaults.user.clone(),
            email: defaults.email.clone(),
            tenant: defaults.tenant.clone(),
            connection: defaults.connection.clone(),
            scopes: defaults.scopes.clone(),
            groups: defaults.groups.clone(),
            roles: defaults.roles.clone(),
            client_id: defaults.client_id.clone(),
        })
    }

    /// The user id. For token identities this is the part of `sub` after the
    /// last `|`, so `auth0|abc` yields `abc`.
    pub fn id(&self) -> &str {
        match self {
            Self::Token(t) => t
                .subject
                .rsplit_once('|')
                .map_or(t.subject.as_str(), |(_, id)| id),
            Self::Development(d) => &d.id,
        }
    }

    pub fn email(&self) -> &str {
        match self {
            Self::Token(t) => &t.email,
            Self::Development(d) => &d.email,
        }
    }

    pub fn tenant(&self) -> &str {
        match self {
            Self::Token(t) => &t.tenant,
            Self::Development(d) => &d.tenant,
        }
    }

    pub fn connection(&self) -> &str {
        match self {
            Self::Token(t) => &t.connection,
            Self::Development(d) => &d.connection,
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            Self::Token(t) => &t.client_id,
            Self::Development(d) => &d.client_id,
        }
    }

    /// Granted scopes, in token order. Duplicates and empty entries produced
    /// by splitting are kept.
    pub fn scopes(&self) -> &[String] {
        match self {
            Self::Token(t) => &t.scopes,
            Self::Development(d) => &d.scopes,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().iter().any(|s| s == scope)
    }

    /// Group memberships, or empty if the identity carries none.
    pub fn groups(&self) -> &[String] {
        match self {
            Self::Token(t) => t.groups.as_deref().unwrap_or_default(),
            Self::Development(d) => &d.groups,
        }
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups().iter().any(|g| g == group)
    }

    /// Role assignments, or empty if the identity carries none.
    pub fn roles(&self) -> &[String] {
        match self {
            Self::Token(t) => t.roles.as_deref().unwrap_or_default(),
            Self::Development(d) => &d.roles,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles().iter().any(|r| r == role)
    }

    /// Returns `true` for the development identity.
    pub const fn is_development(&self) -> bool {
        matches!(self, Self::Development(_))
    }
}

impl TryFrom<TenantClaims> for TokenIdentity {
    type Error = AuthError;

    fn try_from(claims: TenantClaims) -> Result<Self> {
        if claims.sub.is_empty() {
            return Err(AuthError::MissingClaim(Claim::Subject));
        }
        if claims.scope.is_empty() && claims.scopes.is_empty() {
            return Err(AuthError::MissingClaim(Claim::Scopes));
        }
        if claims.tenant.is_empty() {
            return Err(AuthError::MissingClaim(Claim::Tenant));
        }
        if claims.connection.is_empty() {
            return Err(AuthError::MissingClaim(Claim::Connection));
        }

        // The legacy `scope` claim wins whenever it is present.
        let raw_scopes = if claims.scope.is_empty() {
            &claims.scopes
        } else {
            &claims.scope
        };
        let scopes = raw_scopes.split(' ').map(str::to_owned).collect();

        Ok(Self {
            subject: claims.sub,
            email: claims.email,
            tenant: claims.tenant,
            connection: claims.connection,
            scopes,
            groups: claims.groups,
            roles: claims.roles,
            client_id: claims.client_id,
        })
    }
}

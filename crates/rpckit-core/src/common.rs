//! Identity model shared by every rpckit service.
//!
//! ## Modules
//! - [`claims`]: Unverified decoding of bearer-token payloads.
//! - [`identity`]: [`TenantIdentity`](identity::TenantIdentity) and its
//!   construction rules.
//! - [`auth`]: `authorization` metadata parsing.
//! - [`error`]: The [`AuthError`](error::AuthError) taxonomy.

pub mod auth;
pub mod claims;
pub mod error;
pub mod identity;

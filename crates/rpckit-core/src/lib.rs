#![doc = include_str!("../README.md")]

mod common;
pub use common::*;
pub use error::{AuthError, Claim};
pub use identity::{AuthConfig, DevIdentityDefaults, TenantIdentity};

//! The built-in interceptor stages.
//!
//! Each stage implements [`Stage`](crate::server::chain::Stage) for any
//! [`CallResponse`](crate::server::chain::CallResponse), so the same instances
//! wrap unary and streaming calls alike.

mod admission;
mod auth;
mod context;
mod logging;
mod recovery;
mod tags;

pub use admission::AdmissionStage;
pub use auth::{AuthStage, Authenticate, BearerAuth, DevAuth};
pub use context::ContextTagStage;
pub use logging::{LoggingStage, log_level_for};
pub use recovery::RecoveryStage;
pub(crate) use recovery::panic_message;
pub use tags::{IdentityTagStage, TagStage};

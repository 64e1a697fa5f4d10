use crate::server::chain::{CallContext, CallFuture, CallResponse, Next, Stage};
use rpckit_core::{AuthConfig, AuthError, DevIdentityDefaults, TenantIdentity, auth::bearer_token};
use std::sync::Arc;
use tonic::{Status, metadata::MetadataMap};

/// Produces the identity of a call from its metadata.
pub trait Authenticate: Send + Sync {
    /// # Errors
    ///
    /// Any [`AuthError`]; the stage reports it as `UNAUTHENTICATED`.
    fn authenticate(&self, metadata: &MetadataMap) -> Result<TenantIdentity, AuthError>;
}

impl<F> Authenticate for F
where
    F: Fn(&MetadataMap) -> Result<TenantIdentity, AuthError> + Send + Sync,
{
    fn authenticate(&self, metadata: &MetadataMap) -> Result<TenantIdentity, AuthError> {
        self(metadata)
    }
}

/// Builds a token identity from `authorization: bearer <token>`.
///
/// The token signature is not verified.
#[derive(Debug, Default, Clone, Copy)]
pub struct BearerAuth;

impl Authenticate for BearerAuth {
    fn authenticate(&self, metadata: &MetadataMap) -> Result<TenantIdentity, AuthError> {
        TenantIdentity::from_token(bearer_token(metadata)?)
    }
}

/// Attaches the same development identity to every call.
#[derive(Debug, Clone)]
pub struct DevAuth {
    identity: TenantIdentity,
}

impl DevAuth {
    pub fn new(defaults: &DevIdentityDefaults) -> Self {
        Self {
            identity: TenantIdentity::from_development_defaults(defaults),
        }
    }
}

impl Authenticate for DevAuth {
    fn authenticate(&self, _metadata: &MetadataMap) -> Result<TenantIdentity, AuthError> {
        Ok(self.identity.clone())
    }
}

/// Attaches a [`TenantIdentity`] to the call or fails it with
/// `UNAUTHENTICATED`, carrying the underlying error's message.
#[derive(Clone)]
pub struct AuthStage {
    auth: Arc<dyn Authenticate>,
}

impl AuthStage {
    pub fn new(auth: impl Authenticate + 'static) -> Self {
        Self {
            auth: Arc::new(auth),
        }
    }

    /// Bearer authentication, or the development identity when
    /// authentication is disabled.
    pub fn from_config(config: &AuthConfig) -> Self {
        if config.disabled {
            tracing::warn!(
                tenant = %config.dev.tenant,
                user = %config.dev.user,
                "authentication disabled; every call uses the development identity"
            );
            Self::new(DevAuth::new(&config.dev))
        } else {
            Self::new(BearerAuth)
        }
    }
}

impl<R: CallResponse> Stage<R> for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn call<'a>(&'a self, mut ctx: CallContext, next: Next<'a, R>) -> CallFuture<'a, R> {
        match self.auth.authenticate(ctx.metadata()) {
            Ok(identity) => {
                ctx.set_identity(identity);
                next.run(ctx)
            }
            Err(err) => {
                tracing::debug!(error = %err, "authentication failed");
                Box::pin(core::future::ready(Err(Status::from(err))))
            }
        }
    }
}

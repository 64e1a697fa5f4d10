use crate::server::chain::{
    CallContext, CallFuture, CallResponse, Next, SERVICE_LABEL_TAG, Stage, TENANT_TAG, USER_TAG,
};
use tracing::Span;

/// Attaches the static service label to every call.
#[derive(Debug, Clone)]
pub struct TagStage {
    service_label: String,
}

impl TagStage {
    pub fn new(service_label: impl Into<String>) -> Self {
        Self {
            service_label: service_label.into(),
        }
    }
}

impl<R: CallResponse> Stage<R> for TagStage {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn call<'a>(&'a self, mut ctx: CallContext, next: Next<'a, R>) -> CallFuture<'a, R> {
        ctx.tags_mut()
            .set(SERVICE_LABEL_TAG, self.service_label.as_str());
        next.run(ctx)
    }
}

/// Copies the tenant and user of the attached identity into the call's tags
/// and the current `grpc.call` span.
///
/// Calls without an identity pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTagStage;

impl<R: CallResponse> Stage<R> for IdentityTagStage {
    fn name(&self) -> &'static str {
        "identity_tag"
    }

    fn call<'a>(&'a self, mut ctx: CallContext, next: Next<'a, R>) -> CallFuture<'a, R> {
        if let Some(identity) = ctx.identity() {
            let tenant = identity.tenant().to_owned();
            let user = identity.id().to_owned();

            let span = Span::current();
            span.record(TENANT_TAG, tenant.as_str());
            span.record(USER_TAG, user.as_str());

            ctx.tags_mut().set(TENANT_TAG, tenant).set(USER_TAG, user);
        }
        next.run(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::chain::{
        Chain,
        tests::{Reply, ctx, endpoint},
    };
    use rpckit_core::{DevIdentityDefaults, TenantIdentity};

    #[tokio::test]
    async fn service_label_is_tagged() {
        let chain = Chain::builder().stage(TagStage::new("blue")).build();
        let reply = chain
            .run(
                ctx(),
                endpoint(|ctx| {
                    Ok(Reply::new(
                        ctx.tags().get(SERVICE_LABEL_TAG).unwrap_or_default(),
                    ))
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply.body, "blue");
    }

    #[tokio::test]
    async fn identity_tags_follow_identity() {
        let chain = Chain::builder().stage(IdentityTagStage).build();
        let mut call = ctx();
        call.set_identity(TenantIdentity::from_development_defaults(
            &DevIdentityDefaults {
                tenant: "acme".into(),
                user: "dev-user".into(),
                ..DevIdentityDefaults::default()
            },
        ));

        let reply = chain
            .run(
                call,
                endpoint(|ctx| {
                    let tags = ctx.tags();
                    Ok(Reply::new(format!(
                        "{}/{}",
                        tags.get(TENANT_TAG).unwrap_or_default(),
                        tags.get(USER_TAG).unwrap_or_default()
                    )))
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply.body, "acme/dev-user");
    }

    #[tokio::test]
    async fn no_identity_no_tags() {
        let chain = Chain::builder().stage(IdentityTagStage).build();
        let reply = chain
            .run(
                ctx(),
                endpoint(|ctx| Ok(Reply::new(ctx.tags().get(TENANT_TAG).unwrap_or("none")))),
            )
            .await
            .unwrap();
        assert_eq!(reply.body, "none");
    }
}

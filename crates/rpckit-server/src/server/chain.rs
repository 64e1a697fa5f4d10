//! Ordered interceptor pipeline applied to every inbound call.
//!
//! A [`Chain`] is an immutable list of [`Stage`]s fixed when the server is
//! configured and shared read-only by every concurrent call. Each stage
//! receives the call's [`CallContext`] and a [`Next`] continuation. Calling
//! [`Next::run`] hands the call to the remaining stages and finally to the
//! endpoint; returning without calling it short-circuits the call.
//!
//! ## Standard order
//!
//! [`Chain::standard`] builds the order every rpckit server uses:
//!
//! 1. [`TagStage`] - service label tag.
//! 2. [`ContextTagStage`] - per-call `tracing` span.
//! 3. [`LoggingStage`] - completion log, latency and request metrics.
//! 4. [`AdmissionStage`] - concurrency limit.
//! 5. [`AuthStage`] - tenant identity.
//! 6. [`IdentityTagStage`] - tenant/user tags.
//! 7. [`RecoveryStage`] - handler panics become `Internal`.
//!
//! Admission runs before authentication so rejected calls cost nothing, and
//! recovery sits directly around the endpoint so no handler panic escapes.
//!
//! ## Responses
//!
//! Stages are generic over the response type `R`, which only has to implement
//! [`CallResponse`]. For streaming responses a stage can tie a guard to the
//! response with [`CallResponse::retain`], so per-call resources are held
//! until the stream ends rather than until the handler returns.

use crate::server::{
    admission::AdmissionController,
    config::ServerConfig,
    stages::{
        AdmissionStage, AuthStage, ContextTagStage, IdentityTagStage, LoggingStage,
        RecoveryStage, TagStage,
    },
};
use futures::future::BoxFuture;
use rpckit_core::TenantIdentity;
use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};
use tonic::{Code, Status, metadata::MetadataMap};

/// Tag carrying the configured service label.
pub const SERVICE_LABEL_TAG: &str = "service_label";
/// Tag carrying the authenticated tenant.
pub const TENANT_TAG: &str = "tenant";
/// Tag carrying the authenticated user id.
pub const USER_TAG: &str = "user";
/// Tag carrying the full gRPC method path.
pub const METHOD_TAG: &str = "method";

/// Observability tags accumulated while a call moves through the chain.
///
/// Handed to handlers through request extensions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallTags(BTreeMap<&'static str, String>);

impl CallTags {
    /// Inserts or replaces a tag.
    pub fn set(&mut self, key: &'static str, value: impl Into<String>) -> &mut Self {
        self.0.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// Per-call state visible to stages.
#[derive(Debug)]
pub struct CallContext {
    method: String,
    metadata: MetadataMap,
    tags: CallTags,
    identity: Option<TenantIdentity>,
}

impl CallContext {
    pub fn new(method: impl Into<String>, metadata: MetadataMap) -> Self {
        let method = method.into();
        let mut tags = CallTags::default();
        tags.set(METHOD_TAG, method.clone());
        Self {
            method,
            metadata,
            tags,
            identity: None,
        }
    }

    /// Full method path, e.g. `/grpc.health.v1.Health/Check`.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub const fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub const fn tags(&self) -> &CallTags {
        &self.tags
    }

    pub const fn tags_mut(&mut self) -> &mut CallTags {
        &mut self.tags
    }

    pub const fn identity(&self) -> Option<&TenantIdentity> {
        self.identity.as_ref()
    }

    pub fn set_identity(&mut self, identity: TenantIdentity) {
        self.identity = Some(identity);
    }

    /// Splits the context into the parts handed to the endpoint.
    pub fn into_parts(self) -> (CallTags, Option<TenantIdentity>) {
        (self.tags, self.identity)
    }
}

/// Slot filled with the status code a response delivers in its trailers.
pub type TrailerCode = Arc<OnceLock<Code>>;

/// A response that can outlive the handler future.
pub trait CallResponse: Send + Sized + 'static {
    /// Keeps `guard` alive until the response is fully delivered or dropped.
    ///
    /// A response with nothing left to deliver releases `guard` right away.
    fn retain<G: Send + 'static>(self, guard: G) -> Self;

    /// The gRPC status already known when the handler returned, if any.
    ///
    /// `None` means the status is only delivered later (e.g. in trailers).
    fn grpc_code(&self) -> Option<Code> {
        None
    }

    /// Stores the status carried by the trailers in `code` once they are
    /// delivered.
    fn observe_trailers(self, _code: TrailerCode) -> Self {
        self
    }

    /// Ends delivery with an `INTERNAL` status if producing the rest of the
    /// response panics.
    fn recover_panics(self) -> Self {
        self
    }
}

/// Future returned by stages and endpoints.
pub type CallFuture<'a, R> = BoxFuture<'a, Result<R, Status>>;

/// The terminal handler a call reaches after every stage has run.
pub type Endpoint<R> = Box<dyn FnOnce(CallContext) -> CallFuture<'static, R> + Send>;

/// One call-wrapping step of a [`Chain`].
pub trait Stage<R>: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Handles the call, optionally delegating to `next`.
    fn call<'a>(&'a self, ctx: CallContext, next: Next<'a, R>) -> CallFuture<'a, R>;
}

/// Continuation over the remaining stages of a chain.
pub struct Next<'a, R> {
    stages: &'a [Arc<dyn Stage<R>>],
    endpoint: Endpoint<R>,
}

impl<'a, R: CallResponse> Next<'a, R> {
    /// Runs the remaining stages and then the endpoint.
    pub fn run(self, ctx: CallContext) -> CallFuture<'a, R> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.call(
                ctx,
                Next {
                    stages: rest,
                    endpoint: self.endpoint,
                },
            ),
            None => (self.endpoint)(ctx),
        }
    }
}

/// An immutable, cheaply cloneable list of stages.
pub struct Chain<R> {
    stages: Arc<[Arc<dyn Stage<R>>]>,
}

impl<R> Clone for Chain<R> {
    fn clone(&self) -> Self {
        Self {
            stages: Arc::clone(&self.stages),
        }
    }
}

impl<R: CallResponse> Chain<R> {
    pub fn builder() -> ChainBuilder<R> {
        ChainBuilder { stages: Vec::new() }
    }

    /// The full chain every rpckit server applies to its calls.
    pub fn standard(config: &ServerConfig, admission: Arc<AdmissionController>) -> Self {
        Self::builder()
            .stage(TagStage::new(config.service_label.clone()))
            .stage(ContextTagStage)
            .stage(LoggingStage)
            .stage(AdmissionStage::new(admission))
            .stage(AuthStage::from_config(&config.auth))
            .stage(IdentityTagStage)
            .stage(RecoveryStage)
            .build()
    }

    /// The reduced chain used by the health endpoint.
    pub fn health() -> Self {
        Self::builder()
            .stage(ContextTagStage)
            .stage(LoggingStage)
            .stage(RecoveryStage)
            .build()
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs `ctx` through every stage and into `endpoint`.
    pub async fn run(&self, ctx: CallContext, endpoint: Endpoint<R>) -> Result<R, Status> {
        Next {
            stages: &self.stages,
            endpoint,
        }
        .run(ctx)
        .await
    }
}

pub struct ChainBuilder<R> {
    stages: Vec<Arc<dyn Stage<R>>>,
}

impl<R: CallResponse> ChainBuilder<R> {
    /// Appends a stage. Stages run in the order they are added.
    #[must_use]
    pub fn stage<S: Stage<R> + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn build(self) -> Chain<R> {
        Chain {
            stages: self.stages.into(),
        }
    }
}

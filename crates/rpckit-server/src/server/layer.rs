//! Tower adapter running a [`Chain`] in front of tonic's router.
//!
//! [`InterceptorLayer`] wraps the routed gRPC services, so every unary and
//! streaming call passes through the same stages exactly once per call. The
//! identity and tags the chain produces are handed to handlers through request
//! extensions; see [`tenant_identity`] and [`call_tags`].
//!
//! Stage failures never reach the transport as errors: they become a normal
//! gRPC response whose status travels in the headers.

use crate::server::{
    chain::{CallContext, CallFuture, CallResponse, CallTags, Chain, Endpoint, TrailerCode},
    stages::panic_message,
};
use bytes::Bytes;
use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use http::{HeaderMap, HeaderValue};
use std::panic::{self, AssertUnwindSafe};
use futures::future::BoxFuture;
use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project_lite::pin_project;
use rpckit_core::TenantIdentity;
use tonic::{Code, Status, body::Body, metadata::MetadataMap};
use tower::{BoxError, Layer, Service};

/// Response type flowing through server chains.
pub type GrpcResponse = http::Response<Body>;

const GRPC_STATUS: &str = "grpc-status";

impl CallResponse for GrpcResponse {
    fn retain<G: Send + 'static>(self, guard: G) -> Self {
        self.map(|body| Body::new(RetainedBody::new(body, guard)))
    }

    fn grpc_code(&self) -> Option<Code> {
        self.headers()
            .get(GRPC_STATUS)
            .map(|value| Code::from_bytes(value.as_bytes()))
    }

    fn observe_trailers(self, code: TrailerCode) -> Self {
        self.map(|body| Body::new(TrailerObserver { inner: body, code }))
    }

    fn recover_panics(self) -> Self {
        self.map(|body| Body::new(RecoveringBody::new(body)))
    }
}

pin_project! {
    /// A response body that keeps `guard` alive until the last frame is
    /// produced or the body is dropped.
    pub struct RetainedBody<B, G> {
        #[pin]
        inner: B,
        guard: Option<G>,
    }
}

impl<B, G> RetainedBody<B, G> {
    pub const fn new(inner: B, guard: G) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<B: HttpBody, G> HttpBody for RetainedBody<B, G> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        if frame.is_none() {
            this.guard.take();
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Copies the `grpc-status` of a trailers frame into a [`TrailerCode`].
    pub struct TrailerObserver<B> {
        #[pin]
        inner: B,
        code: TrailerCode,
    }
}

impl<B: HttpBody> HttpBody for TrailerObserver<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        if let Some(status) = frame
            .as_ref()
            .and_then(|frame| frame.as_ref().ok())
            .and_then(Frame::trailers_ref)
            .and_then(|trailers| trailers.get(GRPC_STATUS))
        {
            let _ = this.code.set(Code::from_bytes(status.as_bytes()));
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// A response body that ends with `INTERNAL` trailers if polling it
    /// panics.
    pub struct RecoveringBody<B> {
        #[pin]
        inner: B,
        failed: bool,
    }
}

impl<B> RecoveringBody<B> {
    pub const fn new(inner: B) -> Self {
        Self {
            inner,
            failed: false,
        }
    }
}

fn internal_trailers(message: &str) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    if Status::internal(message).add_header(&mut trailers).is_err() {
        trailers.insert(GRPC_STATUS, HeaderValue::from(Code::Internal as i32));
    }
    trailers
}

impl<B: HttpBody> HttpBody for RecoveringBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if *this.failed {
            return Poll::Ready(None);
        }

        match panic::catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll_frame(cx))) {
            Ok(poll) => poll,
            Err(payload) => {
                *this.failed = true;
                let message = panic_message(payload.as_ref());
                tracing::error!(panic = message, "recovered from panic in response stream");
                Poll::Ready(Some(Ok(Frame::trailers(internal_trailers(message)))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.failed || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.failed {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}

/// Applies a [`Chain`] to every request reaching the wrapped service.
#[derive(Clone)]
pub struct InterceptorLayer {
    chain: Chain<GrpcResponse>,
}

impl InterceptorLayer {
    pub const fn new(chain: Chain<GrpcResponse>) -> Self {
        Self { chain }
    }
}

impl<S> Layer<S> for InterceptorLayer {
    type Service = InterceptorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptorService {
            inner,
            chain: self.chain.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InterceptorService<S> {
    inner: S,
    chain: Chain<GrpcResponse>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for InterceptorService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    ReqBody: Send + 'static,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = GrpcResponse;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // The readied service goes with this call; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = core::mem::replace(&mut self.inner, clone);
        let chain = self.chain.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let ctx = CallContext::new(
                parts.uri.path(),
                MetadataMap::from_headers(parts.headers.clone()),
            );

            let endpoint: Endpoint<GrpcResponse> =
                Box::new(move |ctx: CallContext| -> CallFuture<'static, GrpcResponse> {
                    Box::pin(async move {
                        let (tags, identity) = ctx.into_parts();
                        let mut req = http::Request::from_parts(parts, body);
                        req.extensions_mut().insert(tags);
                        if let Some(identity) = identity {
                            req.extensions_mut().insert(identity);
                        }

                        inner
                            .call(req)
                            .await
                            .map(|res| res.map(Body::new))
                            .map_err(|e| Status::from_error(e.into()))
                    })
                });

            Ok(chain
                .run(ctx, endpoint)
                .await
                .unwrap_or_else(Status::into_http))
        })
    }
}

/// The identity the authentication stage attached to `request`.
///
/// # Errors
///
/// `UNAUTHENTICATED` when the request did not pass through an authentication
/// stage.
pub fn tenant_identity<T>(request: &tonic::Request<T>) -> Result<&TenantIdentity, Status> {
    request
        .extensions()
        .get::<TenantIdentity>()
        .ok_or_else(|| Status::unauthenticated("no identity on context"))
}

/// The observability tags accumulated for `request`, if it passed through a
/// chain.
pub fn call_tags<T>(request: &tonic::Request<T>) -> Option<&CallTags> {
    request.extensions().get::<CallTags>()
}

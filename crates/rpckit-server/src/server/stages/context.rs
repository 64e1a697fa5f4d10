use crate::server::chain::{
    CallContext, CallFuture, CallResponse, Next, SERVICE_LABEL_TAG, Stage,
};
use opentelemetry::{global, propagation::Extractor};
use tonic::metadata::{KeyRef, MetadataMap};
use tracing::{Instrument, field::Empty};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Reads W3C trace context out of call metadata.
struct MetadataExtractor<'a>(&'a MetadataMap);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .map(|key| match key {
                KeyRef::Ascii(key) => key.as_str(),
                KeyRef::Binary(key) => key.as_str(),
            })
            .collect()
    }
}

/// Opens the `grpc.call` span that scopes every log line and tag of a call.
///
/// The span's parent is taken from the inbound `traceparent` metadata when
/// present. `tenant` and `user` start empty and are filled in by
/// [`IdentityTagStage`](super::IdentityTagStage).
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextTagStage;

impl<R: CallResponse> Stage<R> for ContextTagStage {
    fn name(&self) -> &'static str {
        "context_tag"
    }

    fn call<'a>(&'a self, ctx: CallContext, next: Next<'a, R>) -> CallFuture<'a, R> {
        let span = tracing::info_span!(
            "grpc.call",
            method = %ctx.method(),
            service_label = Empty,
            tenant = Empty,
            user = Empty,
        );

        if let Some(label) = ctx.tags().get(SERVICE_LABEL_TAG) {
            span.record(SERVICE_LABEL_TAG, label);
        }

        let parent = global::get_text_map_propagator(|propagator| {
            propagator.extract(&MetadataExtractor(ctx.metadata()))
        });
        let _ = span.set_parent(parent);

        Box::pin(next.run(ctx).instrument(span))
    }
}

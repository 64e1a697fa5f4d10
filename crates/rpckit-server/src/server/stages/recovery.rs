use crate::server::chain::{CallContext, CallFuture, CallResponse, Next, Stage};
use futures::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe};
use tonic::Status;

/// Turns a panicking handler into an `INTERNAL` status.
///
/// This is the only stage that stops an unwind. It sits directly around the
/// handler, so stages before it still observe the failure as an ordinary
/// status and release whatever they hold. Panics raised later, while a
/// streaming response is being produced, end the stream with an `INTERNAL`
/// trailer instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStage;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("handler panicked")
}

impl<R: CallResponse> Stage<R> for RecoveryStage {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn call<'a>(&'a self, ctx: CallContext, next: Next<'a, R>) -> CallFuture<'a, R> {
        Box::pin(async move {
            // Building the future can panic too, so it happens inside the guard.
            match AssertUnwindSafe(async move { next.run(ctx).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result.map(CallResponse::recover_panics),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(panic = message, "recovered from handler panic");
                    Err(Status::internal(message))
                }
            }
        })
    }
}

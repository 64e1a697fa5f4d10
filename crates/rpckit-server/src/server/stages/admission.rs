use crate::server::{
    admission::AdmissionController,
    chain::{CallContext, CallFuture, CallResponse, Next, Stage},
};
use std::sync::Arc;
use tonic::Status;

/// Admits the call through an [`AdmissionController`] before anything
/// downstream runs.
///
/// A rejected call returns `RESOURCE_EXHAUSTED` without touching later
/// stages. An admitted call keeps its permit until the response is dropped,
/// or until the call fails or unwinds.
#[derive(Debug, Clone)]
pub struct AdmissionStage {
    controller: Arc<AdmissionController>,
}

impl AdmissionStage {
    pub const fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }
}

impl<R: CallResponse> Stage<R> for AdmissionStage {
    fn name(&self) -> &'static str {
        "admission"
    }

    fn call<'a>(&'a self, ctx: CallContext, next: Next<'a, R>) -> CallFuture<'a, R> {
        Box::pin(async move {
            let permit = match self.controller.enter(ctx.method()) {
                Ok(permit) => permit,
                Err(rejected) => {
                    tracing::debug!(max = self.controller.max(), "rejected call");
                    return Err(Status::from(rejected));
                }
            };

            next.run(ctx).await.map(|response| response.retain(permit))
        })
    }
}

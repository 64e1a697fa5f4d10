use crate::server::{
    chain::{CallContext, CallFuture, CallResponse, Next, Stage, TrailerCode},
    telemetry,
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tonic::Code;
use tracing::{Level, Span};

/// Severity used when logging a finished call with status `code`.
///
/// Client-side mistakes stay at `INFO`, conditions an operator may need to
/// act on are `WARN`, and server faults are `ERROR`.
pub const fn log_level_for(code: Code) -> Level {
    match code {
        Code::Ok
        | Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::Unauthenticated => Level::INFO,
        Code::DeadlineExceeded
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable => Level::WARN,
        Code::Unknown | Code::Unimplemented | Code::Internal | Code::DataLoss => Level::ERROR,
    }
}

fn log_finished(method: &str, code: Code, elapsed: Duration, error: Option<&str>) {
    let latency_ms = elapsed.as_secs_f64() * 1_000.0;
    let level = log_level_for(code);

    if level == Level::ERROR {
        tracing::error!(grpc.code = ?code, latency_ms, error, "finished call");
    } else if level == Level::WARN {
        tracing::warn!(grpc.code = ?code, latency_ms, error, "finished call");
    } else {
        tracing::info!(grpc.code = ?code, latency_ms, error, "finished call");
    }

    telemetry::record_request(method, code, elapsed);
}

/// Logged when a successful response has been fully delivered.
struct CallLog {
    method: String,
    code: Code,
    trailer: TrailerCode,
    start: Instant,
    span: Span,
}

impl CallLog {
    /// The trailer status wins over the one known when the handler returned.
    fn code(&self) -> Code {
        self.trailer.get().copied().unwrap_or(self.code)
    }
}

impl Drop for CallLog {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        log_finished(&self.method, self.code(), self.start.elapsed(), None);
    }
}

/// Logs call start and completion with latency, and records the request
/// metrics.
///
/// Failed calls are logged as soon as the status is known. Successful calls
/// are logged once their response is dropped, which for streams is when the
/// last message has been sent, with the status from the trailers if any.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStage;

impl<R: CallResponse> Stage<R> for LoggingStage {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn call<'a>(&'a self, ctx: CallContext, next: Next<'a, R>) -> CallFuture<'a, R> {
        Box::pin(async move {
            let method = ctx.method().to_owned();
            let start = Instant::now();
            tracing::debug!("started call");

            match next.run(ctx).await {
                Ok(response) => {
                    let trailer = TrailerCode::default();
                    let log = CallLog {
                        method,
                        code: response.grpc_code().unwrap_or(Code::Ok),
                        trailer: Arc::clone(&trailer),
                        start,
                        span: Span::current(),
                    };
                    Ok(response.observe_trailers(trailer).retain(log))
                }
                Err(status) => {
                    log_finished(&method, status.code(), start.elapsed(), Some(status.message()));
                    Err(status)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::chain::{
        Chain,
        tests::{Reply, ctx, endpoint},
    };
    use tonic::Status;

    #[test]
    fn levels_by_code() {
        assert_eq!(log_level_for(Code::Ok), Level::INFO);
        assert_eq!(log_level_for(Code::Unauthenticated), Level::INFO);
        assert_eq!(log_level_for(Code::ResourceExhausted), Level::WARN);
        assert_eq!(log_level_for(Code::Unavailable), Level::WARN);
        assert_eq!(log_level_for(Code::Internal), Level::ERROR);
        assert_eq!(log_level_for(Code::Unknown), Level::ERROR);
    }

    #[tokio::test]
    async fn success_defers_completion_to_response() {
        let chain = Chain::builder().stage(LoggingStage).build();
        let reply = chain
            .run(ctx(), endpoint(|_| Ok(Reply::new("ok"))))
            .await
            .unwrap();
        assert_eq!(reply.held(), 1);
    }

    #[tokio::test]
    async fn trailer_status_is_logged() {
        let chain = Chain::builder().stage(LoggingStage).build();
        let reply = chain
            .run(
                ctx(),
                endpoint(|_| {
                    Ok(Reply {
                        trailer: Some(Code::NotFound),
                        ..Reply::new("stream")
                    })
                }),
            )
            .await
            .unwrap();

        let log = reply.guards[0].downcast_ref::<CallLog>().unwrap();
        assert_eq!(log.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn header_status_without_trailer() {
        let chain = Chain::builder().stage(LoggingStage).build();
        let reply = chain
            .run(ctx(), endpoint(|_| Ok(Reply::new("unary"))))
            .await
            .unwrap();

        let log = reply.guards[0].downcast_ref::<CallLog>().unwrap();
        assert_eq!(log.code(), Code::Ok);
    }

    #[tokio::test]
    async fn failure_passes_status_through() {
        let chain = Chain::builder().stage(LoggingStage).build();
        let status = chain
            .run(ctx(), endpoint(|_| Err(Status::not_found("gone"))))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "gone");
    }
}

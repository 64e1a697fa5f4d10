//! Concurrency admission control.
//!
//! [`AdmissionController`] bounds the number of calls in flight. Admission
//! never waits: [`AdmissionController::enter`] either hands back an
//! [`AdmissionPermit`] immediately or fails with [`Rejected`].
//!
//! The in-flight count is tracked with a single atomic. Every successful
//! `enter` increments it once and dropping the permit decrements it once, so
//! the count returns to its previous value on every exit path: normal return,
//! handler error, panic unwinding through the handler, or the call future
//! being dropped. Each change is published to a [`ConcurrencySink`] tagged
//! with the method name.

use crate::server::telemetry;
use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tonic::Status;

/// Receives the in-flight count after every change.
pub trait ConcurrencySink: Send + Sync {
    fn record(&self, method: &str, in_flight: i64);
}

/// Publishes to the `grpc.server.concurrent_requests` gauge.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl ConcurrencySink for MetricsSink {
    fn record(&self, method: &str, in_flight: i64) {
        telemetry::record_concurrency(method, in_flight);
    }
}

/// The concurrency limit is reached.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("concurrent request limit reached")]
pub struct Rejected;

impl From<Rejected> for Status {
    fn from(err: Rejected) -> Self {
        Status::resource_exhausted(err.to_string())
    }
}

pub struct AdmissionController {
    max: usize,
    slots: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicI64>,
    sink: Arc<dyn ConcurrencySink>,
}

impl AdmissionController {
    /// Creates a controller admitting at most `max` concurrent calls.
    /// `0` disables the limit.
    pub fn new(max: usize) -> Self {
        Self::with_sink(max, Arc::new(MetricsSink))
    }

    pub fn with_sink(max: usize, sink: Arc<dyn ConcurrencySink>) -> Self {
        Self {
            max,
            slots: (max > 0).then(|| Arc::new(Semaphore::new(max))),
            in_flight: Arc::new(AtomicI64::new(0)),
            sink,
        }
    }

    /// The configured limit, `0` when unbounded.
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Calls currently admitted.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Admits one call for `method`.
    ///
    /// # Errors
    ///
    /// Returns [`Rejected`] when every slot is taken.
    pub fn enter(&self, method: &str) -> Result<AdmissionPermit, Rejected> {
        let slot = match &self.slots {
            Some(slots) => Some(Arc::clone(slots).try_acquire_owned().map_err(|_| Rejected)?),
            None => None,
        };

        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.sink.record(method, in_flight);

        Ok(AdmissionPermit {
            method: method.to_owned(),
            in_flight: Arc::clone(&self.in_flight),
            sink: Arc::clone(&self.sink),
            _slot: slot,
        })
    }
}

impl core::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("max", &self.max)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Proof of admission. Dropping it releases the call's slot.
#[must_use = "the call is released as soon as the permit is dropped"]
pub struct AdmissionPermit {
    method: String,
    in_flight: Arc<AtomicI64>,
    sink: Arc<dyn ConcurrencySink>,
    // Returned to the semaphore after the count is published.
    _slot: Option<OwnedSemaphorePermit>,
}

impl core::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("method", &self.method)
            .field("bounded", &self._slot.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let in_flight = self.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        self.sink.record(&self.method, in_flight);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that keeps every published value.
    #[derive(Default)]
    pub(crate) struct RecordingSink(pub(crate) Mutex<Vec<(String, i64)>>);

    impl RecordingSink {
        pub(crate) fn values(&self) -> Vec<i64> {
            self.0.lock().unwrap().iter().map(|(_, v)| *v).collect()
        }
    }

    impl ConcurrencySink for RecordingSink {
        fn record(&self, method: &str, in_flight: i64) {
            self.0.lock().unwrap().push((method.to_owned(), in_flight));
        }
    }

    #[test]
    fn bounded_rejects_then_recovers() {
        let controller = AdmissionController::new(2);

        let first = controller.enter("/a").unwrap();
        let second = controller.enter("/a").unwrap();
        assert_eq!(controller.enter("/a").unwrap_err(), Rejected);
        assert_eq!(controller.in_flight(), 2);

        drop(first);
        let fourth = controller.enter("/a").unwrap();
        assert_eq!(controller.in_flight(), 2);

        drop(second);
        drop(fourth);
        assert_eq!(controller.in_flight(), 0);
    }

    #[test]
    fn rejection_leaves_count_untouched() {
        let sink = Arc::new(RecordingSink::default());
        let controller = AdmissionController::with_sink(1, sink.clone());

        let _held = controller.enter("/a").unwrap();
        for _ in 0..5 {
            assert!(controller.enter("/a").is_err());
        }
        assert_eq!(controller.in_flight(), 1);
        assert_eq!(sink.values(), [1]);
    }

    #[test]
    fn unbounded_publishes_up_then_down() {
        let sink = Arc::new(RecordingSink::default());
        let controller = AdmissionController::with_sink(0, sink.clone());

        let permits: Vec<_> = (0..3).map(|_| controller.enter("/m").unwrap()).collect();
        drop(permits);

        assert_eq!(sink.values(), [1, 2, 3, 2, 1, 0]);
        assert_eq!(controller.in_flight(), 0);
        assert!(sink.0.lock().unwrap().iter().all(|(m, _)| m == "/m"));
    }

    #[test]
    fn released_on_panic() {
        let controller = Arc::new(AdmissionController::new(1));
        let inner = Arc::clone(&controller);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _permit = inner.enter("/p").unwrap();
            panic!("handler fault");
        }));

        assert!(result.is_err());
        assert_eq!(controller.in_flight(), 0);
        assert!(controller.enter("/p").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_limit_under_contention() {
        const MAX: usize = 4;
        let controller = Arc::new(AdmissionController::new(MAX));
        let peak = Arc::new(AtomicI64::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    if let Ok(_permit) = controller.enter("/c") {
                        peak.fetch_max(controller.in_flight(), Ordering::AcqRel);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::Acquire) <= MAX as i64);
        assert_eq!(controller.in_flight(), 0);
    }

    #[test]
    fn rejected_maps_to_resource_exhausted() {
        let status = Status::from(Rejected);
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(status.message(), "concurrent request limit reached");
    }
}

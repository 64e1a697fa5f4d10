//! Standalone health reporting endpoint.
//!
//! [`HealthEndpoint`] runs its own gRPC server exposing the standard
//! `grpc.health.v1.Health` service plus reflection. It starts out
//! `NOT_SERVING`, toggles between `SERVING` and `NOT_SERVING` through
//! [`serving`](HealthEndpoint::serving) and
//! [`not_serving`](HealthEndpoint::not_serving), and stops for good on
//! [`shutdown`](HealthEndpoint::shutdown).
//!
//! It shares nothing with the main server; the owning process starts and stops
//! the two together.

use crate::server::{
    chain::Chain,
    error::{Result, StartupError},
    layer::InterceptorLayer,
};
use std::net::SocketAddr;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::{ServingStatus, server::HealthReporter};

/// The overall server status is reported under the empty service name.
const OVERALL: &str = "";

pub struct HealthEndpoint {
    reporter: HealthReporter,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<core::result::Result<(), tonic::transport::Error>>,
}

impl HealthEndpoint {
    /// Binds `addr` and starts serving health checks as `NOT_SERVING`.
    ///
    /// # Errors
    ///
    /// - [`StartupError::ListenerBind`] if `addr` cannot be bound.
    /// - [`StartupError::Reflection`] if the reflection service fails to build.
    pub async fn start(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::ListenerBind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::ListenerBind { addr, source })?;

        let (reporter, health_service) = tonic_health::server::health_reporter();
        reporter
            .set_service_status(OVERALL, ServingStatus::NotServing)
            .await;

        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
            .build_v1()?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(
            Server::builder()
                .layer(InterceptorLayer::new(Chain::health()))
                .add_service(health_service)
                .add_service(reflection)
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    signal.cancelled_owned(),
                ),
        );

        tracing::info!(%local_addr, "health endpoint listening");

        Ok(Self {
            reporter,
            local_addr,
            shutdown,
            task,
        })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serving(&self) {
        self.reporter
            .set_service_status(OVERALL, ServingStatus::Serving)
            .await;
        tracing::info!("health status: serving");
    }

    pub async fn not_serving(&self) {
        self.reporter
            .set_service_status(OVERALL, ServingStatus::NotServing)
            .await;
        tracing::info!("health status: not serving");
    }

    /// Stops accepting health checks and waits for the listener to close.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        match self.task.await {
            Ok(Ok(())) => tracing::info!("health endpoint stopped"),
            Ok(Err(err)) => tracing::error!(%err, "health endpoint failed"),
            Err(err) => tracing::error!(%err, "health endpoint task aborted"),
        }
    }
}

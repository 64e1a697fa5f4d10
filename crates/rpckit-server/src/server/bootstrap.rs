//! Server bootstrap.
//!
//! A server moves through `Unconfigured -> Configured -> Listening ->
//! Draining -> Stopped`. The first three are distinct types, so the order
//! is enforced by the compiler:
//!
//! - [`Unconfigured::configure`] installs telemetry, builds the interceptor
//!   chain and resolves TLS credentials.
//! - [`Configured::listen`] runs the caller's registration function and binds
//!   the listener. Either failing is fatal.
//! - [`Listening::serve`] serves until the shutdown token is cancelled, then
//!   drains: new connections are refused while in-flight calls finish. Once
//!   drained the telemetry providers are flushed and the server is stopped.
//!
//! [`run_grpc_server`] and [`run_grpc_server_with_health`] chain the three
//! steps for the common case.

use crate::server::{
    admission::{AdmissionController, ConcurrencySink},
    chain::Chain,
    config::ServerConfig,
    error::{Result, StartupError},
    health::HealthEndpoint,
    layer::{GrpcResponse, InterceptorLayer},
    telemetry::{TelemetryProviders, init_telemetry},
    tls::CredentialBundle,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{
    service::{Routes, RoutesBuilder},
    transport::{Server, ServerTlsConfig},
};

/// A server that has not been configured yet.
pub struct Unconfigured {
    config: ServerConfig,
    descriptor_sets: Vec<&'static [u8]>,
    credentials: Option<CredentialBundle>,
    sink: Option<Arc<dyn ConcurrencySink>>,
}

impl Unconfigured {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            descriptor_sets: Vec::new(),
            credentials: None,
            sink: None,
        }
    }

    /// Exposes the services in an encoded `FileDescriptorSet` through
    /// reflection.
    #[must_use]
    pub fn with_file_descriptor_set(mut self, set: &'static [u8]) -> Self {
        self.descriptor_sets.push(set);
        self
    }

    /// Serves TLS with `credentials`, regardless of the configured source.
    #[must_use]
    pub fn with_credentials(mut self, credentials: CredentialBundle) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Publishes in-flight counts to `sink` instead of the metrics gauge.
    #[must_use]
    pub fn with_concurrency_sink(mut self, sink: Arc<dyn ConcurrencySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// # Errors
    ///
    /// - [`StartupError::ExporterInit`] if a telemetry exporter cannot be
    ///   built.
    /// - [`StartupError::Tls`] if credentials cannot be loaded or generated.
    pub async fn configure(self) -> Result<Configured> {
        let providers = init_telemetry(&self.config.telemetry)?;

        let credentials = match self.credentials {
            Some(credentials) => Some(credentials),
            None => match CredentialBundle::from_source(&self.config.tls).await {
                Ok(credentials) => credentials,
                Err(err) => {
                    providers.shutdown();
                    return Err(err);
                }
            },
        };

        let max = self.config.max_concurrent_requests;
        let admission = Arc::new(match self.sink {
            Some(sink) => AdmissionController::with_sink(max, sink),
            None => AdmissionController::new(max),
        });
        let chain = Chain::standard(&self.config, Arc::clone(&admission));

        if cfg!(debug_assertions) {
            tracing::info!(config = ?self.config, "configured server");
        } else {
            tracing::info!(
                max_concurrent_requests = max,
                tls = credentials.is_some(),
                auth_disabled = self.config.auth.disabled,
                "configured server"
            );
        }

        Ok(Configured {
            listen_addr: self.config.listen_addr,
            chain,
            admission,
            tls: credentials.as_ref().map(CredentialBundle::server_tls_config),
            providers,
            descriptor_sets: self.descriptor_sets,
        })
    }
}

/// A configured server, ready to register services and bind.
pub struct Configured {
    listen_addr: SocketAddr,
    chain: Chain<GrpcResponse>,
    admission: Arc<AdmissionController>,
    tls: Option<ServerTlsConfig>,
    providers: TelemetryProviders,
    descriptor_sets: Vec<&'static [u8]>,
}

impl Configured {
    /// Registers services with `register`, adds reflection and binds the
    /// listener.
    ///
    /// # Errors
    ///
    /// - [`StartupError::Registration`] if `register` fails.
    /// - [`StartupError::Reflection`] if a descriptor set is invalid.
    /// - [`StartupError::ListenerBind`] if the address cannot be bound.
    pub async fn listen<F>(self, register: F) -> Result<Listening>
    where
        F: FnOnce(&mut RoutesBuilder) -> anyhow::Result<()>,
    {
        match self.prepare(register).await {
            Ok((routes, listener, local_addr)) => {
                tracing::info!(%local_addr, "listening");
                Ok(Listening {
                    local_addr,
                    listener,
                    routes,
                    chain: self.chain,
                    admission: self.admission,
                    tls: self.tls,
                    providers: self.providers,
                })
            }
            Err(err) => {
                self.providers.shutdown();
                Err(err)
            }
        }
    }

    async fn prepare<F>(&self, register: F) -> Result<(Routes, TcpListener, SocketAddr)>
    where
        F: FnOnce(&mut RoutesBuilder) -> anyhow::Result<()>,
    {
        let mut routes = RoutesBuilder::default();
        register(&mut routes).map_err(StartupError::Registration)?;

        let reflection = self
            .descriptor_sets
            .iter()
            .copied()
            .fold(
                tonic_reflection::server::Builder::configure()
                    .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET),
                |builder, set| builder.register_encoded_file_descriptor_set(set),
            )
            .build_v1()?;
        routes.add_service(reflection);

        let addr = self.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::ListenerBind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::ListenerBind { addr, source })?;

        Ok((routes.routes(), listener, local_addr))
    }
}

/// A bound server that has not started serving.
pub struct Listening {
    local_addr: SocketAddr,
    listener: TcpListener,
    routes: Routes,
    chain: Chain<GrpcResponse>,
    admission: Arc<AdmissionController>,
    tls: Option<ServerTlsConfig>,
    providers: TelemetryProviders,
}

impl Listening {
    /// The bound address, useful when listening on port `0`.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves until `shutdown` is cancelled, then drains and stops.
    ///
    /// # Errors
    ///
    /// [`StartupError::Tls`] if the TLS configuration is rejected, or
    /// [`StartupError::Transport`] if the server fails while serving.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            local_addr,
            listener,
            routes,
            chain,
            admission,
            tls,
            providers,
        } = self;

        let result = async move {
            let mut server = Server::builder();
            if let Some(tls) = tls {
                server = server.tls_config(tls).map_err(StartupError::tls)?;
            }

            let drain = async move {
                shutdown.cancelled().await;
                tracing::info!(in_flight = admission.in_flight(), "draining");
            };

            server
                .layer(InterceptorLayer::new(chain))
                .add_routes(routes)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), drain)
                .await?;
            Ok::<(), StartupError>(())
        }
        .await;

        tracing::info!(%local_addr, "server stopped");
        providers.shutdown();
        result
    }
}

/// Cancels `token` on Ctrl+C or SIGTERM.
///
/// The returned task also finishes if `token` is cancelled elsewhere.
pub fn trap_signals(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        tokio::select! {
            () = ctrl_c => tracing::info!("received Ctrl+C signal"),
            () = terminate => tracing::info!("received SIGTERM signal"),
            () = token.cancelled() => return,
        }

        token.cancel();
    })
}

/// Configures, binds and serves a server until `shutdown` is cancelled.
///
/// # Errors
///
/// Any [`StartupError`] from the bootstrap steps.
pub async fn run_grpc_server<F>(
    config: ServerConfig,
    shutdown: CancellationToken,
    register: F,
) -> Result<()>
where
    F: FnOnce(&mut RoutesBuilder) -> anyhow::Result<()>,
{
    Unconfigured::new(config)
        .configure()
        .await?
        .listen(register)
        .await?
        .serve(shutdown)
        .await
}

/// Like [`run_grpc_server`], with a [`HealthEndpoint`] on
/// `config.health_addr` that reports `SERVING` while the main listener is up.
///
/// # Errors
///
/// Any [`StartupError`] from the bootstrap steps or from binding the health
/// listener.
pub async fn run_grpc_server_with_health<F>(
    config: ServerConfig,
    shutdown: CancellationToken,
    register: F,
) -> Result<()>
where
    F: FnOnce(&mut RoutesBuilder) -> anyhow::Result<()>,
{
    let health = HealthEndpoint::start(config.health_addr).await?;

    let result = async {
        let listening = Unconfigured::new(config)
            .configure()
            .await?
            .listen(register)
            .await?;
        health.serving().await;
        listening.serve(shutdown).await
    }
    .await;

    health.not_serving().await;
    health.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        admission::tests::RecordingSink,
        health::tests::{check, client},
    };
    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use rpckit_core::claims::{CONNECTION_CLAIM, TENANT_CLAIM};
    use serde_json::json;
    use std::time::Duration;
    use tonic::{
        Code,
        transport::{Certificate, Channel, ClientTlsConfig},
    };
    use tonic_health::pb::{
        HealthCheckRequest, health_check_response::ServingStatus as Reported,
        health_client::HealthClient,
    };

    fn register_health(routes: &mut RoutesBuilder) -> anyhow::Result<()> {
        let (_reporter, service) = tonic_health::server::health_reporter();
        routes.add_service(service);
        Ok(())
    }

    async fn start(config: ServerConfig) -> (SocketAddr, CancellationToken, JoinHandle<Result<()>>) {
        let listening = Unconfigured::new(config)
            .configure()
            .await
            .unwrap()
            .listen(register_health)
            .await
            .unwrap();
        let addr = listening.local_addr();
        let token = CancellationToken::new();
        let task = tokio::spawn(listening.serve(token.clone()));
        (addr, token, task)
    }

    fn authorized<T>(message: T, authorization: &str) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request
            .metadata_mut()
            .insert("authorization", authorization.parse().unwrap());
        request
    }

    fn valid_bearer() -> String {
        let claims = json!({
            "sub": "auth0|tester",
            "scope": "read",
            TENANT_CLAIM: "acme",
            CONNECTION_CLAIM: "conn",
        });
        format!(
            "bearer e30.{}.c2ln",
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    fn overall() -> HealthCheckRequest {
        HealthCheckRequest {
            service: String::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_with_development_identity() {
        let mut config = ServerConfig::for_tests();
        config.auth.disabled = true;
        let (addr, token, task) = start(config).await;

        let mut client = client(addr).await;
        assert_eq!(check(&mut client).await.unwrap(), Reported::Serving);

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unauthenticated_without_bearer() {
        let (addr, token, task) = start(ServerConfig::for_tests()).await;
        let mut client = client(addr).await;

        let status = check(&mut client).await.unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
        assert_eq!(status.message(), "request unauthenticated with bearer");

        let response = client
            .check(authorized(overall(), &valid_bearer()))
            .await
            .unwrap();
        assert_eq!(response.into_inner().status(), Reported::Serving);

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admission_rejects_before_auth_and_streams_hold_slots() {
        let mut config = ServerConfig::for_tests();
        config.max_concurrent_requests = 1;
        let sink = Arc::new(RecordingSink::default());

        let listening = Unconfigured::new(config)
            .with_concurrency_sink(sink.clone())
            .configure()
            .await
            .unwrap()
            .listen(register_health)
            .await
            .unwrap();
        let addr = listening.local_addr();
        let token = CancellationToken::new();
        let task = tokio::spawn(listening.serve(token.clone()));
        let mut client = client(addr).await;

        // A watch stream occupies the only slot for as long as it is open.
        let mut watch = client
            .watch(authorized(overall(), &valid_bearer()))
            .await
            .unwrap()
            .into_inner();
        let first = watch.message().await.unwrap().unwrap();
        assert_eq!(first.status(), Reported::Serving);

        let status = client
            .check(authorized(overall(), "bearer not-a-token"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::ResourceExhausted);

        drop(watch);
        let mut admitted = false;
        for _ in 0..100 {
            if client
                .check(authorized(overall(), &valid_bearer()))
                .await
                .is_ok()
            {
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(admitted, "slot was never released after the stream closed");

        token.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(sink.values().last(), Some(&0));
    }

    #[tokio::test]
    async fn registration_failure_is_fatal() {
        let err = Unconfigured::new(ServerConfig::for_tests())
            .configure()
            .await
            .unwrap()
            .listen(|_| Err(anyhow::anyhow!("duplicate service")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::Registration(_)));
        assert!(err.to_string().contains("duplicate service"));
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ServerConfig::for_tests();
        config.listen_addr = taken.local_addr().unwrap();

        let err = Unconfigured::new(config)
            .configure()
            .await
            .unwrap()
            .listen(register_health)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::ListenerBind { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_with_health_returns_once_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        run_grpc_server_with_health(ServerConfig::for_tests(), token, register_health)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_tls_with_generated_credentials() {
        let credentials = CredentialBundle::generate_self_signed().unwrap();
        let listening = Unconfigured::new(ServerConfig::for_tests())
            .with_credentials(credentials.clone())
            .configure()
            .await
            .unwrap()
            .listen(register_health)
            .await
            .unwrap();
        let addr = listening.local_addr();
        let token = CancellationToken::new();
        let task = tokio::spawn(listening.serve(token.clone()));

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(credentials.cert_pem()))
            .domain_name("localhost");
        let channel = Channel::from_shared(format!("https://{addr}"))
            .unwrap()
            .tls_config(tls)
            .unwrap()
            .connect()
            .await
            .unwrap();
        let mut client = HealthClient::new(channel);

        let response = client
            .check(authorized(overall(), &valid_bearer()))
            .await
            .unwrap();
        assert_eq!(response.into_inner().status(), Reported::Serving);
        drop(client);

        token.cancel();
        task.await.unwrap().unwrap();
    }
}

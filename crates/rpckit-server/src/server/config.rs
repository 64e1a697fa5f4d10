use anyhow::bail;
use clap::Parser;
use rpckit_core::{AuthConfig, DevIdentityDefaults};
use std::{net::SocketAddr, path::PathBuf};

/// Runtime configuration for the `rpckit-server` binary.
///
/// Every flag can also be supplied through its environment variable, and a
/// `.env` file in the working directory is loaded before parsing. The parsed
/// arguments are validated once into a [`ServerConfig`], which is then handed
/// to every component that needs it.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "rpckit-server",
    version,
    about = "A gRPC server with tenant authentication, admission control and health reporting"
)]
pub struct CliArgs {
    /// Name reported to tracing and metrics backends.
    ///
    /// Environment variable: `SERVICE_NAME`
    #[arg(long, env = "SERVICE_NAME", default_value_t = String::from("rpckit"))]
    pub service_name: String,

    /// Static label attached to every call's observability tags.
    ///
    /// Defaults to the service name when unset.
    ///
    /// Environment variable: `SERVICE_LABEL`
    #[arg(long, env = "SERVICE_LABEL")]
    pub service_label: Option<String>,

    /// Address of the main gRPC listener.
    ///
    /// Environment variable: `GRPC_LISTEN_ADDR`
    #[arg(long, env = "GRPC_LISTEN_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], 8080)))]
    pub listen_addr: SocketAddr,

    /// Address of the standalone health listener.
    ///
    /// Environment variable: `GRPC_HEALTH_ADDR`
    #[arg(long, env = "GRPC_HEALTH_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], 8081)))]
    pub health_addr: SocketAddr,

    /// Maximum number of calls in flight at once. `0` disables the limit.
    ///
    /// Calls arriving while the limit is reached are rejected immediately with
    /// `RESOURCE_EXHAUSTED`; they never wait for a slot.
    ///
    /// Environment variable: `GRPC_MAX_CONCURRENT_REQUESTS`
    #[arg(long, env = "GRPC_MAX_CONCURRENT_REQUESTS", default_value_t = 0)]
    pub max_concurrent_requests: usize,

    /// Serve the main listener over TLS.
    ///
    /// Environment variable: `GRPC_TLS_ENABLED`
    #[arg(long, env = "GRPC_TLS_ENABLED")]
    pub tls_enabled: bool,

    /// PEM certificate chain. A self-signed certificate is generated when TLS
    /// is enabled without one.
    ///
    /// Environment variable: `GRPC_TLS_CERT`
    #[arg(long, env = "GRPC_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `--tls-cert`.
    ///
    /// Environment variable: `GRPC_TLS_KEY`
    #[arg(long, env = "GRPC_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Skip bearer authentication and attach a development identity to every
    /// call instead.
    ///
    /// Environment variable: `AUTH_DISABLED`
    #[arg(long, env = "AUTH_DISABLED")]
    pub auth_disabled: bool,

    /// Environment variable: `AUTH_DEV_TENANT`
    #[arg(long, env = "AUTH_DEV_TENANT", default_value_t = String::from("ACME"))]
    pub dev_tenant: String,

    /// Environment variable: `AUTH_DEV_USER`
    #[arg(long, env = "AUTH_DEV_USER", default_value_t = String::from("zcuser@acme.example.com"))]
    pub dev_user: String,

    /// Environment variable: `AUTH_DEV_EMAIL`
    #[arg(long, env = "AUTH_DEV_EMAIL", default_value_t = String::from("zcuser@acme.example.com"))]
    pub dev_email: String,

    /// Environment variable: `AUTH_DEV_CONNECTION`
    #[arg(long, env = "AUTH_DEV_CONNECTION", default_value_t = String::new())]
    pub dev_connection: String,

    /// Comma-separated scopes granted to the development identity.
    ///
    /// Environment variable: `AUTH_DEV_SCOPES`
    #[arg(long, env = "AUTH_DEV_SCOPES", value_delimiter = ',')]
    pub dev_scopes: Vec<String>,

    /// Comma-separated groups of the development identity.
    ///
    /// Environment variable: `AUTH_DEV_GROUPS`
    #[arg(long, env = "AUTH_DEV_GROUPS", value_delimiter = ',')]
    pub dev_groups: Vec<String>,

    /// Comma-separated roles of the development identity.
    ///
    /// Environment variable: `AUTH_DEV_ROLES`
    #[arg(long, env = "AUTH_DEV_ROLES", value_delimiter = ',')]
    pub dev_roles: Vec<String>,

    /// Environment variable: `AUTH_DEV_CLIENTID`
    #[arg(long, env = "AUTH_DEV_CLIENTID", default_value_t = String::from("0123456789abcdef"))]
    pub dev_client_id: String,

    /// Export spans through OpenTelemetry.
    ///
    /// Environment variable: `TRACING_ENABLED`
    #[arg(long, env = "TRACING_ENABLED")]
    pub tracing_enabled: bool,

    /// Fraction of root traces to sample, between `0.0` and `1.0`.
    ///
    /// Environment variable: `TRACING_SAMPLE_RATE`
    #[arg(long, env = "TRACING_SAMPLE_RATE", default_value_t = 1.0)]
    pub tracing_sample_rate: f64,

    /// Export metrics through OpenTelemetry.
    ///
    /// Environment variable: `METRICS_ENABLED`
    #[arg(long, env = "METRICS_ENABLED")]
    pub metrics_enabled: bool,

    /// Request continuous profiling. Best-effort.
    ///
    /// Environment variable: `PROFILING_ENABLED`
    #[arg(long, env = "PROFILING_ENABLED")]
    pub profiling_enabled: bool,

    /// Default log filter, used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `LOG_LEVEL`
    #[arg(long, env = "LOG_LEVEL", default_value_t = String::from("info"))]
    pub log_level: String,

    /// Emit logs as JSON lines instead of pretty text.
    ///
    /// Environment variable: `LOG_JSON`
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    /// OTLP collector endpoint. Only used with the `otlp` feature.
    ///
    /// Environment variable: `OTLP_ENDPOINT`
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

/// Telemetry settings consumed by [`crate::server::telemetry`].
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub tracing_enabled: bool,
    pub sample_rate: f64,
    pub metrics_enabled: bool,
    pub profiling_enabled: bool,
    pub log_level: String,
    pub log_json: bool,
    pub otlp_endpoint: Option<String>,
}

/// Where the TLS credential bundle comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsSource {
    Disabled,
    /// Generate a self-signed bundle at startup.
    SelfSigned,
    Files { cert: PathBuf, key: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service_label: String,
    pub listen_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub max_concurrent_requests: usize,
    pub tls: TlsSource,
    pub auth: AuthConfig,
    pub telemetry: TelemetryConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&args.tracing_sample_rate) {
            bail!(
                "TRACING_SAMPLE_RATE ({}) must be between 0.0 and 1.0",
                args.tracing_sample_rate
            );
        }

        if args.listen_addr == args.health_addr && args.listen_addr.port() != 0 {
            bail!(
                "GRPC_LISTEN_ADDR and GRPC_HEALTH_ADDR must differ (both {})",
                args.listen_addr
            );
        }

        let tls = match (args.tls_enabled, args.tls_cert, args.tls_key) {
            (false, _, _) => TlsSource::Disabled,
            (true, None, None) => TlsSource::SelfSigned,
            (true, Some(cert), Some(key)) => TlsSource::Files { cert, key },
            (true, _, _) => bail!("GRPC_TLS_CERT and GRPC_TLS_KEY must be provided together"),
        };

        let service_label = args
            .service_label
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| args.service_name.clone());

        Ok(Self {
            service_label,
            listen_addr: args.listen_addr,
            health_addr: args.health_addr,
            max_concurrent_requests: args.max_concurrent_requests,
            tls,
            auth: AuthConfig {
                disabled: args.auth_disabled,
                dev: DevIdentityDefaults {
                    tenant: args.dev_tenant,
                    user: args.dev_user,
                    email: args.dev_email,
                    connection: args.dev_connection,
                    scopes: args.dev_scopes,
                    groups: args.dev_groups,
                    roles: args.dev_roles,
                    client_id: args.dev_client_id,
                },
            },
            telemetry: TelemetryConfig {
                service_name: args.service_name,
                tracing_enabled: args.tracing_enabled,
                sample_rate: args.tracing_sample_rate,
                metrics_enabled: args.metrics_enabled,
                profiling_enabled: args.profiling_enabled,
                log_level: args.log_level,
                log_json: args.log_json,
                otlp_endpoint: args.otlp_endpoint,
            },
        })
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Loopback configuration with ephemeral ports and telemetry off.
    pub(crate) fn for_tests() -> Self {
        Self::try_from(parse(&["--listen-addr", "127.0.0.1:0", "--health-addr", "127.0.0.1:0"]))
            .unwrap()
    }
}

#[cfg(test)]
fn parse(args: &[&str]) -> CliArgs {
    CliArgs::try_parse_from(std::iter::once("rpckit-server").chain(args.iter().copied())).unwrap()
}

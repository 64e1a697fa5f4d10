//! Startup-time failures.
//!
//! Every variant is fatal: the bootstrap returns it before serving begins and
//! the process exits. Call-time failures never use this type; they are
//! `tonic::Status` values produced by the interceptor stages.

use std::net::SocketAddr;

pub type Result<T> = core::result::Result<T, StartupError>;

#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    /// The main or health listener could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The caller's registration function failed.
    #[error("service registration failed: {0:#}")]
    Registration(anyhow::Error),

    /// A tracing or metrics exporter could not be built.
    #[error("failed to initialize {signal} exporter: {reason}")]
    ExporterInit {
        signal: &'static str,
        reason: String,
    },

    /// The TLS credential bundle could not be loaded, generated or applied.
    #[error("tls: {reason}")]
    Tls { reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
}

impl StartupError {
    pub(crate) fn tls(reason: impl ToString) -> Self {
        Self::Tls {
            reason: reason.to_string(),
        }
    }

    #[cfg(feature = "otlp")]
    pub(crate) fn exporter(signal: &'static str, reason: impl ToString) -> Self {
        Self::ExporterInit {
            signal,
            reason: reason.to_string(),
        }
    }
}

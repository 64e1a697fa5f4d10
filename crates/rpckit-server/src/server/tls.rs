//! TLS credential bundle for the main listener.

use crate::server::{
    config::TlsSource,
    error::{Result, StartupError},
};
use rcgen::{CertificateParams, DnType, KeyPair};
use std::path::Path;
use tonic::transport::{Identity, ServerTlsConfig};

/// Names the generated certificate is valid for.
const SELF_SIGNED_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

/// A PEM certificate chain and its private key.
#[derive(Clone)]
pub struct CredentialBundle {
    cert_pem: String,
    key_pem: String,
}

impl CredentialBundle {
    pub fn from_pem(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Reads both PEM files.
    pub async fn load(cert: &Path, key: &Path) -> Result<Self> {
        let read = |path: &Path| {
            let path = path.to_owned();
            async move {
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| StartupError::tls(format!("reading {}: {e}", path.display())))
            }
        };

        Ok(Self::from_pem(read(cert).await?, read(key).await?))
    }

    /// Generates a throwaway self-signed certificate for `localhost`.
    ///
    /// Only suitable for development; clients must skip verification or trust
    /// [`Self::cert_pem`] explicitly.
    pub fn generate_self_signed() -> Result<Self> {
        let key = KeyPair::generate().map_err(StartupError::tls)?;
        let mut params = CertificateParams::new(
            SELF_SIGNED_NAMES
                .iter()
                .map(|name| (*name).to_owned())
                .collect::<Vec<_>>(),
        )
        .map_err(StartupError::tls)?;
        params
            .distinguished_name
            .push(DnType::CommonName, "rpckit self-signed");

        let cert = params.self_signed(&key).map_err(StartupError::tls)?;
        tracing::warn!("serving with a generated self-signed certificate");

        Ok(Self::from_pem(cert.pem(), key.serialize_pem()))
    }

    /// Resolves the bundle described by `source`, `None` when TLS is off.
    pub async fn from_source(source: &TlsSource) -> Result<Option<Self>> {
        match source {
            TlsSource::Disabled => Ok(None),
            TlsSource::SelfSigned => Self::generate_self_signed().map(Some),
            TlsSource::Files { cert, key } => Self::load(cert, key).await.map(Some),
        }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new().identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
    }
}

impl core::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

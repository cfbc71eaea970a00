//! TLS client configuration
//!
//! The policy is fixed: TLS 1.2 or 1.3, server certificate verified against
//! the configured root(s), server name taken from the original hostname.
//! There is no switch to disable verification.

use crate::config::CertSource;
use crate::error::ResolutionError;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::Item;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Compiled TLS client configuration
#[derive(Clone)]
pub struct TlsConfig {
    /// Where the roots came from, for diagnostics
    origin: String,
    /// Number of trust anchors loaded
    anchors: usize,
    /// Compiled rustls ClientConfig
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Build from a [`CertSource`]
    pub fn from_source(source: &CertSource) -> Result<Self, ResolutionError> {
        match source {
            CertSource::Path(path) => Self::from_pem_file(path),
            CertSource::Pem(bytes) => Self::from_pem(bytes, "inline PEM"),
            CertSource::System => Self::system(),
        }
    }

    /// Trust the certificates in a PEM file
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, ResolutionError> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let data = fs::read(path).map_err(|e| ResolutionError::CertificateLoad {
            origin: origin.clone(),
            reason: e.to_string(),
        })?;
        Self::from_pem(&data, &origin)
    }

    /// Trust the certificates in a PEM buffer
    pub fn from_pem(pem: &[u8], origin: &str) -> Result<Self, ResolutionError> {
        let certs = parse_pem_certificates(pem).map_err(|reason| {
            ResolutionError::CertificateLoad {
                origin: origin.to_string(),
                reason,
            }
        })?;

        let mut store = RootCertStore::empty();
        let (added, _ignored) = store.add_parsable_certificates(certs);
        if added == 0 {
            return Err(ResolutionError::CertificateLoad {
                origin: origin.to_string(),
                reason: "no usable certificate in PEM data".into(),
            });
        }

        Self::with_roots(store, origin)
    }

    /// Trust the platform certificate store
    pub fn system() -> Result<Self, ResolutionError> {
        let result = rustls_native_certs::load_native_certs();

        let mut store = RootCertStore::empty();
        let (added, _ignored) = store.add_parsable_certificates(result.certs);
        if added == 0 {
            let reason = result
                .errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "platform trust store is empty".to_string());
            return Err(ResolutionError::CertificateLoad {
                origin: "system trust store".into(),
                reason,
            });
        }

        Self::with_roots(store, "system trust store")
    }

    fn with_roots(store: RootCertStore, origin: &str) -> Result<Self, ResolutionError> {
        let anchors = store.len();
        let client_config = ClientConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_root_certificates(store)
        .with_no_client_auth();

        Ok(TlsConfig {
            origin: origin.to_string(),
            anchors,
            client_config: Arc::new(client_config),
        })
    }

    /// The rustls ClientConfig
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Number of trust anchors
    pub fn anchors(&self) -> usize {
        self.anchors
    }

    /// Where the roots came from
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("origin", &self.origin)
            .field("anchors", &self.anchors)
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

fn parse_pem_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, String> {
    let mut reader = std::io::Cursor::new(pem);
    let mut certs = Vec::new();

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => certs.push(cert),
            // Keys and CRLs bundled alongside are ignored
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => return Err(format!("invalid PEM: {}", e)),
        }
    }

    if certs.is_empty() {
        return Err("no certificate found in PEM data".into());
    }
    Ok(certs)
}

/// TLS server name (SNI + verification) for the original hostname
pub fn server_name(host: &str) -> Result<ServerName<'static>, ResolutionError> {
    let trimmed = host.trim_end_matches('.');
    if trimmed.is_empty() || trimmed.len() > 253 {
        return Err(ResolutionError::InvalidServerName {
            host: host.to_string(),
        });
    }
    ServerName::try_from(trimmed.to_string()).map_err(|_| ResolutionError::InvalidServerName {
        host: host.to_string(),
    })
}

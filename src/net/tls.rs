//! TLS configuration and certificate loading.
//!
//! Material is read once at startup and shared by every TLS listener; each
//! listener builds its own rustls config from it depending on its mode.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;

use crate::config::{TlsConfig, TlsMode};

/// Errors raised while loading certificates or building a TLS config.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("client CA bundle is required for mutual TLS")]
    MissingClientCa,

    #[error("invalid client CA certificate in {path}: {source}")]
    InvalidClientCa {
        path: String,
        #[source]
        source: rustls::Error,
    },

    #[error("client verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("listener mode {0} does not use TLS")]
    NotTls(TlsMode),

    #[error("no TLS material configured")]
    MissingMaterial,
}

/// Certificates, private key and optional client CAs.
#[derive(Debug)]
pub struct TlsMaterial {
    certificates: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_cas: Option<Arc<RootCertStore>>,
}

impl TlsMaterial {
    /// Load material from the PEM files named in the config.
    pub fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let certificates = read_certificates(Path::new(&config.cert_path))?;
        if certificates.is_empty() {
            return Err(TlsError::NoCertificates(config.cert_path.clone()));
        }

        let key = read_private_key(Path::new(&config.key_path))?
            .ok_or_else(|| TlsError::NoPrivateKey(config.key_path.clone()))?;

        let client_cas = match &config.client_ca_path {
            Some(path) => Some(Arc::new(read_root_store(path)?)),
            None => None,
        };

        tracing::info!(
            cert_path = %config.cert_path,
            certificates = certificates.len(),
            client_cas = client_cas.as_ref().map(|r| r.len()).unwrap_or(0),
            "TLS material loaded"
        );

        Ok(Self {
            certificates,
            key,
            client_cas,
        })
    }

    /// Number of certificates in the served chain.
    pub fn chain_len(&self) -> usize {
        self.certificates.len()
    }

    pub fn has_client_cas(&self) -> bool {
        self.client_cas.is_some()
    }

    /// Build the rustls config for a listener in the given mode.
    ///
    /// `Server` presents the certificate chain without asking for a client
    /// certificate. `Mutual` additionally requires a client certificate
    /// that chains to one of the configured client CAs.
    pub fn server_config(&self, mode: TlsMode) -> Result<RustlsConfig, TlsError> {
        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let builder = match mode {
            TlsMode::None => return Err(TlsError::NotTls(mode)),
            TlsMode::Server => builder.with_no_client_auth(),
            TlsMode::Mutual => {
                let roots = self.client_cas.clone().ok_or(TlsError::MissingClientCa)?;
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider).build()?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut config = builder.with_single_cert(self.certificates.clone(), self.key.clone_key())?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(RustlsConfig::from_config(Arc::new(config)))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.display().to_string(),
            source,
        })
}

fn read_private_key(path: &Path) -> Result<Option<PrivateKeyDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn read_root_store(path: &str) -> Result<RootCertStore, TlsError> {
    let certificates = read_certificates(Path::new(path))?;
    if certificates.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }

    let mut roots = RootCertStore::empty();
    for cert in certificates {
        roots.add(cert).map_err(|source| TlsError::InvalidClientCa {
            path: path.to_string(),
            source,
        })?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    fn fixture_config() -> TlsConfig {
        TlsConfig {
            cert_path: fixture("server.pem"),
            key_path: fixture("server.key"),
            client_ca_path: Some(fixture("ca.pem")),
        }
    }

    #[test]
    fn loads_fixture_material() {
        let material = TlsMaterial::load(&fixture_config()).unwrap();
        assert_eq!(material.chain_len(), 1);
        assert!(material.has_client_cas());
    }

    #[test]
    fn builds_server_and_mutual_configs() {
        let material = TlsMaterial::load(&fixture_config()).unwrap();
        assert!(material.server_config(TlsMode::Server).is_ok());
        assert!(material.server_config(TlsMode::Mutual).is_ok());
        assert!(matches!(
            material.server_config(TlsMode::None),
            Err(TlsError::NotTls(TlsMode::None))
        ));
    }

    #[test]
    fn mutual_without_client_cas_fails() {
        let mut config = fixture_config();
        config.client_ca_path = None;
        let material = TlsMaterial::load(&config).unwrap();
        assert!(matches!(
            material.server_config(TlsMode::Mutual),
            Err(TlsError::MissingClientCa)
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        let mut config = fixture_config();
        config.cert_path = fixture("does-not-exist.pem");
        assert!(matches!(TlsMaterial::load(&config), Err(TlsError::Read { .. })));
    }

    #[test]
    fn certificate_is_not_a_key() {
        let mut config = fixture_config();
        config.key_path = fixture("server.pem");
        assert!(matches!(TlsMaterial::load(&config), Err(TlsError::NoPrivateKey(_))));
    }
}

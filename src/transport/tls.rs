//! TLS client setup
//!
//! Builds a `TlsConnector` from PEM files. The server is verified against
//! the bundled web PKI roots plus an optional extra CA; `insecure` disables
//! verification entirely.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use serde::Deserialize;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// TLS settings for the broker connection
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// Path to an additional CA certificate file (PEM format)
    pub ca_cert: Option<String>,

    /// Path to client certificate file (PEM format)
    pub client_cert: Option<String>,

    /// Path to client private key file (PEM format)
    pub client_key: Option<String>,

    /// Skip server certificate verification (insecure, for testing only)
    #[serde(default)]
    pub insecure: bool,

    /// Server name for SNI (defaults to the broker host)
    pub server_name: Option<String>,
}

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    let certs = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKeyError(format!("Failed to parse private key: {}", e)))
}

impl TlsConfig {
    /// Build a connector for this configuration
    pub fn connector(&self) -> Result<TlsConnector, TlsError> {
        let builder = if self.insecure {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        } else {
            let mut roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.into(),
            };
            if let Some(ca_path) = &self.ca_cert {
                for cert in load_certs(ca_path)? {
                    roots.add(cert).map_err(|e| {
                        TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
                    })?;
                }
            }
            ClientConfig::builder().with_root_certificates(roots)
        };

        let config = match (&self.client_cert, &self.client_key) {
            (Some(cert_path), Some(key_path)) => builder
                .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
                .map_err(|e| TlsError::ConfigError(format!("Invalid client certificate: {}", e)))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(TlsError::ConfigError(
                    "client_cert and client_key must be set together".to_string(),
                ))
            }
        };

        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// Name presented for SNI and certificate verification
    pub fn server_name(&self, host: &str) -> Result<ServerName<'static>, TlsError> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string())
            .map_err(|e| TlsError::ConfigError(format!("Invalid server name '{}': {}", name, e)))
    }
}

/// Accepts any server certificate
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

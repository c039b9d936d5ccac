//! Mutual TLS for store connections.
//!
//! The client presents its certificate and validates the server certificate against a
//! custom CA bundle loaded from disk. Built-in roots are disabled so only the configured
//! CA is trusted. Chain validation is never switched off; only the hostname check may be
//! relaxed for servers whose certificate names do not match the dialed address.

use native_tls::{Certificate, Identity, TlsConnector};
use postgres_native_tls::MakeTlsConnector;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Certificate material could not be turned into a TLS context.
///
/// Fatal at startup: a process configured to require a secured channel must not
/// continue without one.
#[derive(Debug, Clone, Error)]
pub enum TlsConfigError {
    /// A required path was not configured.
    #[error("TLS error: no path configured for {what}")]
    MissingPath {
        /// Which piece of material is missing.
        what: &'static str,
    },

    /// A file could not be read.
    #[error("TLS error: failed to read {}: {message}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O message.
        message: String,
    },

    /// A file was read but did not contain usable PEM material.
    #[error("TLS error: failed to parse {}: {message}", path.display())]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying parser message.
        message: String,
    },

    /// The connector could not be built from otherwise valid material.
    #[error("TLS error: failed to build connector: {message}")]
    Connector {
        /// Underlying TLS backend message.
        message: String,
    },
}

impl TlsConfigError {
    /// Create a missing-path error.
    pub fn missing(what: &'static str) -> Self {
        Self::MissingPath { what }
    }
}

/// Paths to the material needed for mutual TLS.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// CA bundle (PEM) used to verify the server.
    pub ca_cert_path: PathBuf,
    /// Client certificate (PEM).
    pub client_cert_path: PathBuf,
    /// Client private key (PEM, PKCS#8).
    pub client_key_path: PathBuf,
    /// Whether the server certificate must also match the dialed host name.
    pub verify_hostname: bool,
}

impl TlsMaterial {
    /// Create material with hostname verification enabled.
    pub fn new(
        ca_cert_path: impl Into<PathBuf>,
        client_cert_path: impl Into<PathBuf>,
        client_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_cert_path: ca_cert_path.into(),
            client_cert_path: client_cert_path.into(),
            client_key_path: client_key_path.into(),
            verify_hostname: true,
        }
    }

    /// Set hostname verification.
    pub fn with_verify_hostname(mut self, verify: bool) -> Self {
        self.verify_hostname = verify;
        self
    }
}

/// Build a mutual-TLS connector for `tokio-postgres`.
pub fn build_mutual_tls(material: &TlsMaterial) -> Result<MakeTlsConnector, TlsConfigError> {
    let ca_pem = read_pem(&material.ca_cert_path)?;
    let ca = Certificate::from_pem(&ca_pem).map_err(|e| TlsConfigError::Parse {
        path: material.ca_cert_path.clone(),
        message: e.to_string(),
    })?;

    let cert_pem = read_pem(&material.client_cert_path)?;
    let key_pem = read_pem(&material.client_key_path)?;
    let identity = Identity::from_pkcs8(&cert_pem, &key_pem).map_err(|e| TlsConfigError::Parse {
        path: material.client_key_path.clone(),
        message: e.to_string(),
    })?;

    let connector = TlsConnector::builder()
        .add_root_certificate(ca)
        .disable_built_in_roots(true)
        .identity(identity)
        .danger_accept_invalid_hostnames(!material.verify_hostname)
        .build()
        .map_err(|e| TlsConfigError::Connector { message: e.to_string() })?;

    tracing::debug!(
        ca = %material.ca_cert_path.display(),
        verify_hostname = material.verify_hostname,
        "Mutual TLS connector built"
    );

    Ok(MakeTlsConnector::new(connector))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsConfigError> {
    let data = std::fs::read(path).map_err(|e| TlsConfigError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(TlsConfigError::Parse {
            path: path.to_path_buf(),
            message: "file is empty".to_string(),
        });
    }
    Ok(data)
}

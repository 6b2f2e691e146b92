//! TLS policy for both ends of a connection
//!
//! The connecting side picks how the server certificate is verified
//! (`ServerSslMode`) and whether it presents a certificate of its own
//! (`ClientSslMode`). The listening side holds its identity and, optionally,
//! the CA that client certificates must chain to.
//!
//! Invalid combinations are rejected by `validate` before any socket is
//! opened. Certificate files are only read when a connector or acceptor is
//! built.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Result, SyncError};

/// How the connecting side verifies the server certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSslMode {
    /// Plaintext connection
    #[default]
    Disabled,
    /// Verify against the CA file in `server_cert_path`
    CustomCa,
    /// Verify against the operating system trust store
    SystemTrust,
}

/// Whether the connecting side presents a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientSslMode {
    #[default]
    Disabled,
    /// Present the chain and key stored together in `client_cert_path`
    ClientCert,
}

/// TLS settings of a client endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub server_ssl_mode: ServerSslMode,
    #[serde(default)]
    pub server_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_ssl_mode: ClientSslMode,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
}

impl TlsSettings {
    /// No TLS at all
    pub fn plaintext() -> Self {
        Self::default()
    }

    /// Verify the server against a custom CA file
    pub fn custom_ca(ca_path: impl Into<PathBuf>) -> Self {
        Self {
            server_ssl_mode: ServerSslMode::CustomCa,
            server_cert_path: Some(ca_path.into()),
            ..Self::default()
        }
    }

    /// Verify the server against the system trust store
    pub fn system_trust() -> Self {
        Self {
            server_ssl_mode: ServerSslMode::SystemTrust,
            ..Self::default()
        }
    }

    /// Present a client certificate chain (cert and key in one PEM file)
    pub fn with_client_cert(mut self, cert_path: impl Into<PathBuf>) -> Self {
        self.client_ssl_mode = ClientSslMode::ClientCert;
        self.client_cert_path = Some(cert_path.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.server_ssl_mode != ServerSslMode::Disabled
    }

    /// Reject combinations that cannot be honored without downgrading
    pub fn validate(&self) -> Result<()> {
        if self.client_ssl_mode == ClientSslMode::ClientCert
            && self.server_ssl_mode == ServerSslMode::Disabled
        {
            return Err(SyncError::config(
                "client certificates require server-side TLS to be enabled",
            ));
        }
        if self.server_ssl_mode == ServerSslMode::CustomCa && self.server_cert_path.is_none() {
            return Err(SyncError::config(
                "custom CA mode requires a server certificate path",
            ));
        }
        if self.client_ssl_mode == ClientSslMode::ClientCert && self.client_cert_path.is_none() {
            return Err(SyncError::config(
                "client certificate mode requires a client certificate path",
            ));
        }
        Ok(())
    }

    /// Build the connector for these settings; `None` means plaintext.
    ///
    /// Unreadable certificate material fails with `ConnectionFailed`.
    pub fn connector(&self) -> Result<Option<TlsConnector>> {
        self.validate()?;

        let builder = match self.server_ssl_mode {
            ServerSslMode::Disabled => return Ok(None),
            ServerSslMode::CustomCa => {
                let ca_path = required_path(&self.server_cert_path, "server certificate")?;
                let roots = load_roots(ca_path).map_err(|e| {
                    SyncError::connection_failed(format!(
                        "cannot load CA file {}: {}",
                        ca_path.display(),
                        e
                    ))
                })?;
                tracing::debug!("Using custom CA file {}", ca_path.display());
                ClientConfig::builder().with_root_certificates(roots)
            }
            ServerSslMode::SystemTrust => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(
                    rustls_platform_verifier::Verifier::new(),
                )),
        };

        let config = match self.client_ssl_mode {
            ClientSslMode::Disabled => builder.with_no_client_auth(),
            ClientSslMode::ClientCert => {
                let cert_path = required_path(&self.client_cert_path, "client certificate")?;
                let load_failed = |e: io::Error| {
                    SyncError::connection_failed(format!(
                        "cannot load client certificate {}: {}",
                        cert_path.display(),
                        e
                    ))
                };
                let certs = load_certs(cert_path).map_err(load_failed)?;
                let key = load_private_key(cert_path).map_err(load_failed)?;
                tracing::debug!("Presenting client certificate {}", cert_path.display());
                builder.with_client_auth_cert(certs, key).map_err(|e| {
                    SyncError::connection_failed(format!("invalid client certificate: {}", e))
                })?
            }
        };

        Ok(Some(TlsConnector::from(Arc::new(config))))
    }
}

/// TLS settings of the listening server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerTls {
    /// PEM file holding the server certificate chain and private key
    #[serde(default)]
    pub server_identity_path: Option<PathBuf>,
    /// CA that client certificates must chain to; makes them mandatory
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
}

impl ListenerTls {
    pub fn plaintext() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.server_identity_path.is_some()
    }

    pub fn requires_client_cert(&self) -> bool {
        self.client_ca_path.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_ca_path.is_some() && self.server_identity_path.is_none() {
            return Err(SyncError::config(
                "client certificate verification requires server-side TLS",
            ));
        }
        Ok(())
    }

    /// Build the acceptor; `None` means plaintext
    pub fn acceptor(&self) -> Result<Option<TlsAcceptor>> {
        self.validate()?;
        let Some(identity_path) = &self.server_identity_path else {
            return Ok(None);
        };

        let certs = load_certs(identity_path).map_err(|e| {
            SyncError::config(format!(
                "cannot load server certificate {}: {}",
                identity_path.display(),
                e
            ))
        })?;
        let key = load_private_key(identity_path).map_err(|e| {
            SyncError::config(format!(
                "cannot load server key {}: {}",
                identity_path.display(),
                e
            ))
        })?;

        let builder = ServerConfig::builder();
        let builder = match &self.client_ca_path {
            None => builder.with_no_client_auth(),
            Some(ca_path) => {
                let roots = load_roots(ca_path).map_err(|e| {
                    SyncError::config(format!(
                        "cannot load client CA {}: {}",
                        ca_path.display(),
                        e
                    ))
                })?;
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| SyncError::config(format!("invalid client CA: {}", e)))?;
                builder.with_client_cert_verifier(verifier)
            }
        };
        let config = builder
            .with_single_cert(certs, key)
            .map_err(|e| SyncError::config(format!("invalid server certificate: {}", e)))?;

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn required_path<'a>(path: &'a Option<PathBuf>, what: &str) -> Result<&'a Path> {
    path.as_deref()
        .ok_or_else(|| SyncError::config(format!("missing {} path", what)))
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates found",
        ));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))
}

fn load_roots(path: &Path) -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    }
    Ok(roots)
}

//! # TLS Transport Layer
//!
//! Certificate loading and rustls configuration for client and server
//! connections.
//!
//! [`TlsOptions`] describes where the PEM material lives and how strictly the
//! peer is verified. [`TlsContext`] is the built, shareable form: a
//! `TlsConnector` for clients or a `TlsAcceptor` for servers. Contexts are
//! built once per interface and cloned into every connection.
//!
//! ## Verify modes
//! - `None`: a client accepts any server certificate; a server does not ask
//!   for a client certificate
//! - `RequirePeer`: a client verifies the server chain against the CA file;
//!   a server verifies a client certificate when one is offered
//! - `FailIfNoPeerCert`: as `RequirePeer`, and a server rejects clients that
//!   present no certificate
//!
//! When no CA file is set, the certificate file doubles as the trust root,
//! which is what a self-signed setup needs.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::{Result, WireError};
use crate::transport::stream::WireStream;

/// How strictly the remote certificate is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    #[default]
    None,
    RequirePeer,
    FailIfNoPeerCert,
}

/// PEM file locations and verification policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Certificate chain presented to the peer
    #[serde(default)]
    pub certificate_file: Option<PathBuf>,

    /// Private key matching the first certificate of the chain
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    /// Trust roots used to verify the peer
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    #[serde(default)]
    pub verify_mode: VerifyMode,

    /// Name checked against the server certificate instead of the dialed host
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_certificate_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.certificate_file = Some(path.into());
        self
    }

    pub fn set_private_key_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.private_key_file = Some(path.into());
        self
    }

    pub fn set_ca_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn set_verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    pub fn set_server_name<S: Into<String>>(mut self, name: S) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Problems that would make building a context fail, as readable strings.
    pub fn validate(&self, server_side: bool) -> Vec<String> {
        let mut errors = Vec::new();

        for (label, path) in [
            ("certificate_file", &self.certificate_file),
            ("private_key_file", &self.private_key_file),
            ("ca_file", &self.ca_file),
        ] {
            if let Some(path) = path {
                if !path.exists() {
                    errors.push(format!("TLS {label} does not exist: {}", path.display()));
                }
            }
        }

        if server_side && (self.certificate_file.is_none() || self.private_key_file.is_none()) {
            errors.push("TLS server needs both certificate_file and private_key_file".to_string());
        }

        if self.certificate_file.is_some() != self.private_key_file.is_some() {
            errors.push(
                "TLS certificate_file and private_key_file must be set together".to_string(),
            );
        }

        errors
    }

    fn trust_anchor_file(&self) -> Option<&Path> {
        self.ca_file
            .as_deref()
            .or(self.certificate_file.as_deref())
    }

    fn identity(&self) -> Result<Option<(Vec<Certificate>, PrivateKey)>> {
        match (&self.certificate_file, &self.private_key_file) {
            (Some(cert), Some(key)) => Ok(Some((load_certs(cert)?, load_private_key(key)?))),
            (None, None) => Ok(None),
            _ => Err(WireError::TlsError(
                "certificate_file and private_key_file must be set together".into(),
            )),
        }
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let path = self.trust_anchor_file().ok_or_else(|| {
            WireError::TlsError("Peer verification needs a ca_file or certificate_file".into())
        })?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(path)? {
            roots
                .add(&cert)
                .map_err(|e| WireError::TlsError(format!("Failed to add CA cert: {e}")))?;
        }
        Ok(roots)
    }

    /// Build the rustls server configuration
    pub fn server_config(&self) -> Result<ServerConfig> {
        let (cert_chain, private_key) = self.identity()?.ok_or_else(|| {
            WireError::TlsError("TLS server needs a certificate and private key".into())
        })?;

        let builder = ServerConfig::builder().with_safe_defaults();
        let builder = match self.verify_mode {
            VerifyMode::None => builder.with_no_client_auth(),
            VerifyMode::RequirePeer => builder.with_client_cert_verifier(Arc::new(
                AllowAnyAnonymousOrAuthenticatedClient::new(self.root_store()?),
            )),
            VerifyMode::FailIfNoPeerCert => builder.with_client_cert_verifier(Arc::new(
                AllowAnyAuthenticatedClient::new(self.root_store()?),
            )),
        };

        builder
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| WireError::TlsError(format!("TLS error: {e}")))
    }

    /// Build the rustls client configuration
    pub fn client_config(&self) -> Result<ClientConfig> {
        let identity = self.identity()?;
        let builder = ClientConfig::builder().with_safe_defaults();

        match self.verify_mode {
            VerifyMode::None => {
                warn!("TLS peer verification disabled: any server certificate is accepted");
                let builder = builder.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));
                match identity {
                    Some((chain, key)) => builder.with_client_auth_cert(chain, key).map_err(|e| {
                        WireError::TlsError(format!("Failed to set client certificate: {e}"))
                    }),
                    None => Ok(builder.with_no_client_auth()),
                }
            }
            VerifyMode::RequirePeer | VerifyMode::FailIfNoPeerCert => {
                let builder = builder.with_root_certificates(self.root_store()?);
                match identity {
                    Some((chain, key)) => builder.with_client_auth_cert(chain, key).map_err(|e| {
                        WireError::TlsError(format!("Failed to set client certificate: {e}"))
                    }),
                    None => Ok(builder.with_no_client_auth()),
                }
            }
        }
    }
}

struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| {
        WireError::TlsError(format!("Failed to open {}: {e}", path.display()))
    })?;
    Ok(BufReader::new(file))
}

/// Read every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = open_pem(path)?;
    let chain = certs(&mut reader)
        .map_err(|_| WireError::TlsError("Failed to parse certificate".into()))?;

    if chain.is_empty() {
        return Err(WireError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

/// Read the first private key from a PEM file (PKCS8, then RSA, then SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let parsers: [fn(&mut dyn std::io::BufRead) -> std::io::Result<Vec<Vec<u8>>>; 3] =
        [pkcs8_private_keys, rsa_private_keys, ec_private_keys];

    for parse in parsers {
        let mut reader = open_pem(path)?;
        let keys = parse(&mut reader)
            .map_err(|_| WireError::TlsError("Failed to parse private key".into()))?;
        if let Some(key) = keys.into_iter().next() {
            return Ok(PrivateKey(key));
        }
    }

    Err(WireError::TlsError(format!(
        "No supported private key found in {}",
        path.display()
    )))
}

/// Built TLS state shared by all connections of one interface
#[derive(Clone)]
pub struct TlsContext {
    connector: Option<TlsConnector>,
    acceptor: Option<TlsAcceptor>,
    server_name: Option<String>,
}

impl TlsContext {
    pub fn for_client(options: &TlsOptions) -> Result<Self> {
        let config = options.client_config()?;
        debug!(verify = ?options.verify_mode, "TLS client context ready");
        Ok(Self {
            connector: Some(TlsConnector::from(Arc::new(config))),
            acceptor: None,
            server_name: options.server_name.clone(),
        })
    }

    pub fn for_server(options: &TlsOptions) -> Result<Self> {
        let config = options.server_config()?;
        debug!(verify = ?options.verify_mode, "TLS server context ready");
        Ok(Self {
            connector: None,
            acceptor: Some(TlsAcceptor::from(Arc::new(config))),
            server_name: None,
        })
    }

    /// Run the client side of the handshake over an established socket.
    pub(crate) async fn connect(&self, host: &str, stream: TcpStream) -> Result<WireStream> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| WireError::TlsError("Context has no client configuration".into()))?;

        let name = self.server_name.as_deref().unwrap_or(host);
        let domain = ServerName::try_from(name)
            .map_err(|_| WireError::TlsError(format!("Invalid server name: {name}")))?;

        let tls = connector
            .connect(domain, stream)
            .await
            .map_err(|e| WireError::HandshakeFailure(e.to_string()))?;
        Ok(WireStream::from(tls))
    }

    /// Run the server side of the handshake over an accepted socket.
    pub(crate) async fn accept(&self, stream: TcpStream) -> Result<WireStream> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| WireError::TlsError("Context has no server configuration".into()))?;

        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| WireError::HandshakeFailure(e.to_string()))?;
        Ok(WireStream::from(tls))
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("client", &self.connector.is_some())
            .field("server", &self.acceptor.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

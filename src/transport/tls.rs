//! TLS for the outer hop, using rustls
//!
//! The agent side wraps a [`TcpTransport`] dial (so TLS also works through a
//! forward proxy). The server side builds a [`TlsAcceptor`] from PEM files
//! or from a freshly generated self-signed identity.

use super::{AddrMaybeCached, StreamDyn, TcpTransport, Transport, TransportDyn};
use crate::config::{ServerTlsConfig, TlsConfig, TransportConfig};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS stream type produced by the agent
pub type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Names the generated server certificate is valid for
const SELF_SIGNED_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

/// TLS transport for encrypted connections using rustls
#[derive(Clone)]
pub struct TlsTransport {
    connector: TlsConnector,
    /// Server name for SNI and verification
    hostname: Option<String>,
    tcp: TcpTransport,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("hostname", &self.hostname)
            .field("tcp", &self.tcp)
            .finish()
    }
}

impl TlsTransport {
    /// Create a TLS transport dialing through `tcp`
    pub fn with_config(config: &TlsConfig, tcp: TcpTransport) -> Result<Self> {
        let tls_config = if config.skip_verify {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut root_store = RootCertStore::empty();

            let native_certs = rustls_native_certs::load_native_certs();
            for cert in native_certs.certs {
                root_store.add(cert).ok();
            }

            if let Some(ref root_path) = config.trusted_root {
                for cert in load_certs(root_path)? {
                    root_store
                        .add(cert)
                        .context("Failed to add certificate to store")?;
                }
            }

            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        Ok(TlsTransport {
            connector: TlsConnector::from(Arc::new(tls_config)),
            hostname: config.hostname.clone(),
            tcp,
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    type Stream = TlsStream;

    fn new(config: &TransportConfig) -> Result<Self> {
        let tls_config = config
            .tls
            .as_ref()
            .ok_or_else(|| anyhow!("TLS configuration required for TLS transport"))?;

        TlsTransport::with_config(tls_config, TcpTransport::new(config)?)
    }

    async fn connect(&self, addr: &AddrMaybeCached) -> Result<Self::Stream> {
        let tcp_stream = self.tcp.dial(addr).await?;

        let hostname = match self.hostname.as_deref() {
            Some(hostname) => hostname,
            None => addr.host_port()?.0,
        };

        let server_name = ServerName::try_from(hostname.to_string())
            .with_context(|| format!("Invalid hostname: {}", hostname))?;

        let tls_stream = self
            .connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {}", hostname))?;

        tracing::debug!("TLS connection established to {} ({})", hostname, addr.addr());

        Ok(tls_stream)
    }
}

#[async_trait]
impl TransportDyn for TlsTransport {
    async fn connect_dyn(&self, addr: &AddrMaybeCached) -> Result<Box<dyn StreamDyn>> {
        let stream = self.connect(addr).await?;
        Ok(Box::new(stream))
    }
}

/// Build the server's TLS acceptor
///
/// PEM files take precedence; `self_signed` generates a throwaway identity
/// for `localhost` / `127.0.0.1`.
pub fn server_acceptor(config: &ServerTlsConfig) -> Result<TlsAcceptor> {
    let (certs, key) = match (&config.cert, &config.key) {
        (Some(cert_path), Some(key_path)) => (load_certs(cert_path)?, load_private_key(key_path)?),
        _ if config.self_signed => self_signed_identity()?,
        _ => return Err(anyhow!("TLS requires cert and key files or self_signed")),
    };

    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Generate a self-signed certificate and its private key
pub fn self_signed_identity() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let names: Vec<String> = SELF_SIGNED_NAMES.iter().map(|n| n.to_string()).collect();
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| anyhow!("Certificate generation failed: {}", e))?;

    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    Ok((vec![cert], key.into()))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open certificate file: {}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates from: {}", path))?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open key file: {}", path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key from: {}", path))?
        .ok_or_else(|| anyhow!("No private key found in {}", path))
}

/// Certificate verifier that accepts all certificates
///
/// Only used with `skip_verify`, for servers running a self-signed identity.
/// The PSK handshake inside still authenticates the server.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

// QUIC transport configuration and primitives.
use anyhow::{anyhow, Context, Result};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// ALPN protocol id spoken on the native QUIC binding.
pub const ALPN: &str = "loom/1";

/// Transport-level knobs shared by server and client endpoints.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub keep_alive: Duration,
    pub max_streams: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(15),
            max_streams: 1024,
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> quinn::TransportConfig {
        let mut config = quinn::TransportConfig::default();
        config.keep_alive_interval(Some(self.keep_alive));
        let streams = quinn::VarInt::from_u32(self.max_streams);
        config.max_concurrent_bidi_streams(streams);
        config.max_concurrent_uni_streams(streams);
        config
    }
}

/// Build a TLS 1.3 server configuration with the given ALPN ids. Passing
/// `client_roots` turns on client certificate verification (mTLS).
pub fn server_crypto(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
    alpn: &[&str],
) -> Result<rustls::ServerConfig> {
    let builder = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
    let builder = match client_roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .context("build client cert verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let mut config = builder
        .with_single_cert(cert_chain, key)
        .context("build server TLS config")?;
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(config)
}

/// Build a TLS 1.3 client configuration trusting `roots`.
pub fn client_crypto(roots: RootCertStore, alpn: &[&str]) -> Result<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(config)
}

/// Generate a throwaway self-signed certificate for localhost. Used when no
/// certificate files are configured, so a dev broker starts with zero setup.
pub fn self_signed_cert() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .context("generate self-signed cert")?;
    let cert_der = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(signing_key.serialize_der());
    Ok((vec![cert_der], key_der.into()))
}

/// Load a PEM certificate chain from disk.
pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("read cert file {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("parse certs in {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

/// Load a PEM private key from disk.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("read key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("parse key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

/// Load a PEM CA bundle into a root store.
pub fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_cert_chain(path)? {
        roots.add(cert).context("add CA certificate")?;
    }
    Ok(roots)
}

/// QUIC server endpoint wrapper.
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    pub fn bind(
        addr: SocketAddr,
        crypto: rustls::ServerConfig,
        transport: &TransportConfig,
    ) -> Result<Self> {
        let quic_crypto =
            QuicServerConfig::try_from(crypto).context("build QUIC server crypto")?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
        server_config.transport_config(Arc::new(transport.quinn_transport_config()));
        let endpoint = Endpoint::server(server_config, addr).context("bind QUIC server")?;
        Ok(Self { endpoint })
    }

    pub async fn accept(&self) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("QUIC endpoint closed"))?;
        let connection = connecting.await.context("accept QUIC connection")?;
        Ok(QuicConnection { inner: connection })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("read QUIC local address")
    }
}

/// QUIC client endpoint wrapper. The broker itself never dials out; this
/// exists for integration tests and client tooling.
pub struct QuicClient {
    endpoint: Endpoint,
}

impl QuicClient {
    pub fn bind(
        addr: SocketAddr,
        crypto: rustls::ClientConfig,
        transport: &TransportConfig,
    ) -> Result<Self> {
        let quic_crypto =
            QuicClientConfig::try_from(crypto).context("build QUIC client crypto")?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(transport.quinn_transport_config()));
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self { endpoint })
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .context("initiate QUIC connection")?;
        let connection = connecting.await.context("establish QUIC connection")?;
        Ok(QuicConnection { inner: connection })
    }
}

/// Active QUIC connection wrapper.
pub struct QuicConnection {
    inner: Connection,
}

impl QuicConnection {
    pub fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    /// DER bytes of the peer's leaf certificate, when the handshake carried
    /// one (mTLS deployments).
    pub fn peer_certificate_der(&self) -> Option<Vec<u8>> {
        let identity = self.inner.peer_identity()?;
        let certs = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
        certs.first().map(|cert| cert.as_ref().to_vec())
    }

    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.open_bi().await.context("open bidi stream")
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.accept_bi().await.context("accept bidi stream")
    }

    /// Resolves when the connection is fully closed.
    pub async fn closed(&self) {
        let _ = self.inner.closed().await;
    }
}

// Server TLS assembly from the config document.
use anyhow::{anyhow, Context, Result};

use loom_transport::{
    load_cert_chain, load_private_key, load_root_store, self_signed_cert, server_crypto,
};

use crate::config::{AuthMode, TlsSection};

/// Build the rustls server configuration for the stream listener. Without
/// configured certificate files a self-signed localhost certificate is
/// generated, which is enough for development against clients that skip
/// verification.
pub fn server_tls(
    tls: &TlsSection,
    auth_mode: AuthMode,
    alpn: &[&str],
) -> Result<rustls::ServerConfig> {
    let (chain, key) = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_path), Some(key_path)) => (
            load_cert_chain(cert_path).context("load server certificate")?,
            load_private_key(key_path).context("load server key")?,
        ),
        _ => self_signed_cert().context("generate self-signed certificate")?,
    };

    let wants_client_certs =
        tls.require_client_cert || matches!(auth_mode, AuthMode::Mtls | AuthMode::Both);
    let client_roots = if wants_client_certs {
        let path = tls
            .client_ca_file
            .as_ref()
            .ok_or_else(|| anyhow!("client_ca_file is required for mTLS"))?;
        Some(load_root_store(path).context("load client CA bundle")?)
    } else {
        None
    };

    server_crypto(chain, key, client_roots, alpn)
}

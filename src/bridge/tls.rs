//! Certificate loading and TLS acceptor construction for the listener.

use crate::bridge::config::TlsConfig;
use crate::error::{MqttError, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// Builds the TLS acceptor from the configured certificate, key, and
/// optional client CA.
///
/// # Errors
///
/// Returns `MqttError::Configuration` when a file cannot be read or parsed.
pub async fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_cert_chain(&config.cert_file).await?;
    let key = load_private_key(&config.key_file).await?;

    let server_config = match &config.ca_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_cert_chain(ca_file).await? {
                roots
                    .add(cert)
                    .map_err(|e| MqttError::Configuration(format!("invalid CA certificate: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| MqttError::Configuration(e.to_string()))?;
            ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key),
    }
    .map_err(|e| MqttError::Configuration(format!("invalid TLS key pair: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

async fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| MqttError::Configuration(format!("{}: {e}", path.display())))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    certs.map_err(|e| MqttError::Configuration(format!("{}: {e}", path.display())))
}

async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| MqttError::Configuration(format!("{}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| MqttError::Configuration(format!("{}: {e}", path.display())))?
        .ok_or_else(|| {
            MqttError::Configuration(format!("{}: no private key found", path.display()))
        })
}

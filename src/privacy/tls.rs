use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{RelayError, Result};

/// Native trust store, or the bundled webpki roots when the platform has none.
fn load_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for c in certs {
            let _ = roots.add(c);
        }
    }
    if roots.is_empty() {
        tracing::debug!("no native roots found; using bundled webpki roots");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    roots
}

/// Client config without ALPN; hyper-rustls wants to pick protocols itself.
pub(crate) fn client_config() -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::config(format!("tls config: {e}")))?
        .with_root_certificates(load_roots())
        .with_no_client_auth())
}

/// Connector for the hand-framed clients, which only ever speak HTTP/1.1.
pub(crate) fn build_connector() -> Result<TlsConnector> {
    let mut cfg = client_config()?;
    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsConnector::from(Arc::new(cfg)))
}

/// TLS handshake over an already connected pipe (direct socket or SOCKS5 tunnel).
pub(crate) async fn connect_tls<S>(connector: &TlsConnector, host: &str, stream: S) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| RelayError::config(format!("invalid TLS server name: {host}")))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| RelayError::classify_connection(format!("TLS handshake with {host}: {e}")))
}

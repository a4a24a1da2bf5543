use http::Uri;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{RelayError, Result};
use crate::http_shared::{RelayRequest, RelayResponse};

use super::framing::{Target, exchange};
use super::tls::{build_connector, connect_tls};
use super::{Transport, error_response};

/// HTTP/1.1 over a TCP (or TLS) connection this client opens itself, so no
/// platform-added headers ride along.
#[derive(Clone)]
pub struct RawSocketClient {
    tls: TlsConnector,
    debug: bool,
}

impl RawSocketClient {
    pub fn new(debug: bool) -> Result<Self> {
        Ok(Self { tls: build_connector()?, debug })
    }

    pub async fn forward(&self, request: &RelayRequest, target_uri: &Uri) -> Result<RelayResponse> {
        let target = Target::from_uri(target_uri)?;
        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| RelayError::classify_connection(format!("connect {}:{}: {e}", target.host, target.port)))?;
        let _ = tcp.set_nodelay(true);
        if target.tls {
            let tls = connect_tls(&self.tls, &target.host, tcp).await?;
            exchange(tls, request, &target, "socket", self.debug).await
        } else {
            exchange(tcp, request, &target, "socket", self.debug).await
        }
    }

    /// Standalone entry point: failures become a 500 response.
    pub async fn fetch(&self, request: &RelayRequest) -> RelayResponse {
        match self.forward(request, &request.uri).await {
            Ok(resp) => resp,
            Err(e) => error_response("Socket connection", &e),
        }
    }
}

impl Transport for RawSocketClient {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
        let result = self.forward(request, &request.uri).await;
        if let Err(e) = &result {
            if e.is_platform_restriction() {
                tracing::info!(host = ?request.uri.host(), error = %e, "platform network restriction detected");
            }
        }
        result
    }
}

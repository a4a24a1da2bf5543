//! SOCKS5 tunnel client (RFC 1928 CONNECT with RFC 1929 username/password).
//!
//! The client offers exactly one authentication method: username/password
//! when the selected endpoint carries credentials, no-auth otherwise. A
//! server that picks anything else fails the handshake. Once CONNECT
//! succeeds the tunnel is a plain byte pipe and the request is written with
//! the same framing the raw socket client uses.

use std::io;
use std::sync::Arc;

use http::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{RelayError, Result};
use crate::http_shared::{RelayRequest, RelayResponse};
use crate::selector::Selector;

use super::endpoint::{Socks5Endpoint, acquire_endpoint};
use super::fetch::HyperFetch;
use super::framing::{Target, exchange};
use super::tls::{build_connector, connect_tls};
use super::{ProxyListSource, Transport, error_response};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USERNAME_PASSWORD: u8 = 0x02;
const AUTH_SUBNEG_VERSION: u8 = 0x01;
const AUTH_SUCCESS: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const RSV: u8 = 0x00;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

async fn write_frame<S>(stream: &mut S, frame: &[u8], step: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(frame)
        .await
        .map_err(|e| RelayError::connection(format!("SOCKS5 {step}: send failed: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| RelayError::connection(format!("SOCKS5 {step}: send failed: {e}")))
}

async fn read_reply<S>(stream: &mut S, buf: &mut [u8], step: &str) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(RelayError::protocol(format!("SOCKS5 {step}: proxy closed the connection")))
        }
        Err(e) => Err(RelayError::connection(format!("SOCKS5 {step}: read failed: {e}"))),
    }
}

/// Greeting + method selection. The server must choose the single method offered.
async fn negotiate_method<S>(stream: &mut S, with_auth: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered = if with_auth { AUTH_USERNAME_PASSWORD } else { AUTH_NO_AUTH };
    write_frame(stream, &[SOCKS5_VERSION, 0x01, offered], "greeting").await?;

    let mut reply = [0u8; 2];
    read_reply(stream, &mut reply, "method selection").await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(RelayError::protocol(format!(
            "SOCKS5 method selection: expected version 0x05, got 0x{:02x}",
            reply[0]
        )));
    }
    if reply[1] != offered {
        return Err(RelayError::protocol(if with_auth {
            format!("SOCKS5 method selection: server does not accept username/password auth (chose 0x{:02x})", reply[1])
        } else {
            format!("SOCKS5 method selection: server requires authentication but none is configured (chose 0x{:02x})", reply[1])
        }));
    }
    tracing::debug!(method = offered, "SOCKS5 method accepted");
    Ok(())
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = username.as_bytes();
    let pass = password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(RelayError::config("SOCKS5 auth: username and password are limited to 255 bytes"));
    }
    let mut frame = Vec::with_capacity(3 + user.len() + pass.len());
    frame.push(AUTH_SUBNEG_VERSION);
    frame.push(user.len() as u8);
    frame.extend_from_slice(user);
    frame.push(pass.len() as u8);
    frame.extend_from_slice(pass);
    write_frame(stream, &frame, "auth").await?;

    let mut reply = [0u8; 2];
    read_reply(stream, &mut reply, "auth").await?;
    if reply[0] != AUTH_SUBNEG_VERSION {
        return Err(RelayError::protocol(format!(
            "SOCKS5 auth: expected subnegotiation version 0x01, got 0x{:02x}",
            reply[0]
        )));
    }
    if reply[1] != AUTH_SUCCESS {
        return Err(RelayError::auth(format!("SOCKS5 auth: credentials rejected (status 0x{:02x})", reply[1])));
    }
    Ok(())
}

async fn connect_target<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host_bytes = host.as_bytes();
    if host_bytes.is_empty() || host_bytes.len() > 255 {
        return Err(RelayError::config(format!("SOCKS5 connect: unusable target host {host:?}")));
    }
    let mut frame = Vec::with_capacity(7 + host_bytes.len());
    frame.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, RSV, ATYP_DOMAIN, host_bytes.len() as u8]);
    frame.extend_from_slice(host_bytes);
    frame.extend_from_slice(&port.to_be_bytes());
    write_frame(stream, &frame, "connect").await?;

    // VER | REP | RSV | ATYP, then BND.ADDR | BND.PORT
    let mut reply = [0u8; 4];
    read_reply(stream, &mut reply, "connect").await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(RelayError::protocol(format!(
            "SOCKS5 connect: expected version 0x05, got 0x{:02x}",
            reply[0]
        )));
    }
    if reply[1] != REP_SUCCESS {
        return Err(RelayError::protocol(format!(
            "SOCKS5 connect to {host}:{port} failed: {} (0x{:02x})",
            reply_message(reply[1]),
            reply[1]
        )));
    }
    // the bound address is drained so the tunnel starts clean; it is not checked
    let bound_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_reply(stream, &mut len, "connect").await?;
            len[0] as usize
        }
        other => {
            return Err(RelayError::protocol(format!("SOCKS5 connect: unknown bound address type 0x{other:02x}")));
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    read_reply(stream, &mut bound, "connect").await?;
    Ok(())
}

/// Run the full client handshake; on success `stream` is a tunnel to
/// `target_host:target_port`.
pub async fn handshake<S>(stream: &mut S, target_host: &str, target_port: u16, credentials: Option<(&str, &str)>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, credentials.is_some()).await?;
    if let Some((username, password)) = credentials {
        authenticate(stream, username, password).await?;
    }
    connect_target(stream, target_host, target_port).await
}

/// HTTP/1.1 through a SOCKS5 proxy picked from provider lists.
pub struct Socks5TunnelClient<L = HyperFetch> {
    providers: Vec<String>,
    source: L,
    selector: Arc<dyn Selector>,
    tls: TlsConnector,
    debug: bool,
}

impl<L: ProxyListSource> Socks5TunnelClient<L> {
    pub fn new(providers: Vec<String>, source: L, selector: Arc<dyn Selector>, debug: bool) -> Result<Self> {
        Ok(Self { providers, source, selector, tls: build_connector()?, debug })
    }

    pub async fn acquire_endpoint(&self) -> Result<Socks5Endpoint> {
        acquire_endpoint(&self.providers, &self.source, self.selector.as_ref()).await
    }

    pub async fn forward(&self, request: &RelayRequest, target_uri: &Uri) -> Result<RelayResponse> {
        let target = Target::from_uri(target_uri)?;
        let endpoint = self.acquire_endpoint().await?;
        let mut tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| RelayError::classify_connection(format!("connect to SOCKS5 proxy {endpoint}: {e}")))?;
        let _ = tcp.set_nodelay(true);
        handshake(&mut tcp, &target.host, target.port, endpoint.credentials()).await?;
        tracing::debug!(proxy = %endpoint, host = %target.host, port = target.port, "SOCKS5 tunnel established");
        if target.tls {
            let tls = connect_tls(&self.tls, &target.host, tcp).await?;
            exchange(tls, request, &target, "socks5", self.debug).await
        } else {
            exchange(tcp, request, &target, "socks5", self.debug).await
        }
    }

    /// Standalone entry point: failures become a 500 response.
    pub async fn fetch(&self, request: &RelayRequest) -> RelayResponse {
        match self.forward(request, &request.uri).await {
            Ok(resp) => resp,
            Err(e) => error_response("SOCKS5 connection", &e),
        }
    }
}

impl<L: ProxyListSource> Transport for Socks5TunnelClient<L> {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
        self.forward(request, &request.uri).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_handshake(server_script: Vec<u8>, creds: Option<(&str, &str)>) -> (Result<()>, Vec<u8>) {
        let (mut client, mut server) = tokio::io::duplex(1024);
        server.write_all(&server_script).await.unwrap();
        let res = handshake(&mut client, "api.example.com", 443, creds).await;
        drop(client);
        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        (res, sent)
    }

    #[tokio::test]
    async fn test_no_auth_handshake_frames() {
        let script = [&[0x05, 0x00][..], &[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x1f, 0x90][..]].concat();
        let (res, sent) = run_handshake(script, None).await;
        res.unwrap();
        let mut want = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 15];
        want.extend_from_slice(b"api.example.com");
        want.extend_from_slice(&[0x01, 0xbb]);
        assert_eq!(sent, want);
    }

    #[tokio::test]
    async fn test_auth_frame_layout() {
        let script = [&[0x05, 0x02][..], &[0x01, 0x00][..], &[0x05, 0x00, 0x00, 0x03, 3, b'p', b'x', b'y', 0x04, 0x38][..]].concat();
        let (res, sent) = run_handshake(script, Some(("user", "pw"))).await;
        res.unwrap();
        assert_eq!(&sent[..3], &[0x05, 0x01, 0x02]);
        assert_eq!(&sent[3..12], &[0x01, 4, b'u', b's', b'e', b'r', 2, b'p', b'w']);
        assert_eq!(&sent[12..16], &[0x05, 0x01, 0x00, 0x03]);
    }

    #[tokio::test]
    async fn test_connect_failure_names_reply_code() {
        let script = [&[0x05, 0x00][..], &[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0][..]].concat();
        let (res, _) = run_handshake(script, None).await;
        match res {
            Err(RelayError::Protocol(msg)) => assert!(msg.contains("connection refused"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_version_is_protocol_error() {
        let (res, sent) = run_handshake(vec![0x04, 0x00], None).await;
        assert!(matches!(res, Err(RelayError::Protocol(_))));
        assert_eq!(sent, vec![0x05, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_offering_auth_to_no_auth_server_fails() {
        let (res, sent) = run_handshake(vec![0x05, 0x00], Some(("user", "pw"))).await;
        assert!(matches!(res, Err(RelayError::Protocol(_))));
        assert_eq!(sent, vec![0x05, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_overlong_username_is_config_error() {
        let long = "u".repeat(256);
        let (res, sent) = run_handshake(vec![0x05, 0x02], Some((long.as_str(), "pw"))).await;
        assert!(matches!(res, Err(RelayError::Config(_))), "{res:?}");
        assert_eq!(sent, vec![0x05, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_auth_reply_with_wrong_version_is_protocol_error() {
        let script = [&[0x05, 0x02][..], &[0x05, 0x00][..]].concat();
        let (res, sent) = run_handshake(script, Some(("user", "pw"))).await;
        assert!(matches!(res, Err(RelayError::Protocol(_))), "{res:?}");
        // greeting and auth only; no connect request follows
        assert_eq!(sent.len(), 3 + 9);
    }

    #[test]
    fn test_reply_messages() {
        assert_eq!(reply_message(0x02), "connection not allowed by ruleset");
        assert_eq!(reply_message(0x42), "unassigned reply code");
    }
}

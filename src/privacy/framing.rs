use bytes::Bytes;
use http::{Method, Uri};
use memchr::memmem;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RelayError, Result};
use crate::http_shared::{Headers, RelayRequest, RelayResponse};

use super::body::{BodyFraming, relay_body};

// Headers that identify the hosting platform or the original client; never forwarded.
static HEADER_FILTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(host|accept-encoding|cf-|cdn-|referer|referrer)").expect("static header filter regex"));

static STATUS_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^HTTP/1\.1 (\d{3})(?: (.*))?$").expect("static status line regex"));

const MAX_HEAD_BYTES: usize = 256 * 1024;
const READ_CHUNK: usize = 8192;
const BODY_WRITE_CHUNK: usize = 16 * 1024;

pub fn is_filtered_header(name: &str) -> bool {
    HEADER_FILTER_RE.is_match(name)
}

/// Copy of `headers` without privacy-leaking entries; order is preserved and a
/// repeated name keeps its last value.
pub fn filter_headers(headers: &Headers) -> Headers {
    let mut cleaned = Headers::new();
    for h in headers.iter() {
        if !is_filtered_header(&h.name) {
            cleaned.set(h.name.clone(), h.value.clone());
        }
    }
    cleaned
}

pub fn build_preamble(method: &Method, path_and_query: &str, headers: &Headers) -> String {
    let mut out = format!("{} {} HTTP/1.1\r\n", method.as_str(), path_and_query);
    for h in headers.iter() {
        out.push_str(&h.name);
        out.push_str(": ");
        out.push_str(&h.value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Where a request goes once the transport is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub path_and_query: String,
}

impl Target {
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let tls = match uri.scheme_str() {
            Some(s) if s.eq_ignore_ascii_case("https") => true,
            Some(s) if s.eq_ignore_ascii_case("http") => false,
            other => return Err(RelayError::config(format!("unsupported target scheme: {}", other.unwrap_or("<none>")))),
        };
        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RelayError::config(format!("target URI has no host: {uri}")))?;
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("/")
            .to_string();
        Ok(Self { host: host.to_string(), port, tls, path_and_query })
    }

    fn is_default_port(&self) -> bool {
        (self.tls && self.port == 443) || (!self.tls && self.port == 80)
    }

    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') { format!("[{}]", self.host) } else { self.host.clone() };
        if self.is_default_port() { host } else { format!("{}:{}", host, self.port) }
    }
}

/// Headers actually written to the remote: the filtered inbound set plus the
/// values this client controls.
pub fn outbound_headers(request: &RelayRequest, target: &Target) -> Headers {
    let mut headers = filter_headers(&request.headers);
    headers.set("Host", target.host_header());
    headers.set("accept-encoding", "identity");
    headers.set("connection", "close");
    headers.remove("transfer-encoding");
    // the body is written right after the head
    headers.remove("expect");
    if !request.body.is_empty() || headers.contains("content-length") {
        headers.set("content-length", request.body.len().to_string());
    }
    headers
}

/// Raw response head as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadBuffer {
    pub text: String,
    /// Whether the double-CRLF terminator was seen.
    pub complete: bool,
    /// Bytes read past the terminator; they begin the body.
    pub overrun: Bytes,
}

/// Read until the buffer holds `\r\n\r\n` or the stream ends. Ending early is
/// reported through `complete`, not as an error.
pub async fn read_until_headers_complete<R>(reader: &mut R) -> Result<HeadBuffer>
where
    R: AsyncRead + Unpin,
{
    read_head_from(reader, Vec::with_capacity(READ_CHUNK)).await
}

/// Same as `read_until_headers_complete`, starting from bytes already read.
async fn read_head_from<R>(reader: &mut R, mut buf: Vec<u8>) -> Result<HeadBuffer>
where
    R: AsyncRead + Unpin,
{
    let mut tmp = vec![0u8; READ_CHUNK];
    loop {
        if let Some(pos) = memmem::find(&buf, b"\r\n\r\n") {
            let overrun = Bytes::copy_from_slice(&buf[pos + 4..]);
            buf.truncate(pos + 4);
            return Ok(HeadBuffer { text: String::from_utf8_lossy(&buf).into_owned(), complete: true, overrun });
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(RelayError::protocol("response header too large"));
        }
        let n = reader
            .read(&mut tmp)
            .await
            .map_err(|e| RelayError::classify_connection(format!("read response head: {e}")))?;
        if n == 0 {
            return Ok(HeadBuffer { text: String::from_utf8_lossy(&buf).into_owned(), complete: false, overrun: Bytes::new() });
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Headers,
}

pub fn parse_response_head(text: &str) -> Result<ResponseHead> {
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let caps = STATUS_LINE_RE
        .captures(status_line)
        .ok_or_else(|| RelayError::protocol(format!("invalid HTTP response status line: {:?}", status_line)))?;
    let status = caps[1]
        .parse::<u16>()
        .map_err(|_| RelayError::protocol(format!("invalid HTTP status code: {}", &caps[1])))?;
    let reason = caps.get(2).map(|m| m.as_str().to_string()).filter(|r| !r.is_empty());

    let mut headers = Headers::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let pair = line
            .split_once(": ")
            .or_else(|| line.split_once(':').map(|(k, v)| (k.trim(), v.trim())));
        if let Some((name, value)) = pair {
            if !name.is_empty() {
                headers.set(name, value);
            }
        }
    }
    Ok(ResponseHead { status, reason, headers })
}

/// Parse the head off `stream` and hand back a response whose body is still
/// being relayed from the socket. Interim 1xx heads (other than 101) are
/// skipped.
pub async fn read_response<S>(mut stream: S, method: &Method) -> Result<RelayResponse>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    let mut carried = Bytes::new();
    let (head, ResponseHead { status, reason, mut headers }) = loop {
        let head = read_head_from(&mut stream, carried.to_vec()).await?;
        if !head.complete {
            return Err(RelayError::protocol(if head.text.is_empty() {
                "connection closed before response head".to_string()
            } else {
                "connection closed before response head was complete".to_string()
            }));
        }
        let parsed = parse_response_head(&head.text)?;
        if (100..200).contains(&parsed.status) && parsed.status != 101 {
            tracing::debug!(status = parsed.status, "skipping interim response");
            carried = head.overrun;
            continue;
        }
        break (head, parsed);
    };
    let framing = BodyFraming::for_response(method, status, &headers);
    if framing == BodyFraming::Chunked {
        // the relayed body is de-chunked
        headers.remove("transfer-encoding");
    }
    let body = relay_body(stream, head.overrun, framing);
    Ok(RelayResponse { status, reason, headers, body })
}

/// Write `request` over an established byte pipe and read the response.
pub async fn exchange<S>(mut stream: S, request: &RelayRequest, target: &Target, via: &'static str, debug: bool) -> Result<RelayResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let headers = outbound_headers(request, target);
    if debug {
        tracing::debug!(
            via,
            method = %request.method,
            host = %target.host,
            path = %target.path_and_query,
            headers = %headers.preview(),
            body_len = request.body.len(),
            "sending request"
        );
    }
    let preamble = build_preamble(&request.method, &target.path_and_query, &headers);
    stream
        .write_all(preamble.as_bytes())
        .await
        .map_err(|e| RelayError::classify_connection(format!("write request head: {e}")))?;
    for chunk in request.body.chunks(BODY_WRITE_CHUNK) {
        stream
            .write_all(chunk)
            .await
            .map_err(|e| RelayError::classify_connection(format!("write request body: {e}")))?;
    }
    stream
        .flush()
        .await
        .map_err(|e| RelayError::classify_connection(format!("flush request: {e}")))?;
    read_response(stream, &request.method).await
}

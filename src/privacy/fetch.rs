use std::io;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::error::{RelayError, Result};
use crate::http_shared::{Headers, RelayRequest, RelayResponse};

use super::tls::client_config;
use super::{ProxyListSource, Transport};

pub type FetchClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

// dropped before handing a request to hyper, which frames the message itself
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "keep-alive",
    "upgrade",
    "te",
    "trailers",
    "host",
    "content-length",
    "transfer-encoding",
];

/// Passthrough client: forwards the request as given through a regular
/// HTTP client. Used by `direct` and as the last fallback step.
#[derive(Clone)]
pub struct HyperFetch {
    client: FetchClient,
}

impl HyperFetch {
    pub fn new() -> Result<Self> {
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(client_config()?)
            .https_or_http()
            .enable_http1()
            .build();
        // one connection per request, like the hand-framed clients
        let client = Client::builder(TokioExecutor::new()).pool_max_idle_per_host(0).build(https);
        Ok(Self { client })
    }

    pub async fn fetch(&self, request: &RelayRequest) -> Result<RelayResponse> {
        let out_req = build_outgoing_request(request)?;
        let resp = self
            .client
            .request(out_req)
            .await
            .map_err(|e| RelayError::classify_connection(format!("fetch {}: {e}", request.uri)))?;
        let status = resp.status();
        let headers = Headers::from(resp.headers());
        let body = resp.into_body().map_err(io::Error::other).boxed_unsync();
        Ok(RelayResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            headers,
            body,
        })
    }
}

pub(crate) fn build_outgoing_request(request: &RelayRequest) -> Result<Request<Full<Bytes>>> {
    let mut out_req = Request::builder()
        .method(request.method.clone())
        .uri(request.uri.clone())
        .body(Full::new(request.body.clone()))
        .map_err(|e| RelayError::config(format!("build request for {}: {e}", request.uri)))?;
    for h in request.headers.iter() {
        let lname = h.name.to_ascii_lowercase();
        if HOP_HEADERS.contains(&lname.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(val)) = (h.name.parse::<HeaderName>(), h.value.parse::<HeaderValue>()) {
            out_req.headers_mut().append(name, val);
        }
    }
    Ok(out_req)
}

impl Transport for HyperFetch {
    fn name(&self) -> &'static str {
        "fetch"
    }

    async fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
        self.fetch(request).await
    }
}

impl ProxyListSource for HyperFetch {
    async fn fetch_list(&self, url: &str) -> Result<String> {
        let uri: Uri = url
            .parse()
            .map_err(|e| RelayError::config(format!("invalid proxy list URL {url}: {e}")))?;
        let resp = self.fetch(&RelayRequest::new(Method::GET, uri)).await?;
        if !(200..300).contains(&resp.status) {
            return Err(RelayError::connection(format!(
                "proxy list provider {url} returned status {}",
                resp.status
            )));
        }
        resp.text()
            .await
            .map_err(|e| RelayError::connection(format!("read proxy list from {url}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_request_drops_hop_headers() {
        let request = RelayRequest::new(Method::POST, "https://api.example.com/v1".parse().unwrap())
            .header("Host", "relay.local")
            .header("Proxy-Connection", "keep-alive")
            .header("Content-Length", "2")
            .header("Authorization", "Bearer k")
            .header("X-Trace", "1")
            .header("X-Trace", "2")
            .body("{}");
        let out = build_outgoing_request(&request).unwrap();
        assert_eq!(out.method(), Method::POST);
        assert_eq!(out.uri(), "https://api.example.com/v1");
        assert!(out.headers().get("host").is_none());
        assert!(out.headers().get("proxy-connection").is_none());
        assert!(out.headers().get("content-length").is_none());
        assert_eq!(out.headers().get("authorization").unwrap(), "Bearer k");
        assert_eq!(out.headers().get_all("x-trace").iter().count(), 2);
    }
}

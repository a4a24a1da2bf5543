//! Outbound request forwarding with platform metadata stripped.
//!
//! `framing` and `body` hold the HTTP/1.1 wire logic shared by the two
//! hand-framed clients (`raw_socket`, `socks5`); `fetch` is the passthrough
//! client; `dispatcher` picks between them per destination host.

use std::future::Future;
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::http_shared::{RelayRequest, RelayResponse};

pub mod body;
pub mod dispatcher;
pub mod endpoint;
pub mod fetch;
pub mod framing;
pub mod raw_socket;
pub mod socks5;
mod tls;


pub use dispatcher::StrategyDispatcher;
pub use endpoint::Socks5Endpoint;
pub use fetch::HyperFetch;
pub use framing::{
    HeadBuffer, ResponseHead, Target, build_preamble, filter_headers, parse_response_head,
    read_until_headers_complete,
};
pub use raw_socket::RawSocketClient;
pub use socks5::Socks5TunnelClient;

/// One way of getting a request to its destination. Failures are returned,
/// never turned into responses, so a caller can try the next transport.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn send(&self, request: &RelayRequest) -> impl Future<Output = Result<RelayResponse>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn send(&self, request: &RelayRequest) -> impl Future<Output = Result<RelayResponse>> + Send {
        (**self).send(request)
    }
}

/// Where SOCKS5 proxy lists come from.
pub trait ProxyListSource: Send + Sync {
    /// Body of a successful (2xx) GET of `url`.
    fn fetch_list(&self, url: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Terminal response used by the standalone client entry points.
pub(crate) fn error_response(context: &str, err: &RelayError) -> RelayResponse {
    tracing::debug!(context, category = err.category(), error = %err, "request failed");
    RelayResponse::text_response(500, format!("Error {}: {}", context.to_lowercase(), err.message()))
}

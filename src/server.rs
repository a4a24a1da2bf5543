use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming as IncomingBody;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::http_shared::{Headers, RelayBody, RelayRequest, RelayResponse, gen_id};
use crate::privacy::{StrategyDispatcher, Transport};

// never forwarded in either direction
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "keep-alive",
    "te",
    "trailers",
    "upgrade",
];

pub async fn serve<S, P, F>(addr: &str, dispatcher: Arc<StrategyDispatcher<S, P, F>>) -> io::Result<()>
where
    S: Transport + 'static,
    P: Transport + 'static,
    F: Transport + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "relay listening");
    serve_listener(listener, dispatcher).await
}

/// Accept loop; one HTTP/1.1 connection per client, no keep-alive.
pub async fn serve_listener<S, P, F>(listener: TcpListener, dispatcher: Arc<StrategyDispatcher<S, P, F>>) -> io::Result<()>
where
    S: Transport + 'static,
    P: Transport + 'static,
    F: Transport + 'static,
{
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                continue;
            }
        };
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<IncomingBody>| {
                let dispatcher = dispatcher.clone();
                async move { Ok::<_, Infallible>(handle_request(&dispatcher, req).await) }
            });
            let mut builder = http1::Builder::new();
            builder.keep_alive(false);
            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                tracing::debug!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_request<S, P, F>(dispatcher: &StrategyDispatcher<S, P, F>, req: Request<IncomingBody>) -> Response<RelayBody>
where
    S: Transport,
    P: Transport,
    F: Transport,
{
    let id = gen_id();
    let (parts, body) = req.into_parts();
    let absolute = matches!(parts.uri.scheme_str(), Some("http") | Some("https")) && parts.uri.host().is_some();
    if !absolute {
        tracing::debug!(%id, uri = %parts.uri, "rejecting non absolute-form request");
        return into_http_response(RelayResponse::text_response(
            400,
            "relay expects an absolute-form http:// or https:// request URI",
        ));
    }
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(%id, error = %e, "failed to read request body");
            return into_http_response(RelayResponse::text_response(400, format!("failed to read request body: {e}")));
        }
    };
    let mut headers = Headers::from(&parts.headers);
    for name in HOP_HEADERS {
        headers.remove(name);
    }
    let request = RelayRequest { method: parts.method, uri: parts.uri, headers, body };
    tracing::info!(%id, method = %request.method, uri = %request.uri, "relaying");

    match dispatcher.dispatch(&request).await {
        Ok(resp) => {
            tracing::info!(%id, status = resp.status, "relayed");
            into_http_response(resp)
        }
        Err(e) => {
            tracing::warn!(%id, category = e.category(), error = %e, "relay failed");
            into_http_response(RelayResponse::text_response(502, format!("Error relaying request: {e}")))
        }
    }
}

fn into_http_response(resp: RelayResponse) -> Response<RelayBody> {
    let mut headers = resp.headers;
    for name in HOP_HEADERS.iter().chain(&["content-length", "transfer-encoding"]) {
        headers.remove(name);
    }
    // hyper re-frames the body
    let mut out = Response::new(resp.body);
    match hyper::StatusCode::from_u16(resp.status) {
        Ok(status) => *out.status_mut() = status,
        Err(_) => {
            tracing::warn!(status = resp.status, "upstream sent an invalid status code");
            *out.status_mut() = hyper::StatusCode::BAD_GATEWAY;
        }
    }
    *out.headers_mut() = headers.to_header_map();
    out
}

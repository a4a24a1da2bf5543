use std::sync::Arc;

use crate::config::{PrivacyConfig, Strategy};
use crate::error::{RelayError, Result};
use crate::http_shared::{RelayRequest, RelayResponse};
use crate::selector::{Selector, ThreadRngSelector};
use crate::user_agent::random_user_agent;

use super::Transport;
use super::fetch::HyperFetch;
use super::raw_socket::RawSocketClient;
use super::socks5::Socks5TunnelClient;

/// Resolves a strategy per destination host and runs its fallback chain.
///
/// Each transport is tried at most once per request. Only the last failure
/// of a chain reaches the caller.
pub struct StrategyDispatcher<S = RawSocketClient, P = Socks5TunnelClient, F = HyperFetch> {
    config: Arc<PrivacyConfig>,
    socket: S,
    socks5: P,
    fetch: F,
    selector: Arc<dyn Selector>,
}

impl StrategyDispatcher {
    pub fn from_config(config: PrivacyConfig) -> Result<Self> {
        let selector: Arc<dyn Selector> = Arc::new(ThreadRngSelector);
        let fetch = HyperFetch::new()?;
        let socket = RawSocketClient::new(config.debug_mode)?;
        let socks5 = Socks5TunnelClient::new(
            config.socks5_api_urls.clone(),
            fetch.clone(),
            selector.clone(),
            config.debug_mode,
        )?;
        Ok(Self::with_parts(config, socket, socks5, fetch, selector))
    }
}

impl<S, P, F> StrategyDispatcher<S, P, F>
where
    S: Transport,
    P: Transport,
    F: Transport,
{
    pub fn with_parts(config: PrivacyConfig, socket: S, socks5: P, fetch: F, selector: Arc<dyn Selector>) -> Self {
        Self { config: Arc::new(config), socket, socks5, fetch, selector }
    }

    pub fn config(&self) -> &PrivacyConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enable_privacy_protection
    }

    pub fn resolve_strategy(&self, hostname: &str) -> Strategy {
        self.config.strategy_for_host(hostname)
    }

    /// Copy of `request` with the outbound User-Agent rewritten when
    /// randomization is on. The caller's request is never touched.
    pub fn prepare(&self, request: &RelayRequest) -> RelayRequest {
        let mut prepared = request.clone();
        if self.config.enable_user_agent_randomization {
            prepared.headers.set("User-Agent", random_user_agent(self.selector.as_ref()));
        }
        prepared
    }

    pub async fn dispatch(&self, request: &RelayRequest) -> Result<RelayResponse> {
        let hostname = request.hostname().unwrap_or_default();
        let strategy = self.resolve_strategy(&hostname);
        if self.config.debug_mode {
            tracing::debug!(host = %hostname, strategy = %strategy, method = %request.method, "dispatching request");
        }
        if strategy == Strategy::Direct {
            return self.fetch.send(request).await;
        }
        let prepared = self.prepare(request);
        self.execute(strategy, &prepared).await
    }

    async fn execute(&self, strategy: Strategy, request: &RelayRequest) -> Result<RelayResponse> {
        match strategy {
            Strategy::Direct | Strategy::Unrecognized => self.fetch.send(request).await,
            Strategy::SocketOnly => self.socket.send(request).await,
            Strategy::Socks5Only => self.socks5.send(request).await,
            Strategy::SocketWithFallback => match self.socket.send(request).await {
                Ok(resp) => Ok(resp),
                Err(e) if self.config.fallback_to_fetch => {
                    self.log_fallback(self.socket.name(), self.fetch.name(), &e);
                    self.fetch.send(request).await
                }
                Err(e) => Err(e),
            },
            Strategy::SocketWithSocks5 => match self.socket.send(request).await {
                Ok(resp) => Ok(resp),
                Err(e) => {
                    self.log_fallback(self.socket.name(), self.socks5.name(), &e);
                    self.socks5.send(request).await
                }
            },
            Strategy::Auto => {
                let tunneled = match self.socket.send(request).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        self.log_fallback(self.socket.name(), self.socks5.name(), &e);
                        self.socks5.send(request).await
                    }
                };
                match tunneled {
                    Ok(resp) => Ok(resp),
                    Err(e) if self.config.fallback_to_fetch => {
                        self.log_fallback(self.socks5.name(), self.fetch.name(), &e);
                        self.fetch.send(request).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn log_fallback(&self, from: &str, to: &str, err: &RelayError) {
        if self.config.debug_mode {
            tracing::warn!(from, to, category = err.category(), error = %err, "transport failed; falling back");
        } else {
            tracing::debug!(from, to, category = err.category(), "transport failed; falling back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WILDCARD;
    use crate::selector::SequenceSelector;
    use crate::user_agent::USER_AGENTS;
    use http::Method;
    use std::sync::Mutex;

    enum Outcome {
        Fail(RelayError),
        Respond(u16, &'static str),
    }

    struct MockTransport {
        name: &'static str,
        outcome: Outcome,
        seen: Mutex<Vec<RelayRequest>>,
    }

    impl MockTransport {
        fn failing(name: &'static str, err: RelayError) -> Arc<Self> {
            Arc::new(Self { name, outcome: Outcome::Fail(err), seen: Mutex::new(Vec::new()) })
        }

        fn responding(name: &'static str, status: u16, body: &'static str) -> Arc<Self> {
            Arc::new(Self { name, outcome: Outcome::Respond(status, body), seen: Mutex::new(Vec::new()) })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn last_seen(&self) -> RelayRequest {
            self.seen.lock().unwrap().last().cloned().expect("transport was not called")
        }
    }

    impl Transport for MockTransport {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn send(&self, request: &RelayRequest) -> Result<RelayResponse> {
            self.seen.lock().unwrap().push(request.clone());
            match &self.outcome {
                Outcome::Fail(e) => Err(e.clone()),
                Outcome::Respond(status, body) => Ok(RelayResponse::text_response(*status, *body)),
            }
        }
    }

    type Mock = Arc<MockTransport>;

    fn dispatcher(config: PrivacyConfig, socket: &Mock, socks5: &Mock, fetch: &Mock) -> StrategyDispatcher<Mock, Mock, Mock> {
        StrategyDispatcher::with_parts(
            config,
            socket.clone(),
            socks5.clone(),
            fetch.clone(),
            Arc::new(SequenceSelector::new(vec![2])),
        )
    }

    fn config_with(host: &str, strategy: Strategy, fallback_to_fetch: bool) -> PrivacyConfig {
        let mut config = PrivacyConfig { fallback_to_fetch, ..Default::default() };
        config.host_strategies.insert(host.to_string(), strategy);
        config
    }

    fn request(url: &str) -> RelayRequest {
        RelayRequest::new(Method::POST, url.parse().unwrap())
            .header("User-Agent", "cf-worker/1.0")
            .header("Content-Type", "application/json")
            .body("{}")
    }

    #[tokio::test]
    async fn test_auto_exhausts_chain_then_fetches_once() {
        let socket = MockTransport::failing("socket", RelayError::connection("refused"));
        let socks5 = MockTransport::failing("socks5", RelayError::protocol("bad reply"));
        let fetch = MockTransport::responding("fetch", 200, "from fetch");
        let d = dispatcher(config_with("api.example.com", Strategy::Auto, true), &socket, &socks5, &fetch);

        let resp = d.dispatch(&request("https://api.example.com/v1")).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.text().await.unwrap(), "from fetch");
        assert_eq!((socket.calls(), socks5.calls(), fetch.calls()), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_auto_without_fetch_fallback_returns_socks5_error() {
        let socket = MockTransport::failing("socket", RelayError::connection("refused"));
        let socks5 = MockTransport::failing("socks5", RelayError::auth("rejected"));
        let fetch = MockTransport::responding("fetch", 200, "from fetch");
        let d = dispatcher(config_with("api.example.com", Strategy::Auto, false), &socket, &socks5, &fetch);

        let err = d.dispatch(&request("https://api.example.com/v1")).await.unwrap_err();
        assert_eq!(err, RelayError::auth("rejected"));
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn test_auto_stops_at_first_success() {
        let socket = MockTransport::responding("socket", 201, "from socket");
        let socks5 = MockTransport::responding("socks5", 200, "from socks5");
        let fetch = MockTransport::responding("fetch", 200, "from fetch");
        let d = dispatcher(config_with("api.example.com", Strategy::Auto, true), &socket, &socks5, &fetch);

        let resp = d.dispatch(&request("https://api.example.com/v1")).await.unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!((socket.calls(), socks5.calls(), fetch.calls()), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_default_config_openai_falls_back_to_fetch_response() {
        let socket = MockTransport::failing("socket", RelayError::connection("connection reset"));
        let socks5 = MockTransport::responding("socks5", 200, "from socks5");
        let fetch = MockTransport::responding("fetch", 202, "from fetch");
        let d = dispatcher(PrivacyConfig::default(), &socket, &socks5, &fetch);

        assert_eq!(d.resolve_strategy("api.openai.com"), Strategy::SocketWithFallback);
        let resp = d.dispatch(&request("https://api.openai.com/v1/chat/completions")).await.unwrap();
        assert_eq!(resp.status, 202);
        assert_eq!(resp.text().await.unwrap(), "from fetch");
        assert_eq!(socks5.calls(), 0);
        // both attempts carried the same prepared request
        assert_eq!(socket.last_seen().headers.get("user-agent"), fetch.last_seen().headers.get("user-agent"));
    }

    #[tokio::test]
    async fn test_socket_with_fallback_disabled_propagates() {
        let socket = MockTransport::failing("socket", RelayError::connection("refused"));
        let socks5 = MockTransport::responding("socks5", 200, "");
        let fetch = MockTransport::responding("fetch", 200, "");
        let d = dispatcher(config_with("api.example.com", Strategy::SocketWithFallback, false), &socket, &socks5, &fetch);

        let err = d.dispatch(&request("https://api.example.com/")).await.unwrap_err();
        assert_eq!(err, RelayError::connection("refused"));
        assert_eq!(fetch.calls(), 0);
    }

    #[tokio::test]
    async fn test_gateway_goes_direct_unmodified() {
        let socket = MockTransport::responding("socket", 200, "");
        let socks5 = MockTransport::responding("socks5", 200, "");
        let fetch = MockTransport::responding("fetch", 200, "direct");
        let d = dispatcher(PrivacyConfig::default(), &socket, &socks5, &fetch);
        assert!(d.config().enable_user_agent_randomization);

        let req = request("https://gateway.ai.cloudflare.com/v1/acct/gw/openai");
        d.dispatch(&req).await.unwrap();
        assert_eq!((socket.calls(), socks5.calls(), fetch.calls()), (0, 0, 1));
        let seen = fetch.last_seen();
        assert_eq!(seen.headers.get("user-agent"), Some("cf-worker/1.0"));
        assert_eq!(seen.headers.len(), req.headers.len());
    }

    #[tokio::test]
    async fn test_disabled_protection_sends_everything_direct() {
        let socket = MockTransport::responding("socket", 200, "");
        let socks5 = MockTransport::responding("socks5", 200, "");
        let fetch = MockTransport::responding("fetch", 200, "");
        let config = PrivacyConfig { enable_privacy_protection: false, ..Default::default() };
        let d = dispatcher(config, &socket, &socks5, &fetch);
        assert!(!d.is_enabled());

        d.dispatch(&request("https://api.openai.com/v1")).await.unwrap();
        assert_eq!((socket.calls(), fetch.calls()), (0, 1));
        assert_eq!(fetch.last_seen().headers.get("user-agent"), Some("cf-worker/1.0"));
    }

    #[tokio::test]
    async fn test_socket_with_socks5_uses_tunnel_after_socket_failure() {
        let socket = MockTransport::failing("socket", RelayError::PlatformRestriction("blocked".into()));
        let socks5 = MockTransport::failing("socks5", RelayError::config("empty list"));
        let fetch = MockTransport::responding("fetch", 200, "");
        let d = dispatcher(config_with("api.example.com", Strategy::SocketWithSocks5, true), &socket, &socks5, &fetch);

        let err = d.dispatch(&request("https://api.example.com/")).await.unwrap_err();
        assert_eq!(err, RelayError::config("empty list"));
        assert_eq!((socket.calls(), socks5.calls(), fetch.calls()), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_single_transport_strategies_do_not_fall_back() {
        let socket = MockTransport::failing("socket", RelayError::connection("refused"));
        let socks5 = MockTransport::failing("socks5", RelayError::connection("refused"));
        let fetch = MockTransport::responding("fetch", 200, "");
        let mut config = config_with("socket.example.com", Strategy::SocketOnly, true);
        config.host_strategies.insert("tunnel.example.com".into(), Strategy::Socks5Only);
        let d = dispatcher(config, &socket, &socks5, &fetch);

        assert!(d.dispatch(&request("https://socket.example.com/")).await.is_err());
        assert!(d.dispatch(&request("https://tunnel.example.com/")).await.is_err());
        assert_eq!((socket.calls(), socks5.calls(), fetch.calls()), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_unrecognized_strategy_fetches_prepared_request() {
        let socket = MockTransport::responding("socket", 200, "");
        let socks5 = MockTransport::responding("socks5", 200, "");
        let fetch = MockTransport::responding("fetch", 200, "");
        let mut config = PrivacyConfig::default();
        config.host_strategies.insert(WILDCARD.into(), Strategy::Unrecognized);
        let d = dispatcher(config, &socket, &socks5, &fetch);

        d.dispatch(&request("https://unknown.example/")).await.unwrap();
        assert_eq!((socket.calls(), fetch.calls()), (0, 1));
        assert_eq!(fetch.last_seen().headers.get("user-agent"), Some(USER_AGENTS[2]));
    }

    #[test]
    fn test_prepare_leaves_original_untouched() {
        let socket = MockTransport::responding("socket", 200, "");
        let d = dispatcher(PrivacyConfig::default(), &socket, &socket, &socket);
        let original = request("https://api.example.com/");
        let prepared = d.prepare(&original);
        assert_eq!(original.headers.get("user-agent"), Some("cf-worker/1.0"));
        assert_eq!(prepared.headers.get("User-Agent"), Some(USER_AGENTS[2]));
        assert_eq!(prepared.headers.len(), original.headers.len());

        let plain = dispatcher(
            PrivacyConfig { enable_user_agent_randomization: false, ..Default::default() },
            &socket,
            &socket,
            &socket,
        );
        assert_eq!(plain.prepare(&original).headers.get("user-agent"), Some("cf-worker/1.0"));
    }
}

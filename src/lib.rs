pub mod config;
pub mod error;
pub mod http_shared;
pub mod logging;
pub mod privacy;
pub mod selector;
pub mod server;
pub mod user_agent;

use std::sync::Arc;

pub use config::{PrivacyConfig, Strategy};
pub use error::RelayError;
pub use http_shared::{RelayRequest, RelayResponse};
pub use privacy::StrategyDispatcher;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:38080";

/// Load configuration from the environment and serve until the process exits.
pub async fn run() -> Result<(), String> {
    let debug = std::env::var("DEBUG_MODE").is_ok_and(|v| config::parse_flag(&v));
    logging::init_logging(debug);

    let config = PrivacyConfig::from_env();
    let addr = std::env::var("RELAY_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.into());
    tracing::info!(
        privacy = config.enable_privacy_protection,
        providers = config.socks5_api_urls.len(),
        hosts = config.host_strategies.len(),
        "configuration loaded"
    );
    let dispatcher = StrategyDispatcher::from_config(config).map_err(|e| e.to_string())?;
    server::serve(&addr, Arc::new(dispatcher))
        .await
        .map_err(|e| format!("serve {addr}: {e}"))
}

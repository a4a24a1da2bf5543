use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Key in the host strategy map used when no exact hostname matches.
pub const WILDCARD: &str = "*";

/// Transport path used to forward a request to a given host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SocketOnly,
    SocketWithFallback,
    Socks5Only,
    SocketWithSocks5,
    Direct,
    Auto,
    /// Any configured value this build does not know; forwarded like `direct`.
    #[serde(other)]
    Unrecognized,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::SocketOnly => "socket_only",
            Strategy::SocketWithFallback => "socket_with_fallback",
            Strategy::Socks5Only => "socks5_only",
            Strategy::SocketWithSocks5 => "socket_with_socks5",
            Strategy::Direct => "direct",
            Strategy::Auto => "auto",
            Strategy::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type HostStrategyMap = HashMap<String, Strategy>;

/// Exact hostname, then the wildcard entry, then `direct`.
pub fn lookup(map: &HostStrategyMap, hostname: &str) -> Strategy {
    if let Some(s) = map.get(hostname) {
        return *s;
    }
    if let Some(s) = map.get(WILDCARD) {
        return *s;
    }
    Strategy::Direct
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub enable_privacy_protection: bool,
    pub socks5_api_urls: Vec<String>,
    pub enable_user_agent_randomization: bool,
    pub fallback_to_fetch: bool,
    pub debug_mode: bool,
    pub host_strategies: HostStrategyMap,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        let host_strategies = [
            ("api.openai.com", Strategy::SocketWithFallback),
            ("generativelanguage.googleapis.com", Strategy::SocketWithFallback),
            ("api.anthropic.com", Strategy::SocketWithFallback),
            ("api.cohere.ai", Strategy::SocketWithFallback),
            ("gateway.ai.cloudflare.com", Strategy::Direct),
            (WILDCARD, Strategy::SocketWithFallback),
        ]
        .into_iter()
        .map(|(h, s)| (h.to_string(), s))
        .collect();
        Self {
            enable_privacy_protection: true,
            socks5_api_urls: vec![
                "https://api1.example.com/socks5".into(),
                "https://api2.example.com/socks5".into(),
                "https://api3.example.com/socks5".into(),
            ],
            enable_user_agent_randomization: true,
            fallback_to_fetch: true,
            debug_mode: false,
            host_strategies,
        }
    }
}

/// Only the literal `true` enables a flag.
pub(crate) fn parse_flag(v: &str) -> bool {
    v.trim() == "true"
}

fn parse_url_list(v: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(v) {
        Ok(list) => list,
        Err(_) => v
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

impl PrivacyConfig {
    /// Overlay environment-style key/value pairs on the defaults. Absent or
    /// blank values keep their default; an unparsable `HOST_STRATEGIES` keeps
    /// the default map.
    pub fn from_env_map<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = PrivacyConfig::default();
        for (k, v) in vars {
            let v = v.as_ref();
            if v.trim().is_empty() {
                continue;
            }
            match k.as_ref() {
                "ENABLE_PRIVACY_PROTECTION" => config.enable_privacy_protection = parse_flag(v),
                "SOCKS5_API_URLS" => config.socks5_api_urls = parse_url_list(v),
                "ENABLE_USER_AGENT_RANDOMIZATION" => config.enable_user_agent_randomization = parse_flag(v),
                "FALLBACK_TO_FETCH" => config.fallback_to_fetch = parse_flag(v),
                "DEBUG_MODE" => config.debug_mode = parse_flag(v),
                "HOST_STRATEGIES" => match serde_json::from_str::<HostStrategyMap>(v) {
                    Ok(map) => config.host_strategies = map,
                    Err(e) => tracing::warn!(error = %e, "HOST_STRATEGIES is not a valid strategy map; keeping defaults"),
                },
                _ => {}
            }
        }
        config
    }

    pub fn from_env() -> Self {
        Self::from_env_map(std::env::vars())
    }

    /// Strategy for `hostname`, honouring the global protection switch.
    pub fn strategy_for_host(&self, hostname: &str) -> Strategy {
        if !self.enable_privacy_protection {
            return Strategy::Direct;
        }
        lookup(&self.host_strategies, hostname)
    }
}

use std::fmt;
use std::str::FromStr;

use crate::error::{RelayError, Result};
use crate::selector::Selector;

use super::ProxyListSource;

/// One SOCKS5 proxy taken from a provider list. Lives for a single request.
#[derive(Clone, PartialEq, Eq)]
pub struct Socks5Endpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Socks5Endpoint {
    /// Parse `["socks5://"] [user ":" pass "@"] host ":" port`.
    pub fn parse(line: &str) -> Result<Self> {
        let raw = line.trim();
        let rest = raw.strip_prefix("socks5://").unwrap_or(raw).trim_end_matches('/');
        let (auth, addr) = match rest.rsplit_once('@') {
            Some((auth, addr)) => (Some(auth), addr),
            None => (None, rest),
        };
        let (username, password) = match auth {
            Some(a) => match a.split_once(':') {
                Some((u, p)) => (Some(u), Some(p)),
                None => (Some(a), None),
            },
            None => (None, None),
        };
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| RelayError::config(format!("proxy entry has no port: {raw}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(RelayError::config(format!("proxy entry has no host: {raw}")));
        }
        let port = match port.parse::<u16>() {
            Ok(p) if p != 0 => p,
            _ => return Err(RelayError::config(format!("proxy entry has invalid port '{port}': {raw}"))),
        };
        let non_empty = |s: Option<&str>| s.filter(|v| !v.is_empty()).map(str::to_string);
        Ok(Self {
            host: host.to_string(),
            port,
            username: non_empty(username),
            password: non_empty(password),
        })
    }

    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

impl FromStr for Socks5Endpoint {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// credentials stay out of logs
impl fmt::Debug for Socks5Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Socks5Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_auth() {
            write!(f, "socks5://***:***@{}:{}", self.host, self.port)
        } else {
            write!(f, "socks5://{}:{}", self.host, self.port)
        }
    }
}

/// Non-empty, trimmed lines of a provider response.
pub fn proxy_lines(text: &str) -> Vec<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).collect()
}

/// Choose a provider, fetch its list, choose an entry and parse it.
pub async fn acquire_endpoint<L>(providers: &[String], source: &L, selector: &dyn Selector) -> Result<Socks5Endpoint>
where
    L: ProxyListSource,
{
    if providers.is_empty() {
        return Err(RelayError::config("no SOCKS5 proxy list providers configured"));
    }
    let url = &providers[selector.pick(providers.len())];
    let text = source.fetch_list(url).await?;
    if text.trim().is_empty() {
        return Err(RelayError::config(format!("proxy list from {url} is empty")));
    }
    let lines = proxy_lines(&text);
    if lines.is_empty() {
        return Err(RelayError::config(format!("proxy list from {url} has no entries")));
    }
    let line = lines[selector.pick(lines.len())];
    let endpoint = Socks5Endpoint::parse(line)?;
    tracing::debug!(provider = %url, endpoint = %endpoint, "selected SOCKS5 endpoint");
    Ok(endpoint)
}

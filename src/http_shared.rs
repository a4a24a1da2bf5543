use std::fmt;
use std::io;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use rand::{Rng, distributions::Alphanumeric};

/// Streaming body shared by every response shape the relay produces.
pub type RelayBody = UnsyncBoxBody<Bytes, io::Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered header list. `set` is case-insensitive and last-write-wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every entry named `name` with a single one, kept at the
    /// position of the first existing entry (or appended).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter().position(|h| h.name.eq_ignore_ascii_case(&name)) {
            Some(idx) => {
                self.0[idx] = Header { name: name.clone(), value };
                let mut seen = 0usize;
                self.0.retain(|h| {
                    if h.name.eq_ignore_ascii_case(&name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.0.push(Header { name, value }),
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header { name: name.into(), value: value.into() });
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before != self.0.len()
    }

    /// Entries that are not valid `http` header names/values are skipped.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.0.len());
        for h in self.0.iter() {
            if let (Ok(name), Ok(val)) = (h.name.parse::<HeaderName>(), h.value.parse::<HeaderValue>()) {
                map.append(name, val);
            }
        }
        map
    }

    /// One-line summary for debug logs; credentials are masked.
    pub fn preview(&self) -> String {
        self.0
            .iter()
            .map(|h| {
                let lname = h.name.to_ascii_lowercase();
                let v = if matches!(lname.as_str(), "authorization" | "proxy-authorization" | "cookie" | "set-cookie" | "x-api-key") {
                    "***"
                } else {
                    h.value.as_str()
                };
                format!("{}: {}", h.name, v)
            })
            .take(20)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

impl From<&HeaderMap> for Headers {
    fn from(map: &HeaderMap) -> Self {
        let mut out = Headers::new();
        for (name, value) in map.iter() {
            out.append(name.as_str(), value.to_str().unwrap_or(""));
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut out = Headers::new();
        for (k, v) in iter {
            out.append(k, v);
        }
        out
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Outbound request as handed to the dispatcher. The body is buffered so a
/// fallback step can replay it.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Bytes,
}

impl RelayRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { method, uri, headers: Headers::new(), body: Bytes::new() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Lowercased host of the target URI.
    pub fn hostname(&self) -> Option<String> {
        self.uri.host().map(|h| h.to_ascii_lowercase())
    }
}

pub struct RelayResponse {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: RelayBody,
}

impl fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl RelayResponse {
    pub fn new(status: u16, headers: Headers, body: RelayBody) -> Self {
        Self { status, reason: None, headers, body }
    }

    /// Plain-text response carrying `text` as its whole body.
    pub fn text_response(status: u16, text: impl Into<String>) -> Self {
        let text = text.into();
        let mut headers = Headers::new();
        headers.set("content-type", "text/plain; charset=utf-8");
        headers.set("content-length", text.len().to_string());
        Self::new(status, headers, full_body(Bytes::from(text)))
    }

    pub async fn bytes(self) -> io::Result<Bytes> {
        Ok(self.body.collect().await?.to_bytes())
    }

    pub async fn text(self) -> io::Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub fn full_body(bytes: Bytes) -> RelayBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty_body() -> RelayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn gen_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_is_last_write_wins_and_case_insensitive() {
        let mut headers: Headers = [("User-Agent", "a"), ("accept", "*/*"), ("user-agent", "b")]
            .into_iter()
            .collect();
        headers.set("USER-AGENT", "c");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("user-agent"), Some("c"));
        assert_eq!(headers.iter().next().map(|h| h.name.as_str()), Some("USER-AGENT"));
    }

    #[test]
    fn test_preview_masks_credentials() {
        let headers: Headers = [("Authorization", "Bearer sk-secret"), ("Accept", "text/plain")]
            .into_iter()
            .collect();
        let p = headers.preview();
        assert!(p.contains("Authorization: ***"));
        assert!(p.contains("Accept: text/plain"));
        assert!(!p.contains("sk-secret"));
    }

    #[tokio::test]
    async fn test_text_response_body() {
        let resp = RelayResponse::text_response(500, "Error socket connection: boom");
        assert_eq!(resp.status, 500);
        assert_eq!(resp.text().await.unwrap(), "Error socket connection: boom");
    }
}

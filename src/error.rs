use thiserror::Error;

/// Failure kinds surfaced by the transport clients and the dispatcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Transport-level connect/read/write failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// A connection failure attributed to the hosting platform's network policy.
    #[error("platform network restriction: {0}")]
    PlatformRestriction(String),

    /// Malformed SOCKS5 reply, version/method mismatch, malformed HTTP head.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SOCKS5 credentials rejected.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Malformed or empty proxy list, bad endpoint entry, unusable target.
    #[error("configuration error: {0}")]
    Config(String),
}

// Substrings (lowercase) that mark a connect failure as caused by host policy.
const RESTRICTION_MARKERS: &[&str] = &[
    "cloudflare",
    "cf-",
    "restricted",
    "blocked",
    "operation not permitted",
    "permission denied",
];

impl RelayError {
    pub fn connection(msg: impl Into<String>) -> Self {
        RelayError::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RelayError::Protocol(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        RelayError::Auth(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    /// Build a connection error, upgrading it to `PlatformRestriction` when the
    /// message carries one of the known blocking signatures.
    pub fn classify_connection(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if is_restriction_message(&msg) {
            RelayError::PlatformRestriction(msg)
        } else {
            RelayError::Connection(msg)
        }
    }

    pub fn is_platform_restriction(&self) -> bool {
        matches!(self, RelayError::PlatformRestriction(_))
    }

    /// Stable label for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Connection(_) => "connection",
            RelayError::PlatformRestriction(_) => "platform_restriction",
            RelayError::Protocol(_) => "protocol",
            RelayError::Auth(_) => "auth",
            RelayError::Config(_) => "config",
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            RelayError::Connection(m)
            | RelayError::PlatformRestriction(m)
            | RelayError::Protocol(m)
            | RelayError::Auth(m)
            | RelayError::Config(m) => m,
        }
    }
}

pub(crate) fn is_restriction_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    RESTRICTION_MARKERS.iter().any(|m| lower.contains(m))
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

use std::fmt;

/// Error taxonomy for the proxy core. Every per-connection fault is one of
/// these kinds; the driver (`driver::ConnectionDriver`) catches all of them
/// at its boundary and folds them into a `Failed` flow rather than
/// propagating panics or aborting the listener.
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed HTTP at the wire level (header or body framing).
    Parse(String),
    /// Socket read/write failure or premature EOF inside a framed region.
    Transport(String),
    /// Upstream unreachable, timed out, or refused the connection.
    Dial(String),
    /// TLS handshake failure, either server-side (to the client) or
    /// client-side (to the upstream).
    Tls(String),
    /// Root CA unusable, or leaf certificate minting failed.
    Ca(String),
    /// A single interceptor transform failed. Always recovered locally;
    /// this variant exists so the failure can be logged uniformly.
    Interceptor(String),
    /// Graceful shutdown signal observed at a suspension point.
    Cancelled,
}

impl ProxyError {
    /// Short diagnostic string stored on a `Failed` flow. Intentionally
    /// terse — this is operator-facing text, not a full error chain.
    pub fn reason(&self) -> String {
        match self {
            ProxyError::Parse(msg) => format!("parse: {msg}"),
            ProxyError::Transport(msg) => format!("transport: {msg}"),
            ProxyError::Dial(msg) => format!("dial: {msg}"),
            ProxyError::Tls(msg) => format!("tls: {msg}"),
            ProxyError::Ca(msg) => format!("ca: {msg}"),
            ProxyError::Interceptor(msg) => format!("interceptor: {msg}"),
            ProxyError::Cancelled => "cancelled".to_string(),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Transport(e.to_string())
    }
}

/// Specific parse failure modes surfaced by the codec. These all convert
/// into `ProxyError::Parse`/`ProxyError::Transport`; kept distinct at the
/// codec boundary so tests can assert on the exact failure.
#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    MalformedHeaders(String),
    MalformedBody(String),
    HeaderLimitExceeded,
    ShortRead,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::MalformedHeaders(msg) => write!(f, "malformed headers: {msg}"),
            CodecError::MalformedBody(msg) => write!(f, "malformed body: {msg}"),
            CodecError::HeaderLimitExceeded => write!(f, "header limit exceeded"),
            CodecError::ShortRead => write!(f, "short read"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for ProxyError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::ShortRead => ProxyError::Transport(e.to_string()),
            _ => ProxyError::Parse(e.to_string()),
        }
    }
}

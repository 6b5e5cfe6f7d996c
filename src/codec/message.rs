use bytes::Bytes;
use http::{Method, Version};

/// Insertion-ordered, case-insensitive header list.
///
/// A plain `Vec<(String, String)>` rather than `http::HeaderMap`: the codec
/// needs to preserve the exact on-wire order of duplicate names for a clean
/// round trip, and `HeaderMap`'s iteration order for appended values is not
/// guaranteed to match insertion order across distinct keys. Lookups are
/// case-insensitive per RFC 7230 §3.2.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, case-insensitive, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Replace all existing values for `name` with a single new value,
    /// appending if none existed. Used by the serializer to synthesize
    /// `Host`, `Content-Length`, and `Connection` when absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(entry) = self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            entry.1 = value.into();
        } else {
            self.0.push((name, value.into()));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A parsed HTTP/1.1 request. `target` is kept as the raw on-wire string
/// (not a parsed `Uri`) because a `CONNECT` target is `host:port`, which is
/// not a valid absolute-URI or origin-form target.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// For a `CONNECT` request, the `host:port` pair parsed from `target`.
    /// Returns `None` if the target has no explicit port.
    pub fn connect_authority(&self) -> Option<(String, u16)> {
        if !self.is_connect() {
            return None;
        }
        split_host_port(&self.target, None)
    }

    /// `https://host:port/` synthesized purely for logging.
    pub fn connect_log_url(&self) -> Option<String> {
        self.connect_authority()
            .map(|(host, port)| format!("https://{host}:{port}/"))
    }

    /// Host and port the request is destined for, for the plain-HTTP path:
    /// from an absolute-form target if present, else from the `Host` header,
    /// falling back to port 80.
    pub fn upstream_authority(&self, default_port: u16) -> Option<(String, u16)> {
        if let Some(rest) = self
            .target
            .strip_prefix("http://")
            .or_else(|| self.target.strip_prefix("https://"))
        {
            let authority = rest.split(['/', '?']).next().unwrap_or(rest);
            return split_host_port(authority, Some(default_port));
        }
        self.headers
            .get("host")
            .and_then(|h| split_host_port(h, Some(default_port)))
    }
}

/// A parsed HTTP/1.1 response. `reason` is kept even when it duplicates the
/// canonical reason phrase, since the serializer must echo exactly what a
/// modified response carries.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Response {
            version: Version::HTTP_11,
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Build the synthetic `502 Bad Gateway` response for a dial failure on
    /// the plain-HTTP path.
    pub fn bad_gateway(reason: &str) -> Self {
        let body = format!("Bad Gateway: {reason}");
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain; charset=utf-8");
        headers.push("Content-Length", body.len().to_string());
        Response {
            version: Version::HTTP_11,
            status: 502,
            reason: "Bad Gateway".to_string(),
            headers,
            body: Bytes::from(body),
        }
    }

    /// Synthetic `400 Bad Request` response for a parse failure on the
    /// plain HTTP path.
    pub fn bad_request(reason: &str) -> Self {
        let body = format!("Bad Request: {reason}");
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain; charset=utf-8");
        headers.push("Content-Length", body.len().to_string());
        Response {
            version: Version::HTTP_11,
            status: 400,
            reason: "Bad Request".to_string(),
            headers,
            body: Bytes::from(body),
        }
    }

    /// The synthetic response recorded on a Flow for a plain tunneled
    /// (non-MITM) `CONNECT`.
    pub fn connection_established() -> Self {
        Response::new(200, "Connection established")
    }
}

/// Split `host:port` (or a bare `host`) into parts. IPv6 literals in
/// brackets (`[::1]:443`) are handled; a bare IPv6 literal without brackets
/// is ambiguous with `host:port` and is not supported, matching the RFC
/// 7230 authority-form grammar the proxy is expected to see from clients.
fn split_host_port(s: &str, default_port: Option<u16>) -> Option<(String, u16)> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        return if let Some(port) = rest.strip_prefix(':') {
            Some((host.to_string(), port.parse().ok()?))
        } else {
            default_port.map(|p| (host.to_string(), p))
        };
    }
    match s.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => default_port.map(|p| (s.to_string(), p)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_case_insensitive_get() {
        let mut h = Headers::new();
        h.push("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn headers_get_all_preserves_order() {
        let mut h = Headers::new();
        h.push("Set-Cookie", "a=1");
        h.push("set-cookie", "b=2");
        assert_eq!(h.get_all("Set-Cookie"), vec!["a=1", "b=2"]);
    }

    #[test]
    fn split_host_port_with_port() {
        assert_eq!(
            split_host_port("example.com:8080", None),
            Some(("example.com".to_string(), 8080))
        );
    }

    #[test]
    fn split_host_port_default() {
        assert_eq!(
            split_host_port("example.com", Some(80)),
            Some(("example.com".to_string(), 80))
        );
    }

    #[test]
    fn split_host_port_ipv6() {
        assert_eq!(
            split_host_port("[::1]:443", None),
            Some(("::1".to_string(), 443))
        );
    }

    #[test]
    fn connect_log_url_formats() {
        let req = Request {
            method: Method::CONNECT,
            target: "example.com:443".to_string(),
            version: Version::HTTP_11,
            headers: Headers::new(),
            body: Bytes::new(),
        };
        assert_eq!(
            req.connect_log_url(),
            Some("https://example.com:443/".to_string())
        );
    }
}

use crate::codec::message::{Headers, Request, Response};
use crate::error::CodecError;
use bytes::{Bytes, BytesMut};
use http::{Method, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default ceiling on the header section, in bytes.
pub const DEFAULT_HEADER_LIMIT: usize = 64 * 1024;

/// Whether the in-flight message being parsed is a request or a response —
/// the start-line grammar and default body framing both depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Response,
}

/// Read a request from `src`, enforcing `header_limit` bytes on the header
/// section. No regular expressions are used anywhere in this module; the
/// header buffer is tokenized by hand with a single pass over the bytes.
pub async fn read_request<R: AsyncRead + Unpin>(
    src: &mut R,
    header_limit: usize,
) -> Result<Request, CodecError> {
    let (head, leftover) = read_header_block(src, header_limit).await?;
    let mut lines = split_lines(&head);
    let start_line = lines.next().ok_or_else(|| {
        CodecError::MalformedHeaders("empty request".to_string())
    })?;
    let (method, target, version) = parse_request_line(start_line)?;
    let mut headers = parse_header_lines(lines)?;

    let is_connect = method == Method::CONNECT;
    let body = if is_connect {
        // CONNECT carries no body; any bytes after the header terminator
        // belong to the tunnel, not to this message.
        Bytes::new()
    } else {
        read_body(src, &mut headers, leftover, Kind::Request).await?
    };

    Ok(Request {
        method,
        target,
        version,
        headers,
        body,
    })
}

/// Read a response from `src`. `allow_eof_body` controls whether a missing
/// `Content-Length`/`Transfer-Encoding` falls back to read-until-EOF framing
/// (true for upstream responses read over a connection the proxy closes
/// afterward; false would be appropriate for a persistent connection, which
/// this proxy never keeps open).
pub async fn read_response<R: AsyncRead + Unpin>(
    src: &mut R,
    header_limit: usize,
    allow_eof_body: bool,
) -> Result<Response, CodecError> {
    let (head, leftover) = read_header_block(src, header_limit).await?;
    let mut lines = split_lines(&head);
    let start_line = lines.next().ok_or_else(|| {
        CodecError::MalformedHeaders("empty response".to_string())
    })?;
    let (version, status, reason) = parse_status_line(start_line)?;
    let mut headers = parse_header_lines(lines)?;

    let body = if allow_eof_body {
        read_body(src, &mut headers, leftover, Kind::Response).await?
    } else {
        read_body_no_eof(src, &mut headers, leftover).await?
    };

    Ok(Response {
        version,
        status,
        reason,
        headers,
        body,
    })
}

/// Read bytes from `src` until `CRLF CRLF` is found, enforcing `limit`.
/// Returns the header block (excluding the terminator) and any body bytes
/// that were over-read into the same buffer.
async fn read_header_block<R: AsyncRead + Unpin>(
    src: &mut R,
    limit: usize,
) -> Result<(Vec<u8>, Vec<u8>), CodecError> {
    let mut buf = BytesMut::with_capacity(512);
    let mut scan_from = 0usize;
    loop {
        if let Some(pos) = find_subslice(&buf[scan_from..], b"\r\n\r\n") {
            let end = scan_from + pos;
            let head = buf[..end].to_vec();
            let leftover = buf[end + 4..].to_vec();
            return Ok((head, leftover));
        }
        // Keep re-scanning the last 3 bytes in case the terminator straddles
        // a read boundary.
        scan_from = buf.len().saturating_sub(3);

        if buf.len() >= limit {
            return Err(CodecError::HeaderLimitExceeded);
        }

        let mut chunk = [0u8; 4096];
        let n = src
            .read(&mut chunk)
            .await
            .map_err(|_| CodecError::ShortRead)?;
        if n == 0 {
            return Err(CodecError::ShortRead);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a header block on bare `CRLF`.
fn split_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block.split(|&b| b == b'\n').map(|line| {
        if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            line
        }
    })
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), CodecError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| CodecError::MalformedHeaders("non-utf8 start line".to_string()))?;
    let mut parts = line.splitn(3, ' ');
    let method_s = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodecError::MalformedHeaders("missing method".to_string()))?;
    let target = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodecError::MalformedHeaders("missing target".to_string()))?;
    let version_s = parts
        .next()
        .ok_or_else(|| CodecError::MalformedHeaders("missing version".to_string()))?;

    let method = Method::from_bytes(method_s.as_bytes())
        .map_err(|_| CodecError::MalformedHeaders(format!("invalid method: {method_s}")))?;
    let version = parse_version(version_s)?;
    Ok((method, target.to_string(), version))
}

fn parse_status_line(line: &[u8]) -> Result<(Version, u16, String), CodecError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| CodecError::MalformedHeaders("non-utf8 start line".to_string()))?;
    let mut parts = line.splitn(3, ' ');
    let version_s = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodecError::MalformedHeaders("missing version".to_string()))?;
    let status_s = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CodecError::MalformedHeaders("missing status".to_string()))?;
    let reason = parts.next().unwrap_or("").to_string();

    let version = parse_version(version_s)?;
    let status: u16 = status_s
        .parse()
        .map_err(|_| CodecError::MalformedHeaders(format!("invalid status: {status_s}")))?;

    let reason = if reason.is_empty() {
        if status == 200 {
            "OK".to_string()
        } else {
            String::new()
        }
    } else {
        reason
    };
    Ok((version, status, reason))
}

fn parse_version(s: &str) -> Result<Version, CodecError> {
    match s {
        "HTTP/1.0" => Ok(Version::HTTP_10),
        "HTTP/1.1" => Ok(Version::HTTP_11),
        other => Err(CodecError::MalformedHeaders(format!(
            "unsupported version: {other}"
        ))),
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a [u8]>) -> Result<Headers, CodecError> {
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let line = std::str::from_utf8(line)
            .map_err(|_| CodecError::MalformedHeaders("non-utf8 header".to_string()))?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeaders(format!("no colon in header: {line}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CodecError::MalformedHeaders("empty header name".to_string()));
        }
        headers.push(name, value.trim());
    }
    Ok(headers)
}

/// Body-framing priority order, used by both requests and responses. `kind`
/// only affects the EOF fallback, which is response-only.
async fn read_body<R: AsyncRead + Unpin>(
    src: &mut R,
    headers: &mut Headers,
    leftover: Vec<u8>,
    kind: Kind,
) -> Result<Bytes, CodecError> {
    if is_chunked(headers) {
        let body = read_chunked(src, leftover).await?;
        strip_chunked_framing(headers);
        return Ok(body);
    }
    if let Some(len) = content_length(headers)? {
        return read_exact_len(src, leftover, len).await;
    }
    if kind == Kind::Response {
        return read_until_eof(src, leftover).await;
    }
    Ok(Bytes::from(leftover))
}

async fn read_body_no_eof<R: AsyncRead + Unpin>(
    src: &mut R,
    headers: &mut Headers,
    leftover: Vec<u8>,
) -> Result<Bytes, CodecError> {
    if is_chunked(headers) {
        let body = read_chunked(src, leftover).await?;
        strip_chunked_framing(headers);
        return Ok(body);
    }
    if let Some(len) = content_length(headers)? {
        return read_exact_len(src, leftover, len).await;
    }
    Ok(Bytes::from(leftover))
}

/// Once a chunked body has been fully decoded into plain bytes, the message
/// no longer carries chunked framing: drop `Transfer-Encoding` so a later
/// `write_response` doesn't re-tag an un-chunked body as chunked, and drop
/// any stale `Content-Length` so it synthesizes one from the real length
/// instead of echoing a (possibly absent or mismatched) original value.
fn strip_chunked_framing(headers: &mut Headers) {
    headers.remove("transfer-encoding");
    headers.remove("content-length");
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &Headers) -> Result<Option<usize>, CodecError> {
    match headers.get("content-length") {
        None => Ok(None),
        Some(v) => {
            let n: i64 = v
                .trim()
                .parse()
                .map_err(|_| CodecError::MalformedHeaders(format!("bad content-length: {v}")))?;
            if n < 0 {
                return Err(CodecError::MalformedHeaders("negative content-length".to_string()));
            }
            Ok(Some(n as usize))
        }
    }
}

async fn read_exact_len<R: AsyncRead + Unpin>(
    src: &mut R,
    leftover: Vec<u8>,
    len: usize,
) -> Result<Bytes, CodecError> {
    let mut buf = leftover;
    if buf.len() >= len {
        buf.truncate(len);
        return Ok(Bytes::from(buf));
    }
    buf.reserve(len - buf.len());
    let target = len;
    while buf.len() < target {
        let mut chunk = vec![0u8; target - buf.len()];
        let n = src.read(&mut chunk).await.map_err(|_| CodecError::ShortRead)?;
        if n == 0 {
            return Err(CodecError::ShortRead);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(Bytes::from(buf))
}

async fn read_until_eof<R: AsyncRead + Unpin>(
    src: &mut R,
    leftover: Vec<u8>,
) -> Result<Bytes, CodecError> {
    let mut buf = leftover;
    let mut chunk = [0u8; 4096];
    loop {
        let n = src.read(&mut chunk).await.map_err(|_| CodecError::ShortRead)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(Bytes::from(buf))
}

/// Decode a chunked body. Trailers are read and discarded.
async fn read_chunked<R: AsyncRead + Unpin>(
    src: &mut R,
    leftover: Vec<u8>,
) -> Result<Bytes, CodecError> {
    let mut pending = leftover;
    let mut out = BytesMut::new();

    loop {
        let size_line = read_line_buffered(src, &mut pending).await?;
        let size_str = std::str::from_utf8(&size_line)
            .map_err(|_| CodecError::MalformedBody("non-utf8 chunk size".to_string()))?;
        // A chunk-extension (`;name=value`) may follow the hex size; ignore it.
        let size_str = size_str.split(';').next().unwrap_or(size_str).trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| CodecError::MalformedBody(format!("invalid chunk size: {size_str}")))?;

        if size == 0 {
            // Drain trailer lines until the empty line that ends the body.
            loop {
                let line = read_line_buffered(src, &mut pending).await?;
                if line.is_empty() {
                    break;
                }
            }
            break;
        }

        let chunk_data = read_n_buffered(src, &mut pending, size).await?;
        out.extend_from_slice(&chunk_data);
        // Each chunk is followed by a bare CRLF.
        let trailing = read_n_buffered(src, &mut pending, 2).await?;
        if trailing != b"\r\n" {
            return Err(CodecError::MalformedBody("missing chunk CRLF".to_string()));
        }
    }

    Ok(out.freeze())
}

/// Read one CRLF-terminated line, consuming from `pending` first and
/// topping up from `src` as needed. Used only inside chunked decoding where
/// lines are short.
async fn read_line_buffered<R: AsyncRead + Unpin>(
    src: &mut R,
    pending: &mut Vec<u8>,
) -> Result<Vec<u8>, CodecError> {
    loop {
        if let Some(pos) = find_subslice(pending, b"\r\n") {
            let line = pending[..pos].to_vec();
            pending.drain(..pos + 2);
            return Ok(line);
        }
        let mut chunk = [0u8; 256];
        let n = src.read(&mut chunk).await.map_err(|_| CodecError::ShortRead)?;
        if n == 0 {
            return Err(CodecError::ShortRead);
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

async fn read_n_buffered<R: AsyncRead + Unpin>(
    src: &mut R,
    pending: &mut Vec<u8>,
    n: usize,
) -> Result<Vec<u8>, CodecError> {
    while pending.len() < n {
        let mut chunk = vec![0u8; n - pending.len()];
        let read = src.read(&mut chunk).await.map_err(|_| CodecError::ShortRead)?;
        if read == 0 {
            return Err(CodecError::ShortRead);
        }
        pending.extend_from_slice(&chunk[..read]);
    }
    Ok(pending.drain(..n).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_simple_get() {
        let raw = b"GET http://httpbin/ip HTTP/1.1\r\nHost: httpbin\r\n\r\n";
        let mut cur = Cursor::new(raw.to_vec());
        let req = read_request(&mut cur, DEFAULT_HEADER_LIMIT).await.unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.target, "http://httpbin/ip");
        assert_eq!(req.headers.get("host"), Some("httpbin"));
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn parses_connect() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let mut cur = Cursor::new(raw.to_vec());
        let req = read_request(&mut cur, DEFAULT_HEADER_LIMIT).await.unwrap();
        assert!(req.is_connect());
        assert_eq!(
            req.connect_authority(),
            Some(("example.com".to_string(), 443))
        );
    }

    #[tokio::test]
    async fn parses_content_length_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello";
        let mut cur = Cursor::new(raw.to_vec());
        let req = read_request(&mut cur, DEFAULT_HEADER_LIMIT).await.unwrap();
        assert_eq!(&req.body[..], b"hello");
    }

    #[tokio::test]
    async fn header_limit_exceeded() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'x').take(100));
        let mut cur = Cursor::new(raw);
        let err = read_request(&mut cur, 32).await.unwrap_err();
        assert_eq!(err, CodecError::HeaderLimitExceeded);
    }

    #[tokio::test]
    async fn parses_response_status_default_reason() {
        let raw = b"HTTP/1.1 200\r\nContent-Length: 0\r\n\r\n";
        let mut cur = Cursor::new(raw.to_vec());
        let resp = read_response(&mut cur, DEFAULT_HEADER_LIMIT, true).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
    }

    #[tokio::test]
    async fn parses_response_missing_reason_non_200() {
        let raw = b"HTTP/1.1 404\r\nContent-Length: 0\r\n\r\n";
        let mut cur = Cursor::new(raw.to_vec());
        let resp = read_response(&mut cur, DEFAULT_HEADER_LIMIT, true).await.unwrap();
        assert_eq!(resp.reason, "");
    }

    #[tokio::test]
    async fn decodes_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut cur = Cursor::new(raw.to_vec());
        let resp = read_response(&mut cur, DEFAULT_HEADER_LIMIT, true).await.unwrap();
        assert_eq!(&resp.body[..], b"Wikipedia");
    }

    #[tokio::test]
    async fn decoded_chunked_response_drops_transfer_encoding_header() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut cur = Cursor::new(raw.to_vec());
        let resp = read_response(&mut cur, DEFAULT_HEADER_LIMIT, true).await.unwrap();
        assert!(!resp.headers.contains("transfer-encoding"));
        assert!(!resp.headers.contains("content-length"));
    }

    #[tokio::test]
    async fn invalid_chunk_size_fails() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nZZ\r\n\r\n";
        let mut cur = Cursor::new(raw.to_vec());
        let err = read_response(&mut cur, DEFAULT_HEADER_LIMIT, true).await.unwrap_err();
        assert!(matches!(err, CodecError::MalformedBody(_)));
    }

    #[tokio::test]
    async fn response_reads_until_eof_without_length() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\nhello world";
        let mut cur = Cursor::new(raw.to_vec());
        let resp = read_response(&mut cur, DEFAULT_HEADER_LIMIT, true).await.unwrap();
        assert_eq!(&resp.body[..], b"hello world");
    }
}

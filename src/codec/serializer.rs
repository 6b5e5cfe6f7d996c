use crate::codec::message::{Request, Response};
use bytes::{BufMut, Bytes, BytesMut};
use http::Version;

fn version_str(v: Version) -> &'static str {
    match v {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Serialize a request back to wire bytes. Synthesizes `Host` from the
/// target's authority when absent.
pub fn write_request(req: &Request) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(req.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(req.target.as_bytes());
    out.put_u8(b' ');
    out.put_slice(version_str(req.version).as_bytes());
    out.put_slice(b"\r\n");

    let mut wrote_host = false;
    for (name, value) in req.headers.iter() {
        if name.eq_ignore_ascii_case("host") {
            wrote_host = true;
        }
        write_header_line(&mut out, name, value);
    }

    if !wrote_host {
        if let Some(host) = synthesize_host(&req.target) {
            write_header_line(&mut out, "Host", &host);
        }
    }

    out.put_slice(b"\r\n");
    out.put_slice(&req.body);
    out.freeze()
}

/// Serialize a response back to wire bytes. Adds `Content-Length` when a
/// non-empty body carries neither framing header, and forces
/// `Connection: close` since the proxy never reuses upstream connections.
pub fn write_response(resp: &Response) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(version_str(resp.version).as_bytes());
    out.put_u8(b' ');
    out.put_slice(itoa::Buffer::new().format(resp.status).as_bytes());
    out.put_u8(b' ');
    out.put_slice(resp.reason.as_bytes());
    out.put_slice(b"\r\n");

    let has_length = resp.headers.contains("content-length");
    let has_chunked = resp
        .headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let has_connection = resp.headers.contains("connection");

    for (name, value) in resp.headers.iter() {
        write_header_line(&mut out, name, value);
    }

    if !resp.body.is_empty() && !has_length && !has_chunked {
        write_header_line(&mut out, "Content-Length", itoa::Buffer::new().format(resp.body.len()));
    }
    if !has_connection {
        write_header_line(&mut out, "Connection", "close");
    }

    out.put_slice(b"\r\n");
    out.put_slice(&resp.body);
    out.freeze()
}

fn write_header_line(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

fn synthesize_host(target: &str) -> Option<String> {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    if authority.is_empty() {
        None
    } else {
        Some(authority.to_string())
    }
}

/// Re-encode a fully decoded body as a single chunk followed by the
/// terminating zero-length chunk. Used when a response is re-emitted with
/// `Transfer-Encoding: chunked` retained (see the chunked re-emission policy
/// decision in DESIGN.md).
pub fn encode_single_chunk(body: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(format!("{:x}\r\n", body.len()).as_bytes());
    out.put_slice(body);
    out.put_slice(b"\r\n0\r\n\r\n");
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::message::Headers;

    #[test]
    fn writes_response_with_synthesized_content_length() {
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain");
        let resp = Response {
            version: Version::HTTP_11,
            status: 200,
            reason: "OK".to_string(),
            headers,
            body: Bytes::from_static(b"hello"),
        };
        let bytes = write_response(&resp);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn writes_request_synthesizes_host() {
        let req = Request {
            method: http::Method::GET,
            target: "http://httpbin/ip".to_string(),
            version: Version::HTTP_11,
            headers: Headers::new(),
            body: Bytes::new(),
        };
        let bytes = write_request(&req);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Host: httpbin\r\n"));
    }

    #[test]
    fn encode_single_chunk_roundtrips_length() {
        let body = b"Wikipedia";
        let encoded = encode_single_chunk(body);
        assert_eq!(&encoded[..], b"9\r\nWikipedia\r\n0\r\n\r\n");
    }
}

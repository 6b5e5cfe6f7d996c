//! End-to-end scenarios driving a real `ProxyListener` over loopback TCP:
//! plain forwarding, CONNECT tunneling, CONNECT MITM, chunked capture, and
//! an unreachable upstream. Each test binds its own proxy and fake upstream
//! on ephemeral ports so they can run concurrently.

use snitcher::interceptor::Pipeline;
use snitcher::{CertificateAuthority, Flow, FlowStatus, FlowStore, ProxyListener, ProxyOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_proxy(intercept_https: bool) -> (Arc<ProxyListener>, FlowStore, std::net::SocketAddr) {
    let ca = Arc::new(CertificateAuthority::load_or_generate(None, None).unwrap());
    let flow_store = FlowStore::new();
    let pipeline = Arc::new(Pipeline::empty());
    let listener = Arc::new(ProxyListener::new(ca, flow_store.clone(), pipeline));
    let options = ProxyOptions {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        intercept_https,
        ca_path: None,
        ca_password: None,
        dial_timeout_secs: 2.0,
        idle_timeout_secs: 2.0,
    };
    let addr = listener.start(options).await.unwrap();
    (listener, flow_store, addr)
}

/// Wait until the store holds at least one flow, polling briefly — the
/// driver task finalizes asynchronously after the test's own I/O completes.
async fn wait_for_flow(store: &FlowStore) -> Flow {
    for _ in 0..100 {
        if let Some(flow) = store.list(Some(1)).into_iter().next() {
            return flow;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no flow captured within timeout");
}

#[tokio::test]
async fn plain_get_round_trips_and_captures_flow() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = sock.read(&mut buf).await.unwrap();
        let request_text = String::from_utf8_lossy(&buf[..n]);
        assert!(request_text.starts_with("GET http://"));
        assert!(request_text.contains("/ip HTTP/1.1\r\n"));
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 14\r\n\r\n{\"ip\":\"1.2.3\"}")
            .await
            .unwrap();
    });

    let (listener, flow_store, proxy_addr) = start_proxy(false).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!(
        "GET http://{upstream_addr}/ip HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response_text.ends_with("{\"ip\":\"1.2.3\"}"));

    let flow = wait_for_flow(&flow_store).await;
    assert_eq!(flow.status, FlowStatus::Completed);
    assert_eq!(flow.request.method, http::Method::GET);
    assert_eq!(flow.response.status, 200);
    assert_eq!(flow.response.body.len(), 14);

    listener.stop().await;
}

#[tokio::test]
async fn connect_tunnel_copies_bytes_when_interception_disabled() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let mut buf = [0u8; 4];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");
        sock.write_all(b"PONG").await.unwrap();
    });

    let (listener, flow_store, proxy_addr) = start_proxy(false).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let connect = format!("CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n");
    client.write_all(connect.as_bytes()).await.unwrap();

    let mut ack = [0u8; 39];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"HTTP/1.1 200 Connection established\r\n\r\n");

    client.write_all(b"PING").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"PONG");
    drop(client);

    let flow = wait_for_flow(&flow_store).await;
    assert_eq!(flow.status, FlowStatus::Completed);
    assert!(flow.request.is_connect());

    listener.stop().await;
}

#[tokio::test]
async fn connect_mitm_captures_inner_request_over_both_tls_legs() {
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use rustls::pki_types::{IpAddr as RustlsIpAddr, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    // The fake upstream speaks TLS with its own throwaway self-signed cert.
    // The proxy's upstream leg never verifies it (see `tls::upstream_client_config`),
    // so nothing needs to chain to the proxy's own root.
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["upstream.test".to_string()]).unwrap();
    let upstream_chain = vec![cert.der().clone()];
    let upstream_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let upstream_server_config = snitcher::tls::leaf_server_config(upstream_chain, upstream_key).unwrap();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    tokio::spawn(async move {
        let (sock, _) = upstream.accept().await.unwrap();
        let acceptor = TlsAcceptor::from(upstream_server_config);
        let mut tls = acceptor.accept(sock).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = tls.read(&mut buf).await.unwrap();
        let request_text = String::from_utf8_lossy(&buf[..n]);
        assert!(request_text.starts_with("GET /secret HTTP/1.1\r\n"));
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
    });

    let ca = Arc::new(CertificateAuthority::load_or_generate(None, None).unwrap());
    let root_der = ca.root_certificate_der()[0].clone();

    let flow_store = FlowStore::new();
    let pipeline = Arc::new(Pipeline::empty());
    let listener = Arc::new(ProxyListener::new(ca, flow_store.clone(), pipeline));
    let options = ProxyOptions {
        listen_address: "127.0.0.1".to_string(),
        listen_port: 0,
        intercept_https: true,
        ca_path: None,
        ca_password: None,
        dial_timeout_secs: 2.0,
        idle_timeout_secs: 2.0,
    };
    let proxy_addr = listener.start(options).await.unwrap();

    let mut raw = TcpStream::connect(proxy_addr).await.unwrap();
    let connect = format!("CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n");
    raw.write_all(connect.as_bytes()).await.unwrap();
    let mut ack = [0u8; 39];
    raw.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"HTTP/1.1 200 Connection established\r\n\r\n");

    // The CONNECT target was a bare IP, so `get_for_host` minted an IP-SAN
    // leaf; the client must present a matching IP `ServerName` to verify it
    // against the trusted root above.
    let mut roots = RootCertStore::empty();
    roots.add(root_der).unwrap();
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::IpAddress(RustlsIpAddr::from(upstream_addr.ip()));

    let mut client_tls = tokio::time::timeout(Duration::from_secs(2), connector.connect(server_name, raw))
        .await
        .expect("handshake did not time out")
        .expect("client TLS handshake against minted leaf should succeed");

    client_tls
        .write_all(b"GET /secret HTTP/1.1\r\nHost: upstream.test\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client_tls.read_to_end(&mut response).await.unwrap();
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response_text.ends_with("ok"));

    let flow = wait_for_flow(&flow_store).await;
    assert_eq!(flow.status, FlowStatus::Completed);
    assert_eq!(flow.request.target, "/secret");

    listener.stop().await;
}

#[tokio::test]
async fn chunked_response_is_captured_and_reemitted_with_content_length() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = upstream.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = sock.read(&mut buf).await.unwrap();
        sock.write_all(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
    });

    let (listener, flow_store, proxy_addr) = start_proxy(false).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("GET http://{upstream_addr}/ HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.contains("Content-Length: 9"));
    assert!(response_text.ends_with("Wikipedia"));

    let flow = wait_for_flow(&flow_store).await;
    assert_eq!(flow.status, FlowStatus::Completed);
    assert_eq!(&flow.response.body[..], b"Wikipedia");

    listener.stop().await;
}

#[tokio::test]
async fn upstream_refused_yields_bad_gateway_and_failed_flow() {
    // Bind then immediately drop to obtain a port nothing is listening on.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let (listener, flow_store, proxy_addr) = start_proxy(false).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let request = format!("GET http://{dead_addr}/ HTTP/1.1\r\nHost: {dead_addr}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let response_text = String::from_utf8_lossy(&response);
    assert!(response_text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert!(response_text.contains("text/plain"));

    let flow = wait_for_flow(&flow_store).await;
    assert_eq!(flow.status, FlowStatus::Failed);
    assert!(flow.failure_reason.unwrap().contains("dial"));

    listener.stop().await;
}

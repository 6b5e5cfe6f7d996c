//! The MITM state: server-side TLS termination toward the client using a
//! minted leaf, client-side TLS origination toward the real upstream, and a
//! single inner HTTP transaction run over both decrypted streams.
//!
//! Design decision (see DESIGN.md): the client already received the plain
//! `200 Connection established` ack and begins its TLS handshake
//! immediately, so the server-side accept happens first. A dial/handshake
//! failure to the upstream *after* that point cannot fall back to a plain
//! byte-copy tunnel without breaking the client's already-started TLS
//! session; it closes the connection instead.

use crate::ca::CertificateEntry;
use crate::codec;
use crate::driver::ConnectionDriver;
use crate::error::ProxyError;
use crate::flow::Flow;
use crate::interceptor::FlowContext;
use crate::tls;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub async fn run(
    driver: &mut ConnectionDriver,
    client: TcpStream,
    host: &str,
    port: u16,
    cert: Arc<CertificateEntry>,
    flow: &mut Flow,
) {
    let server_config = match tls::leaf_server_config(cert.chain.clone(), clone_key(&cert.key)) {
        Ok(cfg) => cfg,
        Err(e) => {
            flow.fail(ProxyError::Tls(e.to_string()).reason());
            return;
        }
    };

    let acceptor = TlsAcceptor::from(server_config);
    let mut client_tls = match acceptor.accept(client).await {
        Ok(stream) => stream,
        Err(e) => {
            flow.fail(ProxyError::Tls(format!("client handshake: {e}")).reason());
            return;
        }
    };

    let upstream = match driver.dial(host, port).await {
        Ok(s) => s,
        Err(e) => {
            let _ = client_tls.shutdown().await;
            flow.fail(e.reason());
            return;
        }
    };

    let client_config = tls::upstream_client_config();
    let connector = TlsConnector::from(client_config);
    let server_name = match ServerName::try_from(host.to_string()) {
        Ok(name) => name,
        Err(_) => {
            let _ = client_tls.shutdown().await;
            flow.fail("tls: invalid SNI hostname".to_string());
            return;
        }
    };

    let mut upstream_tls = match connector.connect(server_name, upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = client_tls.shutdown().await;
            flow.fail(ProxyError::Tls(format!("upstream handshake: {e}")).reason());
            return;
        }
    };

    // A single inner transaction per MITM'd CONNECT; additional
    // transactions within the same tunnel are not required.
    let inner_request = match codec::read_request(&mut client_tls, codec::DEFAULT_HEADER_LIMIT).await {
        Ok(req) => req,
        Err(e) => {
            let proxy_err: ProxyError = e.into();
            flow.fail(proxy_err.reason());
            return;
        }
    };

    flow.request = inner_request.clone();
    let ctx = FlowContext::for_flow(flow);
    let inner_request = driver.handles.pipeline.run_request(inner_request, &ctx);

    if let Err(e) = upstream_tls.write_all(&codec::write_request(&inner_request)).await {
        flow.fail(ProxyError::Transport(e.to_string()).reason());
        return;
    }

    let idle = Duration::from_secs_f64(driver.handles.options.idle_timeout_secs);
    let inner_response = match tokio::time::timeout(
        idle,
        codec::read_response(&mut upstream_tls, codec::DEFAULT_HEADER_LIMIT, true),
    )
    .await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            let proxy_err: ProxyError = e.into();
            flow.request = inner_request;
            flow.fail(proxy_err.reason());
            return;
        }
        Err(_) => {
            flow.request = inner_request;
            flow.fail("dial: upstream idle timeout".to_string());
            return;
        }
    };

    let inner_response = driver.handles.pipeline.run_response(inner_response, &ctx);
    let _ = client_tls
        .write_all(&codec::write_response(&inner_response))
        .await;

    flow.request = inner_request;
    flow.complete(inner_response);
}

fn clone_key(key: &rustls::pki_types::PrivateKeyDer<'static>) -> rustls::pki_types::PrivateKeyDer<'static> {
    key.clone_key()
}

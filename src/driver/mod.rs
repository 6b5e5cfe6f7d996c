//! Connection driver — the core of the core. Drives exactly one accepted
//! client socket end-to-end through a phased lifecycle:
//!
//! 1. PARSE       — read the request from the client with the HTTP codec.
//! 2. FWD_HTTP / DECIDE_TLS — plain HTTP forwarding, or branch on `CONNECT`.
//! 3. MITM / TUNNEL — terminate-and-re-originate TLS, or pass bytes through.
//! 4. EMIT_FLOW   — finalize status/duration, store, and broadcast.
//!
//! Every exit path — success, parse failure, dial failure, interceptor
//! failure, or cancellation — funnels through `emit_flow` exactly once.

mod mitm;
mod tunnel;

use crate::ca::CertificateAuthority;
use crate::codec::{self, Request, Response};
use crate::config::ProxyOptions;
use crate::error::ProxyError;
use crate::flow::{Flow, FlowStore};
use crate::interceptor::{FlowContext, Pipeline};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handles shared across every driver instance — the process-lifetime
/// singletons: CA, flow store, pipeline, and configuration.
#[derive(Clone)]
pub struct DriverHandles {
    pub ca: Arc<CertificateAuthority>,
    pub flow_store: FlowStore,
    pub pipeline: Arc<Pipeline>,
    pub options: Arc<ProxyOptions>,
    pub events: tokio::sync::broadcast::Sender<Flow>,
}

/// Owns one accepted client socket and its (eventual) upstream socket. A
/// fresh `ConnectionDriver` is constructed per connection; it never shares
/// mutable state with another driver.
pub struct ConnectionDriver {
    handles: DriverHandles,
    client_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ConnectionDriver {
    pub fn new(handles: DriverHandles, client_addr: SocketAddr, cancel: CancellationToken) -> Self {
        ConnectionDriver {
            handles,
            client_addr,
            cancel,
        }
    }

    /// Drive `stream` to completion. Never returns an `Err` that the caller
    /// must propagate — every failure is folded into a stored, emitted
    /// `Failed` flow before this returns.
    pub async fn run(mut self, mut stream: TcpStream) {
        // PARSE
        let request = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.emit_cancelled(None);
                return;
            }
            result = codec::read_request(&mut stream, codec::DEFAULT_HEADER_LIMIT) => result,
        };

        let request = match request {
            Ok(req) => req,
            Err(e) => {
                let proxy_err: ProxyError = e.into();
                self.handle_parse_failure(&mut stream, proxy_err).await;
                return;
            }
        };

        let mut flow = Flow::pending(self.client_addr.to_string(), request.clone());

        if request.is_connect() {
            self.drive_connect(stream, request, &mut flow).await;
        } else {
            self.drive_plain_http(stream, request, &mut flow).await;
        }

        self.emit_flow(flow);
    }

    async fn handle_parse_failure(&mut self, stream: &mut TcpStream, err: ProxyError) {
        let dummy = Request {
            method: http::Method::GET,
            target: String::new(),
            version: http::Version::HTTP_11,
            headers: Default::default(),
            body: Default::default(),
        };
        let mut flow = Flow::pending(self.client_addr.to_string(), dummy);
        let response = Response::bad_request(&err.reason());
        let _ = stream.write_all(&codec::write_response(&response)).await;
        flow.fail(err.reason());
        self.emit_flow(flow);
    }

    /// FWD_HTTP: plain (non-CONNECT) HTTP forwarding.
    async fn drive_plain_http(&mut self, mut client: TcpStream, request: Request, flow: &mut Flow) {
        let ctx = FlowContext::for_flow(flow);
        let request = self.handles.pipeline.run_request(request, &ctx);

        let Some((host, port)) = request.upstream_authority(80) else {
            let response = Response::bad_gateway("no upstream host in request");
            let _ = client.write_all(&codec::write_response(&response)).await;
            flow.request = request;
            flow.fail("dial: missing upstream host");
            return;
        };

        let mut upstream = match self.dial(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                let response = Response::bad_gateway(&e.reason());
                let _ = client.write_all(&codec::write_response(&response)).await;
                flow.request = request;
                flow.fail(e.reason());
                return;
            }
        };

        if let Err(e) = upstream.write_all(&codec::write_request(&request)).await {
            flow.request = request;
            flow.fail(ProxyError::Transport(e.to_string()).reason());
            return;
        }

        let idle = Duration::from_secs_f64(self.handles.options.idle_timeout_secs);
        let response = match tokio::time::timeout(
            idle,
            codec::read_response(&mut upstream, codec::DEFAULT_HEADER_LIMIT, true),
        )
        .await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let proxy_err: ProxyError = e.into();
                let resp = Response::bad_gateway(&proxy_err.reason());
                let _ = client.write_all(&codec::write_response(&resp)).await;
                flow.request = request;
                flow.fail(proxy_err.reason());
                return;
            }
            Err(_) => {
                let resp = Response::bad_gateway("upstream idle timeout");
                let _ = client.write_all(&codec::write_response(&resp)).await;
                flow.request = request;
                flow.fail("dial: upstream idle timeout");
                return;
            }
        };

        let response = self.handles.pipeline.run_response(response, &ctx);
        let _ = client.write_all(&codec::write_response(&response)).await;

        flow.request = request;
        flow.complete(response);
    }

    /// DECIDE_TLS / MITM / TUNNEL for a `CONNECT` request.
    async fn drive_connect(&mut self, client: TcpStream, request: Request, flow: &mut Flow) {
        flow.request = request.clone();

        let Some((host, port)) = request.connect_authority() else {
            let mut client = client;
            let response = Response::bad_request("malformed CONNECT target");
            let _ = client.write_all(&codec::write_response(&response)).await;
            flow.fail("parse: malformed CONNECT target");
            return;
        };

        if !self.handles.options.intercept_https {
            self.run_tunnel(client, &host, port, flow).await;
            return;
        }

        match self
            .handles
            .ca
            .get_for_host(&host)
            .map_err(|e| ProxyError::Ca(e.reason()))
        {
            Ok(cert) => {
                mitm::run(self, client, &host, port, cert, flow).await;
            }
            Err(e) => {
                warn!(host = %host, error = %e, "leaf mint failed, falling back to tunnel");
                self.run_tunnel(client, &host, port, flow).await;
            }
        }
    }

    async fn run_tunnel(&mut self, mut client: TcpStream, host: &str, port: u16, flow: &mut Flow) {
        let upstream = match self.dial(host, port).await {
            Ok(s) => s,
            Err(_) => {
                let _ = client.shutdown().await;
                flow.fail("dial: tunnel upstream unreachable");
                return;
            }
        };

        if let Err(e) = client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
        {
            flow.fail(ProxyError::Transport(e.to_string()).reason());
            return;
        }

        flow.response = Response::connection_established();
        match tunnel::copy_bidirectional(client, upstream, &self.cancel).await {
            Ok(()) => flow.complete(Response::connection_established()),
            Err(e) => flow.fail(e.reason()),
        }
    }

    /// Dial the upstream with the configured timeout.
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let timeout = Duration::from_secs_f64(self.handles.options.dial_timeout_secs);
        let addr = format!("{host}:{port}");
        let started = std::time::Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Cancelled),
            result = tokio::time::timeout(timeout, TcpStream::connect(&addr)) => {
                match result {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(ProxyError::Dial(e.to_string())),
                    Err(_) => Err(ProxyError::Dial(format!("timed out connecting to {addr}"))),
                }
            }
        };
        metrics::histogram!("snitcher_dial_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    fn emit_cancelled(&self, partial_request: Option<Request>) {
        let request = partial_request.unwrap_or_else(|| Request {
            method: http::Method::GET,
            target: String::new(),
            version: http::Version::HTTP_11,
            headers: Default::default(),
            body: Default::default(),
        });
        let mut flow = Flow::pending(self.client_addr.to_string(), request);
        flow.fail(ProxyError::Cancelled.reason());
        self.emit_flow(flow);
    }

    /// EMIT_FLOW: finalize, store, and broadcast. Runs exactly once per
    /// connection.
    fn emit_flow(&self, mut flow: Flow) {
        if matches!(flow.status, crate::flow::FlowStatus::Pending) {
            // Any path that reached here without calling complete()/fail()
            // is a driver bug; treat it as failed rather than storing a
            // flow that violates the "never Pending at store time" invariant.
            flow.fail("internal: driver exited without finalizing flow");
        }
        let duration_text = flow
            .duration
            .map(|d| humantime::format_duration(d).to_string())
            .unwrap_or_else(|| "n/a".to_string());
        debug!(
            flow_id = %flow.id,
            status = ?flow.status,
            client = %flow.client_addr,
            duration = %duration_text,
            "flow captured"
        );
        let status_label = match flow.status {
            crate::flow::FlowStatus::Completed => "completed",
            crate::flow::FlowStatus::Failed => "failed",
            crate::flow::FlowStatus::Pending => "pending",
        };
        metrics::counter!("snitcher_flows_total", "status" => status_label).increment(1);
        if let Some(duration) = flow.duration {
            metrics::histogram!("snitcher_flow_duration_seconds").record(duration.as_secs_f64());
        }
        self.handles.flow_store.put(flow.clone());
        let _ = self.handles.events.send(flow);
    }
}

//! Ambient process wiring: CLI bootstrap, the admin HTTP endpoint, and
//! container-aware tokio runtime sizing. None of this is part of the proxy
//! core in `crate::driver`/`crate::listener` — it only assembles it into a
//! runnable process.

mod admin;
pub mod bootstrap;
pub mod runtime;

use crate::flow::FlowStore;
use crate::listener::ProxyListener;
use crate::metrics::Metrics;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AdminState {
    pub metrics: Metrics,
    pub flow_store: FlowStore,
    pub listener: Arc<ProxyListener>,
}

/// Serve `/health`, `/ready`, and `/metrics` until the process exits. Unlike
/// the proxy listener this has no stop/restart lifecycle of its own — it
/// lives for the process and is taken down with it.
pub async fn run_admin_server(listen: &str, state: AdminState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let tcp_listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "admin endpoint listening");

    loop {
        let (stream, _) = tcp_listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(error = %e, "admin connection error");
                }
            }
        });
    }
}

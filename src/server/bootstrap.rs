//! Process lifecycle: init tracing and metrics, load configuration, bring
//! up the CA and proxy listener, serve the admin endpoint, then wait for a
//! shutdown signal and drain.

use crate::ca::CertificateAuthority;
use crate::config::ProxyOptions;
use crate::flow::FlowStore;
use crate::interceptor::builtins::{HeaderInjector, ResponseLogger};
use crate::interceptor::Pipeline;
use crate::listener::ProxyListener;
use crate::metrics::Metrics;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub listen_override: Option<String>,
    pub admin_listen: String,
    pub intercept_https: bool,
    pub ca_path: Option<PathBuf>,
    pub ca_password: Option<String>,
}

/// Proxy lifecycle: init → load → listen → serve admin → wait for signal → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    let metrics = Metrics::install();

    let mut options = ProxyOptions::load(&args.config_path)?;
    if let Some(listen) = &args.listen_override {
        let (address, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--listen must be host:port"))?;
        options.listen_address = address.to_string();
        options.listen_port = port.parse()?;
    }
    if args.intercept_https {
        options.intercept_https = true;
    }
    if args.ca_path.is_some() {
        options.ca_path = args.ca_path.clone();
    }
    if args.ca_password.is_some() {
        options.ca_password = args.ca_password.clone();
    }
    options.validate()?;

    let ca = Arc::new(CertificateAuthority::load_or_generate(
        options.ca_path.as_deref(),
        options.ca_password.as_deref(),
    )?);
    let flow_store = FlowStore::new();
    let pipeline = Arc::new(Pipeline::new(
        vec![Box::new(HeaderInjector::new(Vec::new()))],
        vec![Box::new(ResponseLogger::new())],
    ));

    let listener = Arc::new(ProxyListener::new(ca, flow_store.clone(), pipeline));
    let listen_addr = listener.start(options.clone()).await?;
    tracing::info!(addr = %listen_addr, intercept_https = options.intercept_https, "proxy listening");

    let admin_state = super::AdminState {
        metrics,
        flow_store,
        listener: listener.clone(),
    };
    let admin_listen = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = super::run_admin_server(&admin_listen, admin_state).await {
            tracing::error!(error = %e, "admin server exited");
        }
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    listener.stop().await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(guard);
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

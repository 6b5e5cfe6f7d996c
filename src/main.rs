#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use snitcher::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "snitcherd", about = "Intercepting HTTP/HTTPS proxy")]
struct Cli {
    /// Path to a TOML or JSON config file.
    #[arg(short, long, default_value = "snitcher.toml")]
    config: PathBuf,

    /// Override the configured listen address, as host:port.
    #[arg(short, long)]
    listen: Option<String>,

    /// Address the admin endpoint (/health, /ready, /metrics) binds to.
    #[arg(long, default_value = "127.0.0.1:9091")]
    admin_listen: String,

    /// Terminate and re-originate TLS for CONNECT tunnels instead of
    /// passing them through opaque.
    #[arg(long)]
    intercept_https: bool,

    /// Path to the encrypted root CA file (loaded if present, generated
    /// and persisted there otherwise).
    #[arg(long)]
    ca_path: Option<PathBuf>,

    /// Password protecting the root CA file at `ca_path`.
    #[arg(long)]
    ca_password: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let worker_threads = server::runtime::get_container_cpu_limit();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;
    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen_override: cli.listen,
        admin_listen: cli.admin_listen,
        intercept_https: cli.intercept_https,
        ca_path: cli.ca_path,
        ca_password: cli.ca_password,
    }))
}

//! Proxy listener: bind/accept/spawn, start/stop lifecycle, and the
//! flow-captured event bus.

use crate::ca::CertificateAuthority;
use crate::config::ProxyOptions;
use crate::driver::{ConnectionDriver, DriverHandles};
use crate::flow::{Flow, FlowStore};
use crate::interceptor::Pipeline;
use futures_util::FutureExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace period `stop()` gives outstanding driver tasks before aborting
/// them (default 5 seconds).
const STOP_GRACE_PERIOD: std::time::Duration = std::time::Duration::from_secs(5);

/// Bounded per-subscriber buffer for the flow-captured event bus. A slow
/// subscriber drops its oldest buffered event on overflow rather than
/// blocking the driver that produced it — exactly `tokio::sync::
/// broadcast`'s lagging-receiver behavior.
const EVENT_BUS_CAPACITY: usize = 1024;

/// The listener's lifecycle state. At most one `start` is ever in flight;
/// `start` after `stop` is valid (the listener is restartable).
struct Running {
    accept_task: JoinHandle<()>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

/// Explicit construction, no DI container: the caller hands the listener
/// concrete CA, flow store, and pipeline instances.
pub struct ProxyListener {
    ca: Arc<CertificateAuthority>,
    flow_store: FlowStore,
    pipeline: Arc<Pipeline>,
    events: broadcast::Sender<Flow>,
    running: std::sync::Mutex<Option<Running>>,
    is_running: AtomicBool,
}

impl ProxyListener {
    pub fn new(ca: Arc<CertificateAuthority>, flow_store: FlowStore, pipeline: Arc<Pipeline>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        ProxyListener {
            ca,
            flow_store,
            pipeline,
            events,
            running: std::sync::Mutex::new(None),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Register a subscriber for captured flows. Delivery is lossy on
    /// overflow with a per-subscriber drop counter surfaced through
    /// `RecvError::Lagged`.
    pub fn on_flow_captured(&self) -> broadcast::Receiver<Flow> {
        self.events.subscribe()
    }

    /// Bind and start accepting. Requires the listener to currently be
    /// stopped. Returns once the socket is bound — the accept loop itself
    /// runs on a spawned task, so `start` never blocks its caller.
    pub async fn start(self: &Arc<Self>, options: ProxyOptions) -> std::io::Result<SocketAddr> {
        {
            let guard = self.running.lock().unwrap();
            if guard.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "listener already running",
                ));
            }
        }

        let addr: SocketAddr = format!("{}:{}", options.listen_address, options.listen_port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
        let tcp_listener = TcpListener::bind(addr).await?;
        let local_addr = tcp_listener.local_addr()?;
        info!(addr = %local_addr, "proxy listener bound");

        let cancel = CancellationToken::new();
        let handles = DriverHandles {
            ca: self.ca.clone(),
            flow_store: self.flow_store.clone(),
            pipeline: self.pipeline.clone(),
            options: Arc::new(options),
            events: self.events.clone(),
        };

        let accept_cancel = cancel.clone();
        let accept_task = tokio::spawn(accept_loop(tcp_listener, handles, accept_cancel));

        *self.running.lock().unwrap() = Some(Running {
            accept_task,
            cancel,
            local_addr,
        });
        self.is_running.store(true, Ordering::SeqCst);
        Ok(local_addr)
    }

    /// Cancel the accept loop, give outstanding driver tasks a grace
    /// period, then return. Requires the listener to currently be running.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap().take();
        let Some(running) = running else {
            warn!("stop() called while listener was not running");
            return;
        };
        self.is_running.store(false, Ordering::SeqCst);

        running.cancel.cancel();
        if tokio::time::timeout(STOP_GRACE_PERIOD, running.accept_task)
            .await
            .is_err()
        {
            warn!(addr = %running.local_addr, "accept loop did not exit within grace period");
        }
    }
}

/// Accept connections until cancelled, spawning a supervised driver task
/// for each. Accept errors are logged; the loop continues.
async fn accept_loop(listener: TcpListener, handles: DriverHandles, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = listener.accept() => result,
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };

        let driver_handles = handles.clone();
        let driver_cancel = cancel.clone();
        let flow_store = handles.flow_store.clone();
        let events = handles.events.clone();

        metrics::counter!("snitcher_connections_total").increment(1);
        metrics::gauge!("snitcher_connections_active").increment(1.0);

        tokio::spawn(async move {
            let driver = ConnectionDriver::new(driver_handles, peer_addr, driver_cancel);
            // A panic inside the task must never take the listener down
            // with it — caught here and folded into a Failed flow instead
            // of silently losing the connection.
            let result = std::panic::AssertUnwindSafe(driver.run(stream))
                .catch_unwind()
                .await;
            metrics::gauge!("snitcher_connections_active").decrement(1.0);
            if result.is_err() {
                error!(peer = %peer_addr, "connection driver panicked");
                let request = crate::codec::Request {
                    method: http::Method::GET,
                    target: String::new(),
                    version: http::Version::HTTP_11,
                    headers: Default::default(),
                    body: Default::default(),
                };
                let mut flow = crate::flow::Flow::pending(peer_addr.to_string(), request);
                flow.fail("internal: driver task panicked");
                flow_store.put(flow.clone());
                let _ = events.send(flow);
            }
        });
    }
}

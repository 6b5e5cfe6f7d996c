//! Core of an intercepting HTTP/HTTPS proxy: a local TCP endpoint clients
//! configure as an HTTP proxy, through which traffic is forwarded to origin
//! servers while each request/response pair is captured, optionally
//! transformed, and streamed to subscribers.
//!
//! The crate exposes the hard engineering surface only — connection
//! acceptance and the per-connection driver, the HTTP/1.1 wire codec, the
//! HTTPS MITM path, the interceptor pipeline, and the flow store. Anything
//! resembling a desktop UI, an entity-relational domain, or CLI/DI
//! bootstrapping beyond what `server` wires up here is out of scope.

pub mod ca;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod flow;
pub mod interceptor;
pub mod listener;
pub mod metrics;
pub mod server;
pub mod tls;

pub use ca::CertificateAuthority;
pub use config::ProxyOptions;
pub use error::ProxyError;
pub use flow::{Flow, FlowStatus, FlowStore};
pub use interceptor::Pipeline;
pub use listener::ProxyListener;

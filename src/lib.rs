// src/lib.rs
//
// vigil-web: the embedded HTTP/1.1 request/response engine of the Vigil
// telemetry agent. Incremental parsing over non-blocking sockets, URL
// dispatch, safe static file service, streaming gzip+chunked bodies, and a
// per-connection slot lifecycle with keep-alive reuse.

pub mod buffer;
pub mod client;
pub mod compress;
pub mod config;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod parser;
pub mod response;
pub mod router;
pub mod server;
pub mod slab;
pub mod staticfile;
pub mod syscalls;
pub mod transport;
pub mod url;
pub mod weblog;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for users
pub use buffer::WebBuffer;
pub use client::{Mode, SlotState, WebClient};
pub use config::Config;
pub use error::{WebError, WebResult};
pub use hooks::{AccessPolicy, ApiDispatcher, Capability, Hooks, HostRegistry, StreamIngest};
pub use server::Server;
pub use transport::{PlainTransport, Transport, TransportFamily, TransportStatus};
pub use weblog::init_logging;

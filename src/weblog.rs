// src/weblog.rs
use std::time::Instant;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::client::WebClient;

/// Initialize the tracing subscriber. Call once at startup, before the
/// workers; the level comes from `RUST_LOG` and defaults to `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// One line per completed request.
pub fn access_log(w: &WebClient) {
    let now = Instant::now();
    let total_ms = now.duration_since(w.tv_in).as_secs_f64() * 1000.0;
    let (prep_ms, sent_ms) = match w.tv_ready {
        Some(ready) => (
            ready.duration_since(w.tv_in).as_secs_f64() * 1000.0,
            now.duration_since(ready).as_secs_f64() * 1000.0,
        ),
        None => (total_ms, 0.0),
    };

    let size = if w.response.rlen > 0 {
        w.response.rlen
    } else {
        w.response.data.len() as u64
    };
    let ratio = if w.bytes_sent > 0 && size > 0 {
        size as f64 / w.bytes_sent as f64
    } else {
        1.0
    };

    // Control bytes in the URL become spaces so one request is one line.
    let url: String = w
        .url_as_received
        .chars()
        .map(|c| if (c as u32) < 0x20 { ' ' } else { c })
        .collect();

    tracing::info!(
        target: "access",
        id = w.id,
        thread = ?std::thread::current().id(),
        peer_ip = %w.peer.ip(),
        peer_port = w.peer.port(),
        mode = w.mode.label(),
        code = w.response.code,
        bytes_received = w.bytes_received,
        bytes_sent = w.bytes_sent,
        size,
        ratio,
        prep_ms,
        sent_ms,
        total_ms,
        url = %url,
    );
}

// src/error.rs
use std::io;

/// Errors from the engine's fallible setup paths (sockets, epoll, config).
///
/// Per-request protocol failures never surface here; they become HTTP
/// responses on the slot that produced them.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection slab is full")]
    SlabFull,

    #[error("worker error: {0}")]
    Worker(String),
}

pub type WebResult<T> = Result<T, WebError>;

// src/transport.rs
use std::io;

use libc::c_int;

use crate::syscalls::{self, IoStatus};

/// What the listener was bound on. TLS upgrades are never issued for
/// unix-domain peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFamily {
    Tcp,
    Unix,
}

/// Outcome of one transport operation.
///
/// Encrypted transports may need the opposite readiness direction to make
/// progress (a TLS read can require the socket to become writable); the slot
/// records that in its wait flags so the event loop arms the right side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Done(usize),
    WantRead,
    WantWrite,
    Closed,
}

/// Unified byte-stream access for the slot. Implemented by the plain socket
/// here and by TLS wrappers elsewhere; the engine never looks inside.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<TransportStatus>;
    fn write(&mut self, buf: &[u8]) -> io::Result<TransportStatus>;

    fn is_encrypted(&self) -> bool {
        false
    }

    fn family(&self) -> TransportFamily {
        TransportFamily::Tcp
    }

    /// Raw descriptor for event-loop registration. -1 when there is none
    /// (mock transports).
    fn raw_fd(&self) -> c_int {
        -1
    }

    /// Kernel cork hint; only plain TCP sockets can honour it.
    fn supports_cork(&self) -> bool {
        false
    }

    fn set_cork(&mut self, _on: bool) -> io::Result<()> {
        Ok(())
    }
}

/// Plain non-blocking socket.
pub struct PlainTransport {
    fd: c_int,
    family: TransportFamily,
}

impl PlainTransport {
    pub fn new(fd: c_int) -> Self {
        Self {
            fd,
            family: TransportFamily::Tcp,
        }
    }

    pub fn new_unix(fd: c_int) -> Self {
        Self {
            fd,
            family: TransportFamily::Unix,
        }
    }
}

impl Transport for PlainTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<TransportStatus> {
        match syscalls::read_fd(self.fd, buf)? {
            IoStatus::Ready(n) => Ok(TransportStatus::Done(n)),
            IoStatus::WouldBlock => Ok(TransportStatus::WantRead),
            IoStatus::Eof => Ok(TransportStatus::Closed),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<TransportStatus> {
        match syscalls::write_fd(self.fd, buf)? {
            IoStatus::Ready(n) => Ok(TransportStatus::Done(n)),
            IoStatus::WouldBlock => Ok(TransportStatus::WantWrite),
            IoStatus::Eof => Ok(TransportStatus::Closed),
        }
    }

    fn family(&self) -> TransportFamily {
        self.family
    }

    fn raw_fd(&self) -> c_int {
        self.fd
    }

    fn supports_cork(&self) -> bool {
        self.family == TransportFamily::Tcp
    }

    fn set_cork(&mut self, on: bool) -> io::Result<()> {
        syscalls::set_cork(self.fd, on)
    }
}

impl Drop for PlainTransport {
    fn drop(&mut self) {
        syscalls::close_fd(self.fd);
    }
}

// src/client.rs
//
// The per-connection slot: buffers, parser state, response state and the
// lifecycle state machine that drives one request at a time over a
// non-blocking transport. A slot is reused across sequential requests on a
// keep-alive socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use libc::c_int;

use crate::buffer::WebBuffer;
use crate::compress::Compressor;
use crate::config::Config;
use crate::hooks::{Capability, Hooks};
use crate::parser::{self, ValidationResult};
use crate::response::{self, HTTP_RESP_HTTPS_UPGRADE};
use crate::syscalls::{self, IoStatus};
use crate::transport::{Transport, TransportStatus};
use crate::url::PathFlags;
use crate::{router, weblog};

pub const INVALID_FD: c_int = -1;

/// Bytes pulled from the socket per read event.
const RECEIVE_CHUNK: usize = 4096;
/// Bytes pulled from a static file per producer step.
const FILE_CHUNK: usize = 16384;
/// EAGAIN spins allowed for the initial header write.
const HEADER_SEND_RETRIES: u32 = 100;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Get,
    Post,
    Put,
    Delete,
    Options,
    /// Internal metrics ingestion; the socket is handed to the collaborator.
    Stream,
    /// A static file is being copied to the socket.
    FileCopy,
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::FileCopy => "FILECOPY",
            Mode::Options => "OPTIONS",
            Mode::Stream => "STREAM",
            _ => "DATA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    ReceivingHeaders,
    SendingHeader,
    SendingBody,
    Dead,
}

/// Readiness and framing flags. The TLS variants record that the encrypted
/// transport needs the opposite direction to make progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferFlags {
    pub wait_read: bool,
    pub wait_send: bool,
    pub ssl_wait_read: bool,
    pub ssl_wait_send: bool,
    pub keepalive: bool,
    pub chunked: bool,
    pub corkable: bool,
    pub corked: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyFlags {
    /// Client sent `DNT: 1` and the agent honours it.
    pub donottrack: bool,
    /// Client sent `DNT: 0`, explicitly permitting tracking.
    pub tracking_required: bool,
}

#[derive(Debug, Default)]
pub struct ParseState {
    pub tries: u32,
    /// Progress watermark: receive-buffer size at the previous parse.
    pub last_size: usize,
}

/// Recognized request headers, owned copies.
#[derive(Debug, Default)]
pub struct RequestHeaders {
    pub origin: Option<String>,
    pub user_agent: Option<String>,
    pub auth_token: Option<String>,
    pub host: Option<String>,
    pub forwarded_host: Option<String>,
}

#[derive(Debug, Default)]
pub struct ResponseState {
    pub code: u16,
    /// Custom headers accumulated during routing, one `Name: value\r\n` each.
    pub header: WebBuffer,
    /// The final serialized header block.
    pub header_output: WebBuffer,
    /// Response body. Before validation this is also the receive buffer.
    pub data: WebBuffer,
    /// Total response length. For FILECOPY this is the file size and the
    /// body buffer fills toward it; otherwise it equals the body length.
    pub rlen: u64,
    /// Source-body bytes handed to the socket or the compressor.
    pub sent: u64,
    /// Cleared by exotic handlers whose body length cannot be declared;
    /// forces keep-alive off when the response is not chunked.
    pub length_known: bool,
    pub compressor: Option<Compressor>,
    /// Compressed output enabled for this request.
    pub zoutput: bool,
    pub has_cookies: bool,
}

pub struct WebClient {
    pub id: u64,
    /// Requests served on this slot so far.
    pub use_count: u32,
    pub peer: SocketAddr,
    pub transport: Box<dyn Transport>,
    /// Input descriptor: the socket, or the file during FILECOPY.
    pub ifd: c_int,
    /// Output descriptor: always the socket (-1 for mock transports).
    pub ofd: c_int,
    pub mode: Mode,
    pub state: SlotState,
    pub url_as_received: String,
    /// Decoded URL path.
    pub path: String,
    /// Decoded query string, leading `?` preserved.
    pub query: String,
    /// Set when a `/host/...` switch resolved; switching is one level deep.
    pub switched_host: Option<String>,
    pub headers: RequestHeaders,
    pub parse: ParseState,
    pub path_flags: PathFlags,
    pub transfer: TransferFlags,
    pub policy: PolicyFlags,
    pub response: ResponseState,
    pub tv_in: Instant,
    pub tv_ready: Option<Instant>,
    pub tv_checkpoint: Instant,
    pub timeout_us: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Requests fully answered on this slot (keep-alive reuse included).
    pub requests_completed: u32,
    lifetime_received: u64,
    lifetime_sent: u64,
    mem_accounting: Arc<AtomicI64>,
    mem_last: i64,
}

impl WebClient {
    pub fn new(
        transport: Box<dyn Transport>,
        peer: SocketAddr,
        cfg: &Config,
        mem_accounting: Arc<AtomicI64>,
    ) -> Self {
        let fd = transport.raw_fd();
        let corkable = transport.supports_cork();
        let now = Instant::now();
        let mut w = Self {
            id: next_client_id(),
            use_count: 0,
            peer,
            transport,
            ifd: fd,
            ofd: fd,
            mode: Mode::Get,
            state: SlotState::ReceivingHeaders,
            url_as_received: String::new(),
            path: String::new(),
            query: String::new(),
            switched_host: None,
            headers: RequestHeaders::default(),
            parse: ParseState::default(),
            path_flags: PathFlags::default(),
            transfer: TransferFlags {
                wait_read: true,
                corkable,
                ..TransferFlags::default()
            },
            policy: PolicyFlags::default(),
            response: ResponseState {
                length_known: true,
                ..ResponseState::default()
            },
            tv_in: now,
            tv_ready: None,
            tv_checkpoint: now,
            timeout_us: cfg.timeout_us,
            bytes_received: 0,
            bytes_sent: 0,
            requests_completed: 0,
            lifetime_received: 0,
            lifetime_sent: 0,
            mem_accounting,
            mem_last: 0,
        };
        w.update_memory_accounting();
        w
    }

    pub fn is_dead(&self) -> bool {
        self.state == SlotState::Dead
    }

    /// The bearer token from X-Auth-Token, prefix stripped.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .auth_token
            .as_deref()
            .map(|t| t.strip_prefix("Bearer ").unwrap_or(t).trim())
    }

    /// True when the FILECOPY producer still owns a separate input fd.
    pub fn wants_file_read(&self) -> bool {
        self.mode == Mode::FileCopy
            && self.ifd != self.ofd
            && self.ifd != INVALID_FD
            && self.transfer.wait_read
            && self.state != SlotState::Dead
    }

    /// epoll interest for the socket, derived from the wait flags.
    pub fn socket_interest(&self) -> i32 {
        let mut ev = 0;
        let read = (self.transfer.wait_read && self.ifd == self.ofd) || self.transfer.ssl_wait_read;
        let send = self.transfer.wait_send || self.transfer.ssl_wait_send;
        if read {
            ev |= libc::EPOLLIN;
        }
        if send {
            ev |= libc::EPOLLOUT;
        }
        ev
    }

    fn note_want(&mut self, status: TransportStatus) {
        let encrypted = self.transport.is_encrypted();
        match status {
            TransportStatus::WantRead => {
                if encrypted {
                    self.transfer.ssl_wait_read = true;
                } else {
                    self.transfer.wait_read = true;
                }
            }
            TransportStatus::WantWrite => {
                if encrypted {
                    self.transfer.ssl_wait_send = true;
                } else {
                    self.transfer.wait_send = true;
                }
            }
            _ => {}
        }
    }

    // ---- Receive path ----

    pub fn on_readable(&mut self, cfg: &Config, hooks: &Hooks) {
        if self.state == SlotState::Dead {
            return;
        }

        if self.wants_file_read() {
            self.file_read();
            return;
        }

        if self.state != SlotState::ReceivingHeaders {
            return;
        }

        self.transfer.ssl_wait_read = false;
        let mut chunk = [0u8; RECEIVE_CHUNK];
        match self.transport.read(&mut chunk) {
            Ok(TransportStatus::Done(n)) => {
                self.bytes_received += n as u64;
                self.response.data.push_bytes(&chunk[..n]);
                self.process_request(cfg, hooks);
            }
            Ok(TransportStatus::Closed) => {
                self.state = SlotState::Dead;
            }
            Ok(status) => {
                self.note_want(status);
                // A wakeup that moved nothing still counts as a parse
                // attempt once a partial request is sitting in the buffer.
                if !self.response.data.is_empty() {
                    self.process_request(cfg, hooks);
                }
            }
            Err(e) => {
                tracing::debug!(id = self.id, error = %e, "receive failed");
                self.state = SlotState::Dead;
            }
        }
    }

    fn process_request(&mut self, cfg: &Config, hooks: &Hooks) {
        match parser::validate(self, cfg) {
            ValidationResult::Ok => self.route_request(cfg, hooks),
            ValidationResult::Incomplete => {
                self.transfer.wait_read = true;
            }
            ValidationResult::Redirect => {
                self.response.data.reset();
                self.transfer.keepalive = false;
                // The upgrade header block carries no framing fields, so the
                // empty body must go out uncompressed.
                self.response.zoutput = false;
                self.response.compressor = None;
                self.response.code = HTTP_RESP_HTTPS_UPGRADE;
                self.start_response(cfg);
            }
            ValidationResult::NotSupported => {
                self.error_response(cfg, 400, "Received request is not supported.");
            }
            ValidationResult::MalformedUrl => {
                self.error_response(cfg, 400, "Malformed URL request.");
            }
            ValidationResult::ExcessRequestData => {
                self.error_response(cfg, 400, "Excess data in the request.");
            }
            ValidationResult::TooManyReadRetries => {
                tracing::debug!(id = self.id, "too many parse retries without progress");
                self.state = SlotState::Dead;
            }
        }
    }

    fn route_request(&mut self, cfg: &Config, hooks: &Hooks) {
        // The receive buffer becomes the response body from here on.
        self.response.data.reset();
        self.response.header.reset();

        let code = match self.mode {
            Mode::Options => {
                self.response.data.push_str("OK");
                200
            }
            Mode::Stream => {
                if !hooks.access.allows(Capability::Stream) {
                    self.response.data.push_str(router::DENIED_BODY);
                    403
                } else {
                    hooks.ingest.begin(self)
                }
            }
            _ => router::dispatch_url(self, cfg, hooks),
        };

        self.response.code = code;
        self.start_response(cfg);
    }

    pub fn error_response(&mut self, cfg: &Config, code: u16, body: &str) {
        self.response.data.reset();
        self.response.data.push_str(body);
        self.response.code = code;
        self.start_response(cfg);
    }

    // ---- Respond path ----

    fn start_response(&mut self, cfg: &Config) {
        self.tv_ready = Some(Instant::now());

        if self.mode != Mode::FileCopy {
            self.response.rlen = self.response.data.len() as u64;
        }
        self.response.sent = 0;

        response::build_header(self, cfg);

        if self.transfer.corkable && !self.transfer.corked {
            if let Err(e) = self.transport.set_cork(true) {
                tracing::debug!(id = self.id, error = %e, "cork failed");
            } else {
                self.transfer.corked = true;
            }
        }

        self.state = SlotState::SendingHeader;
        self.send_header();
        if self.state == SlotState::SendingBody {
            self.advance_send(cfg);
        }
    }

    /// First write of the serialized header block, with a bounded number of
    /// EAGAIN spins before surrender.
    fn send_header(&mut self) {
        let len = self.response.header_output.len();
        let mut written = 0usize;
        let mut retries = 0u32;

        while written < len {
            let status = {
                let bytes = &self.response.header_output.as_bytes()[written..];
                self.transport.write(bytes)
            };
            match status {
                Ok(TransportStatus::Done(n)) => {
                    written += n;
                    self.bytes_sent += n as u64;
                }
                Ok(TransportStatus::Closed) => {
                    self.state = SlotState::Dead;
                    return;
                }
                Ok(_) => {
                    retries += 1;
                    if retries > HEADER_SEND_RETRIES {
                        tracing::debug!(id = self.id, "header write starved, giving up");
                        self.state = SlotState::Dead;
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(id = self.id, error = %e, "header write failed");
                    self.state = SlotState::Dead;
                    return;
                }
            }
        }

        self.state = SlotState::SendingBody;
        self.transfer.wait_read = self.mode == Mode::FileCopy;
        self.transfer.wait_send = true;
    }

    pub fn on_writable(&mut self, cfg: &Config) {
        if self.state != SlotState::SendingBody {
            return;
        }
        self.transfer.ssl_wait_send = false;
        self.advance_send(cfg);
    }

    /// One step of the send path; dispatches on the compressed flag.
    pub fn advance_send(&mut self, cfg: &Config) {
        if self.state != SlotState::SendingBody {
            return;
        }
        if self.response.zoutput {
            self.compressed_send(cfg);
        } else {
            self.plain_send(cfg);
        }
    }

    fn plain_send(&mut self, cfg: &Config) {
        let total = if self.response.length_known {
            self.response.rlen
        } else {
            self.response.data.len() as u64
        };

        let start = self.response.sent as usize;
        if start < self.response.data.len() {
            let status = {
                let bytes = &self.response.data.as_bytes()[start..];
                self.transport.write(bytes)
            };
            match status {
                Ok(TransportStatus::Done(n)) => {
                    self.response.sent += n as u64;
                    self.bytes_sent += n as u64;
                }
                Ok(TransportStatus::Closed) => {
                    self.state = SlotState::Dead;
                    return;
                }
                Ok(status) => {
                    self.note_want(status);
                    return;
                }
                Err(e) => {
                    tracing::debug!(id = self.id, error = %e, "body write failed");
                    self.state = SlotState::Dead;
                    return;
                }
            }
        }

        if self.response.sent >= total {
            self.request_done(cfg);
        } else if self.response.sent as usize == self.response.data.len() {
            // Drained what the producer delivered so far.
            self.transfer.wait_send = false;
        } else {
            self.transfer.wait_send = true;
        }
    }

    fn compressed_send(&mut self, cfg: &Config) {
        let mut comp = match self.response.compressor.take() {
            Some(c) => c,
            None => {
                self.state = SlotState::Dead;
                return;
            }
        };

        // Refill the staging buffer when the previous chunk is out.
        if comp.pending().is_empty() && !comp.is_done() {
            let producer_done =
                self.mode != Mode::FileCopy || self.response.data.len() as u64 >= self.response.rlen;
            let start = self.response.sent as usize;
            let has_new = start < self.response.data.len();

            if has_new || producer_done {
                let fed = {
                    let input = &self.response.data.as_bytes()[start..];
                    comp.feed(input, producer_done)
                };
                if let Err(e) = fed {
                    tracing::debug!(id = self.id, error = %e, "compressor failed");
                    self.state = SlotState::Dead;
                    return;
                }
                self.response.sent = self.response.data.len() as u64;
            } else {
                // Nothing new from the file yet; wait for the producer.
                self.response.compressor = Some(comp);
                self.transfer.wait_send = false;
                return;
            }
        }

        if !comp.pending().is_empty() {
            let status = self.transport.write(comp.pending());
            match status {
                Ok(TransportStatus::Done(n)) => {
                    comp.advance(n);
                    self.bytes_sent += n as u64;
                }
                Ok(TransportStatus::Closed) => {
                    self.state = SlotState::Dead;
                    return;
                }
                Ok(status) => {
                    self.note_want(status);
                    self.response.compressor = Some(comp);
                    return;
                }
                Err(e) => {
                    tracing::debug!(id = self.id, error = %e, "compressed write failed");
                    self.state = SlotState::Dead;
                    return;
                }
            }
        }

        if comp.is_done() {
            self.response.compressor = Some(comp);
            self.request_done(cfg);
        } else {
            self.transfer.wait_send = !comp.pending().is_empty()
                || self.mode != Mode::FileCopy
                || (self.response.sent as usize) < self.response.data.len();
            self.response.compressor = Some(comp);
        }
    }

    // ---- File producer ----

    /// Read one slice of the static file into the body buffer. Runs only on
    /// the file descriptor, never on the write-ready path.
    pub fn file_read(&mut self) {
        let buffered = self.response.data.len() as u64;
        if buffered >= self.response.rlen {
            self.file_producer_done();
            return;
        }

        let want = ((self.response.rlen - buffered) as usize).min(FILE_CHUNK);
        let mut chunk = [0u8; FILE_CHUNK];
        match syscalls::read_fd(self.ifd, &mut chunk[..want]) {
            Ok(IoStatus::Ready(n)) => {
                self.response.data.push_bytes(&chunk[..n]);
                self.transfer.wait_send = true;
                if self.response.data.len() as u64 >= self.response.rlen {
                    self.file_producer_done();
                }
            }
            Ok(IoStatus::WouldBlock) => {}
            Ok(IoStatus::Eof) => {
                // File shrank under us; send what we have.
                self.response.rlen = self.response.data.len() as u64;
                self.transfer.wait_send = true;
                self.file_producer_done();
            }
            Err(e) => {
                tracing::debug!(id = self.id, error = %e, "file read failed");
                self.state = SlotState::Dead;
            }
        }
    }

    fn file_producer_done(&mut self) {
        if self.ifd != self.ofd {
            syscalls::close_fd(self.ifd);
            self.ifd = self.ofd;
        }
        self.transfer.wait_read = false;
    }

    // ---- Completion, reuse, teardown ----

    /// Connection-lifetime byte totals, the current request included.
    pub fn total_received(&self) -> u64 {
        self.lifetime_received + self.bytes_received
    }

    pub fn total_sent(&self) -> u64 {
        self.lifetime_sent + self.bytes_sent
    }

    fn request_done(&mut self, cfg: &Config) {
        self.requests_completed += 1;
        weblog::access_log(self);

        if self.transfer.corked {
            if let Err(e) = self.transport.set_cork(false) {
                tracing::debug!(id = self.id, error = %e, "uncork failed");
            }
            self.transfer.corked = false;
        }

        if self.transfer.keepalive
            && self.state != SlotState::Dead
            && self.use_count + 1 < cfg.keepalive_max_requests
        {
            self.reuse();
        } else {
            self.state = SlotState::Dead;
        }
    }

    /// Prepare the slot for the next request on the same socket: the six
    /// named buffers are truncated with capacity retained, everything else
    /// is cleared.
    pub fn reuse(&mut self) {
        if self.ifd != self.ofd {
            syscalls::close_fd(self.ifd);
        }
        self.ifd = self.ofd;

        self.response.data.reset();
        self.response.header.reset();
        self.response.header_output.reset();
        self.url_as_received.clear();
        self.path.clear();
        self.query.clear();

        self.headers = RequestHeaders::default();
        self.parse = ParseState::default();
        self.path_flags = PathFlags::default();
        self.policy = PolicyFlags::default();
        self.switched_host = None;

        let corkable = self.transfer.corkable;
        self.transfer = TransferFlags {
            wait_read: true,
            corkable,
            ..TransferFlags::default()
        };

        self.response.code = 0;
        self.response.rlen = 0;
        self.response.sent = 0;
        self.response.length_known = true;
        self.response.compressor = None;
        self.response.zoutput = false;
        self.response.has_cookies = false;

        self.mode = Mode::Get;
        self.state = SlotState::ReceivingHeaders;

        self.use_count += 1;
        let now = Instant::now();
        self.tv_in = now;
        self.tv_ready = None;
        self.tv_checkpoint = now;
        self.lifetime_received += self.bytes_received;
        self.lifetime_sent += self.bytes_sent;
        self.bytes_received = 0;
        self.bytes_sent = 0;

        self.update_memory_accounting();
    }

    /// Soft cancellation: past the deadline the slot short-circuits with a
    /// 504, or dies if the header is already on the wire.
    pub fn check_timeout(&mut self, cfg: &Config, now: Instant) {
        if self.state == SlotState::Dead {
            return;
        }
        self.tv_checkpoint = now;

        let elapsed = now.duration_since(self.tv_in).as_micros() as u64;
        if elapsed <= self.timeout_us {
            return;
        }

        match self.state {
            SlotState::ReceivingHeaders => {
                tracing::debug!(id = self.id, elapsed_us = elapsed, "request timed out");
                self.error_response(cfg, 504, "Query timeout exceeded");
            }
            _ => {
                self.state = SlotState::Dead;
            }
        }
    }

    fn buffers_capacity(&self) -> i64 {
        let mut total = self.response.data.capacity()
            + self.response.header.capacity()
            + self.response.header_output.capacity()
            + self.url_as_received.capacity()
            + self.path.capacity()
            + self.query.capacity();
        if let Some(c) = &self.response.compressor {
            total += c.zhave();
        }
        total as i64
    }

    fn update_memory_accounting(&mut self) {
        let total = self.buffers_capacity();
        self.mem_accounting.fetch_add(total - self.mem_last, Ordering::Relaxed);
        self.mem_last = total;
    }
}

impl Drop for WebClient {
    fn drop(&mut self) {
        if self.ifd != self.ofd {
            syscalls::close_fd(self.ifd);
        }
        self.mem_accounting.fetch_sub(self.mem_last, Ordering::Relaxed);
    }
}

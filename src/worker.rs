// src/worker.rs
//
// One event loop per worker. Each worker owns its SO_REUSEPORT listener,
// its epoll instance and its slab of client slots; slots never migrate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use libc::c_int;

use crate::client::{SlotState, WebClient};
use crate::config::Config;
use crate::error::WebResult;
use crate::hooks::Hooks;
use crate::metrics::{self, WorkerMetrics};
use crate::slab::ClientSlab;
use crate::syscalls::{self, EPOLLIN, Epoll, epoll_event};
use crate::transport::PlainTransport;

/// Concurrent connections one worker will hold.
const SLAB_CAPACITY: usize = 16_384;
/// epoll_wait timeout; also the cadence of the timeout/producer sweep.
const TICK_MS: i32 = 200;

const LISTEN_TOKEN: u64 = u64::MAX;

pub struct Worker {
    id: usize,
    listen_fd: c_int,
    config: Arc<Config>,
    hooks: Hooks,
    metrics: Arc<WorkerMetrics>,
    /// Requests already counted per slot, so keep-alive reuse ticks the
    /// request counter exactly once per completed request.
    counted: Vec<u32>,
}

impl Worker {
    pub fn new(
        id: usize,
        listen_fd: c_int,
        config: Arc<Config>,
        hooks: Hooks,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            id,
            listen_fd,
            config,
            hooks,
            metrics,
            counted: vec![0; SLAB_CAPACITY],
        }
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> WebResult<()> {
        let epoll = Epoll::new()?;
        epoll.add(self.listen_fd, LISTEN_TOKEN, EPOLLIN)?;

        let mut slab = ClientSlab::new(SLAB_CAPACITY);
        let mut events = vec![epoll_event { events: 0, u64: 0 }; 1024];

        tracing::debug!(worker = self.id, "entering event loop");

        while !shutdown.load(Ordering::Acquire) {
            let n = epoll.wait(&mut events, TICK_MS)?;

            for event in &events[..n] {
                let token = event.u64;
                if token == LISTEN_TOKEN {
                    if !shutdown.load(Ordering::Acquire) {
                        self.accept_pending(&epoll, &mut slab);
                    }
                    continue;
                }

                let idx = token as usize;
                let readable = event.events & libc::EPOLLIN as u32 != 0;
                let writable = event.events & libc::EPOLLOUT as u32 != 0;
                let hangup = event.events & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;

                if let Some(w) = slab.get_mut(idx) {
                    if hangup && !readable {
                        w.state = SlotState::Dead;
                    }
                    if readable {
                        w.on_readable(&self.config, &self.hooks);
                    }
                    if writable {
                        w.on_writable(&self.config);
                    }
                }
                self.rearm_or_harvest(&epoll, &mut slab, idx);
            }

            self.sweep(&epoll, &mut slab);
        }

        tracing::debug!(worker = self.id, "event loop exiting");

        // Drop the slab so every remaining connection closes cleanly.
        drop(slab);
        Ok(())
    }

    fn accept_pending(&mut self, epoll: &Epoll, slab: &mut ClientSlab) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    let transport = Box::new(PlainTransport::new(fd));
                    let client =
                        WebClient::new(transport, peer, &self.config, metrics::client_memory());
                    let interest = client.socket_interest();
                    let id = client.id;

                    // On failure the client is dropped, which closes fd.
                    match slab.allocate(client) {
                        Some(idx) => {
                            if epoll.add(fd, idx as u64, interest).is_err() {
                                slab.free(idx);
                            } else {
                                self.counted[idx] = 0;
                                self.metrics.inc_conn();
                                tracing::debug!(worker = self.id, client = id, peer = %peer, "accepted");
                            }
                        }
                        None => {
                            tracing::warn!(worker = self.id, "slab full, dropping connection");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(worker = self.id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Re-register the socket with the interest derived from the slot's
    /// wait flags, or harvest the slot if the request ended its life.
    fn rearm_or_harvest(&mut self, epoll: &Epoll, slab: &mut ClientSlab, idx: usize) {
        let (dead, fd, interest, completed) = match slab.get(idx) {
            Some(w) => (w.is_dead(), w.ofd, w.socket_interest(), w.requests_completed),
            None => return,
        };

        let newly_done = completed.saturating_sub(self.counted[idx]);
        for _ in 0..newly_done {
            self.metrics.inc_req();
        }
        self.counted[idx] = completed;

        if dead {
            epoll.delete(fd).ok();
            if let Some(w) = slab.free(idx) {
                self.metrics
                    .add_bytes(w.total_received(), w.total_sent());
            }
            self.metrics.dec_conn();
        } else {
            epoll.modify(fd, idx as u64, interest).ok();
        }
    }

    /// Runs once per tick: drive FILECOPY producers (regular files are not
    /// pollable, they are always ready) and enforce per-slot timeouts. The
    /// producer only fills the body buffer; draining stays on the
    /// write-ready path, which the re-armed EPOLLOUT triggers.
    fn sweep(&mut self, epoll: &Epoll, slab: &mut ClientSlab) {
        let now = Instant::now();
        for idx in 0..slab.capacity() {
            let mut touched = false;
            if let Some(w) = slab.get_mut(idx) {
                while w.wants_file_read() {
                    let before = w.response.data.len();
                    w.file_read();
                    touched = true;
                    if w.is_dead() || w.response.data.len() == before {
                        break;
                    }
                }

                let before_state = w.state;
                w.check_timeout(&self.config, now);
                touched |= w.state != before_state;
            }
            if touched {
                self.rearm_or_harvest(epoll, slab, idx);
            }
        }
    }
}

// src/server.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config::{Config, GzipStrategy};
use crate::error::{WebError, WebResult};
use crate::hooks::Hooks;
use crate::metrics::{self, WorkerMetrics};
use crate::syscalls;
use crate::worker::Worker;

static SHUTDOWN: Lazy<Arc<AtomicBool>> = Lazy::new(|| Arc::new(AtomicBool::new(false)));

/// Ask every worker to drain and exit. Also wired to ctrl-c.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
}

pub struct Server {
    config: Config,
    hooks: Hooks,
    workers: usize,
}

impl Server {
    pub fn new(config: Config, hooks: Hooks) -> Self {
        let workers = if config.workers == 0 {
            num_cpus::get()
        } else {
            config.workers
        };
        Self {
            config,
            hooks,
            workers,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Start the workers and block until shutdown. Each worker gets its
    /// own SO_REUSEPORT listener and is pinned to a core when possible.
    pub fn serve(self) -> WebResult<()> {
        self.config.validate()?;

        if self.config.gzip_strategy != GzipStrategy::Default {
            tracing::info!(
                strategy = ?self.config.gzip_strategy,
                "gzip strategy accepted but the default zlib strategy is used"
            );
        }

        let (host, port) = parse_host_port(&self.config.bind)?;

        let shutdown = SHUTDOWN.clone();
        let shutdown_signal = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received, draining connections");
            shutdown_signal.store(true, Ordering::Release);
        })
        .map_err(|e| WebError::Worker(format!("signal handler: {}", e)))?;

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let config = Arc::new(self.config);

        let mut worker_metrics = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            worker_metrics.push(Arc::new(WorkerMetrics::new()));
        }

        // Periodic totals, alongside the per-request access log.
        let metrics_clones = worker_metrics.clone();
        let shutdown_metrics = shutdown.clone();
        thread::Builder::new()
            .name("vigil-web-metrics".to_string())
            .spawn(move || {
                while !shutdown_metrics.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_secs(5));
                    if shutdown_metrics.load(Ordering::Acquire) {
                        break;
                    }
                    let mut reqs = 0;
                    let mut active = 0;
                    for m in &metrics_clones {
                        reqs += m.req_count.load(Ordering::Relaxed);
                        active += m.active_conns.load(Ordering::Relaxed);
                    }
                    tracing::info!(
                        active_connections = active,
                        total_requests = reqs,
                        client_memory = metrics::client_memory_bytes(),
                        "engine totals"
                    );
                }
            })
            .ok();

        tracing::info!(
            bind = %config.bind,
            workers = self.workers,
            "starting workers with SO_REUSEPORT"
        );

        let mut handles: Vec<thread::JoinHandle<()>> = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let config = config.clone();
            let hooks = self.hooks.clone();
            let shutdown = shutdown.clone();
            let metrics = worker_metrics[i].clone();
            let host = host.clone();

            let handle = thread::Builder::new()
                .name(format!("vigil-web-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }

                    match syscalls::create_listen_socket_reuseport(&host, port) {
                        Ok(listen_fd) => {
                            let mut worker = Worker::new(i, listen_fd, config, hooks, metrics);
                            if let Err(e) = worker.run(shutdown) {
                                tracing::error!(worker = i, error = %e, "worker exited");
                            }
                            syscalls::close_fd(listen_fd);
                        }
                        Err(e) => {
                            tracing::error!(worker = i, error = %e, "failed to bind");
                        }
                    }
                })
                .map_err(|e| WebError::Worker(format!("spawn: {}", e)))?;

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        Ok(())
    }
}

fn parse_host_port(bind: &str) -> WebResult<(String, u16)> {
    let (host, port) = bind
        .rsplit_once(':')
        .ok_or_else(|| WebError::Config(format!("missing port in bind address '{}'", bind)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| WebError::Config(format!("invalid port in bind address '{}'", bind)))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_parsing() {
        assert_eq!(
            parse_host_port("127.0.0.1:19999").unwrap(),
            ("127.0.0.1".to_string(), 19999)
        );
        assert_eq!(
            parse_host_port(":8080").unwrap(),
            ("0.0.0.0".to_string(), 8080)
        );
        assert!(parse_host_port("nohost").is_err());
        assert!(parse_host_port("h:notaport").is_err());
    }
}

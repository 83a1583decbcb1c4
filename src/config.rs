// src/config.rs
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{WebError, WebResult};

/// Compression strategy knob. The safe flate2 API pins the zlib default;
/// non-default values are accepted for config compatibility and logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GzipStrategy {
    Default,
    Filtered,
    Huffman,
    Rle,
    Fixed,
}

/// Engine configuration. Immutable once the workers start; shared by
/// reference across all slots.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listener address for the bundled runner, `host:port`.
    pub bind: String,
    /// Worker event loops. 0 means one per core.
    pub workers: usize,
    /// Root directory for static dashboard files.
    pub web_root: PathBuf,
    pub enable_gzip: bool,
    /// zlib level, 1 (fastest) to 9 (best).
    pub gzip_level: u32,
    pub gzip_strategy: GzipStrategy,
    /// Honour the DNT request header and emit Tk.
    pub respect_do_not_track: bool,
    /// Emitted verbatim as `X-Frame-Options` when set.
    pub x_frame_options: Option<String>,
    /// Redirect plain-TCP requests to https (STREAM is refused instead).
    pub force_https: bool,
    /// Per-request timeout in microseconds.
    pub timeout_us: u64,
    /// Requests served on one keep-alive socket before it is closed.
    pub keepalive_max_requests: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:19999".to_string(),
            workers: 0,
            web_root: PathBuf::from("/usr/share/vigil/web"),
            enable_gzip: true,
            gzip_level: 3,
            gzip_strategy: GzipStrategy::Default,
            respect_do_not_track: false,
            x_frame_options: None,
            force_https: false,
            timeout_us: 60_000_000,
            keepalive_max_requests: 10_000,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> WebResult<Self> {
        let raw = std::fs::read(path)?;
        let cfg: Config = serde_json::from_slice(&raw)
            .map_err(|e| WebError::Config(format!("{}: {}", path.display(), e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> WebResult<()> {
        if !(1..=9).contains(&self.gzip_level) {
            return Err(WebError::Config(format!(
                "gzip_level must be 1-9, got {}",
                self.gzip_level
            )));
        }
        if self.timeout_us == 0 {
            return Err(WebError::Config("timeout_us must be non-zero".to_string()));
        }
        Ok(())
    }
}

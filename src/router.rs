// src/router.rs
//
// URL dispatch. The first path segment picks the handler; version prefixes
// and host switches recurse on the remainder.

use std::fmt::Write;

use crate::client::WebClient;
use crate::config::Config;
use crate::hooks::{Capability, Hooks};
use crate::staticfile;
use crate::url;

pub const DENIED_BODY: &str = "You are not allowed to access this page.";
pub const MISSING_BEARER_BODY: &str = "A Bearer token is required for this call.";

fn denied(w: &mut WebClient) -> u16 {
    w.response.data.reset();
    w.response.data.content_type = "text/plain; charset=utf-8";
    w.response.data.push_str(DENIED_BODY);
    403
}

/// Split one path segment off, dropping the leading slashes.
fn next_segment(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
        None => (trimmed, ""),
    }
}

/// Route the decoded URL on the slot. Returns the response status; the
/// body and any custom headers are on the slot.
pub fn dispatch_url(w: &mut WebClient, cfg: &Config, hooks: &Hooks) -> u16 {
    let path = w.path.clone();
    dispatch_path(w, cfg, hooks, &path)
}

fn dispatch_path(w: &mut WebClient, cfg: &Config, hooks: &Hooks, path: &str) -> u16 {
    let (first, rest) = next_segment(path);

    if let Some(v) = url::version_of(first) {
        if w.path_flags.has_version {
            w.response.data.reset();
            w.response.data.push_str("Multiple dashboard versions are not allowed.");
            return 400;
        }
        w.path_flags.has_version = true;
        match v {
            0 => w.path_flags.is_v0 = true,
            1 => w.path_flags.is_v1 = true,
            _ => w.path_flags.is_v2 = true,
        }
        return dispatch_path(w, cfg, hooks, rest);
    }

    match first {
        "api" => hooks.api.dispatch(w, rest),
        "host" | "node" => host_switch(w, cfg, hooks, first == "node", rest),
        "netdata.conf" => {
            if !hooks.access.allows(Capability::NetdataConf) {
                return denied(w);
            }
            config_dump(w, cfg)
        }
        #[cfg(feature = "internal-checks")]
        "exit" | "debug" | "mirror" => internal_check(w, hooks, first),
        _ => {
            if !hooks.access.allows(Capability::Dashboard) {
                return denied(w);
            }
            staticfile::serve_file(w, cfg, path)
        }
    }
}

/// `/host/{id|name|guid}/...`: re-route the remainder against another
/// host's data. Only one level deep; the current host must be the root.
fn host_switch(w: &mut WebClient, cfg: &Config, hooks: &Hooks, via_node: bool, path: &str) -> u16 {
    if !hooks.access.allows(Capability::Registry) {
        return denied(w);
    }

    if w.switched_host.is_some() {
        w.response.data.reset();
        w.response.data.push_str("Nesting of hosts is not allowed.");
        return 400;
    }

    let (name, rest) = next_segment(path);
    if name.is_empty() {
        return host_not_found(w, name);
    }

    let resolved = if via_node {
        hooks.hosts.find_node(name)
    } else {
        hooks.hosts.find_hostname(name)
    };
    // GUIDs are case-insensitive; retry lowercased.
    let resolved = resolved
        .or_else(|| hooks.hosts.find_guid(name))
        .or_else(|| hooks.hosts.find_guid(&name.to_lowercase()));

    let host = match resolved {
        Some(h) => h,
        None => return host_not_found(w, name),
    };

    if rest.trim_start_matches('/').is_empty() {
        // Nothing after the host segment: send the browser back with a
        // trailing slash so relative dashboard links resolve.
        let (url_path, url_query) = match w.url_as_received.find('?') {
            Some(idx) => (&w.url_as_received[..idx], &w.url_as_received[idx..]),
            None => (w.url_as_received.as_str(), ""),
        };
        let location = format!("{}/{}", url_path.trim_end_matches('/'), url_query);
        let _ = write!(w.response.header, "Location: {}\r\n", location);
        w.response.data.reset();
        return 301;
    }

    w.switched_host = Some(host);
    dispatch_path(w, cfg, hooks, rest)
}

fn host_not_found(w: &mut WebClient, name: &str) -> u16 {
    w.response.data.reset();
    w.response.data.content_type = "text/html; charset=utf-8";
    w.response.data.push_str("This agent does not maintain a database for host: ");
    w.response.data.push_html_escaped(name);
    404
}

/// The running configuration as the client would write it.
fn config_dump(w: &mut WebClient, cfg: &Config) -> u16 {
    w.response.data.reset();
    w.response.data.content_type = "text/plain; charset=utf-8";
    match serde_json::to_string_pretty(&ConfigView::from(cfg)) {
        Ok(body) => {
            w.response.data.push_str(&body);
            w.response.data.push_str("\n");
            200
        }
        Err(_) => {
            w.response.data.push_str("configuration is not serializable");
            500
        }
    }
}

// Serialization view: Config only derives Deserialize, and the dump should
// stay stable even if the runtime struct grows non-exportable fields.
#[derive(serde::Serialize)]
struct ConfigView {
    bind: String,
    workers: usize,
    web_root: String,
    enable_gzip: bool,
    gzip_level: u32,
    gzip_strategy: crate::config::GzipStrategy,
    respect_do_not_track: bool,
    x_frame_options: Option<String>,
    force_https: bool,
    timeout_us: u64,
    keepalive_max_requests: u32,
}

impl From<&Config> for ConfigView {
    fn from(cfg: &Config) -> Self {
        Self {
            bind: cfg.bind.clone(),
            workers: cfg.workers,
            web_root: cfg.web_root.display().to_string(),
            enable_gzip: cfg.enable_gzip,
            gzip_level: cfg.gzip_level,
            gzip_strategy: cfg.gzip_strategy,
            respect_do_not_track: cfg.respect_do_not_track,
            x_frame_options: cfg.x_frame_options.clone(),
            force_https: cfg.force_https,
            timeout_us: cfg.timeout_us,
            keepalive_max_requests: cfg.keepalive_max_requests,
        }
    }
}


#[cfg(feature = "internal-checks")]
fn internal_check(w: &mut WebClient, hooks: &Hooks, which: &str) -> u16 {
    if !hooks.access.allows(Capability::Mgmt) {
        return denied(w);
    }
    if w.bearer_token().is_none() {
        w.response.data.reset();
        w.response.data.push_str(MISSING_BEARER_BODY);
        return 412;
    }

    w.response.data.reset();
    match which {
        "exit" => {
            w.response.data.push_str("exiting");
            crate::server::request_shutdown();
            200
        }
        "debug" => {
            let _ = write!(
                w.response.data,
                "client {} requests served {}",
                w.id, w.use_count
            );
            200
        }
        _ => {
            // mirror: echo the sanitized request back
            let url = w.url_as_received.clone();
            w.response.data.push_str(&url);
            200
        }
    }
}

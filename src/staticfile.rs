// src/staticfile.rs
//
// Maps a decoded URL path onto the web root, with the dashboard-version
// fallback rules, and arms the FILECOPY producer. Path policy runs before
// any filesystem syscall.

use std::collections::HashMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use once_cell::sync::Lazy;

use crate::client::{Mode, WebClient};
use crate::config::Config;
use crate::syscalls::{self, OpenStatus};

// Built once on first resolve.
static MIME_BY_EXTENSION: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("html", "text/html; charset=utf-8"),
        ("js", "application/javascript; charset=utf-8"),
        ("css", "text/css; charset=utf-8"),
        ("xml", "application/xml; charset=utf-8"),
        ("xsl", "text/xsl; charset=utf-8"),
        ("txt", "text/plain; charset=utf-8"),
        ("svg", "image/svg+xml"),
        ("ttf", "application/x-font-truetype"),
        ("otf", "application/x-font-opentype"),
        ("woff", "application/font-woff"),
        ("woff2", "application/font-woff2"),
        ("eot", "application/vnd.ms-fontobject"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("bmp", "image/bmp"),
        ("ico", "image/x-icon"),
        ("icns", "image/icns"),
    ])
});

pub fn content_type_for(path: &Path) -> &'static str {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .and_then(|e| MIME_BY_EXTENSION.get(e.as_str()).copied())
        .unwrap_or("application/octet-stream")
}

fn allowed_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-')
}

/// Serve `path` (decoded, version prefix already stripped by the router)
/// from the web root. Returns the response status; on 200 the slot is in
/// FILECOPY mode with the producer armed.
pub fn serve_file(w: &mut WebClient, cfg: &Config, path: &str) -> u16 {
    let path = path.trim_start_matches('/');

    if path.contains("..") {
        w.response.data.reset();
        w.response.data.content_type = "text/html; charset=utf-8";
        w.response.data.push_str("Relative filenames are not supported: ");
        w.response.data.push_html_escaped(path);
        return 400;
    }
    if !path.chars().all(allowed_path_char) {
        w.response.data.reset();
        w.response.data.content_type = "text/html; charset=utf-8";
        w.response.data.push_str("File name contains invalid characters: ");
        w.response.data.push_html_escaped(path);
        return 400;
    }

    let root = cfg.web_root.as_path();
    let version = w.path_flags.version();

    // Resolution matrix: primary candidate plus an optional fallback. A
    // fallback that lands on a directory root forces trailing-slash
    // semantics so it serves its index instead of redirecting.
    let mut trailing_slash = w.path_flags.trailing_slash;
    let (primary, fallback): (PathBuf, Option<(PathBuf, bool)>) =
        match (w.path_flags.has_extension, version, path.is_empty()) {
            (true, None, _) => (root.join(path), None),
            (true, Some(v), _) => (
                root.join(format!("v{}", v)).join(path),
                Some((root.join(path), false)),
            ),
            (false, Some(v), false) => (
                root.join(path),
                Some((root.join(format!("v{}", v)), true)),
            ),
            (false, Some(v), true) => (root.join(format!("v{}", v)), None),
            (false, None, _) => (root.join(path), Some((root.to_path_buf(), true))),
        };

    let (target, meta) = match std::fs::metadata(&primary) {
        Ok(m) => (primary, m),
        Err(_) => match fallback {
            Some((fb, mark_slash)) => match std::fs::metadata(&fb) {
                Ok(m) => {
                    if mark_slash {
                        trailing_slash = true;
                    }
                    (fb, m)
                }
                Err(_) => return not_found(w, path),
            },
            None => return not_found(w, path),
        },
    };

    let (target, meta) = if meta.is_dir() {
        if !trailing_slash {
            return redirect_to_slash(w);
        }
        let index = target.join("index.html");
        match std::fs::metadata(&index) {
            Ok(m) if m.is_file() => (index, m),
            _ => return not_found(w, path),
        }
    } else {
        (target, meta)
    };

    let fd = match syscalls::open_nonblocking(&target) {
        Ok(OpenStatus::Opened(fd)) => fd,
        Ok(OpenStatus::Busy) => {
            // Someone holds the file; tell the browser to come back.
            let _ = write!(w.response.header, "Location: {}\r\n", w.url_as_received);
            w.response.data.reset();
            return 307;
        }
        Ok(OpenStatus::NotFound) | Ok(OpenStatus::Denied) => return not_found(w, path),
        Err(e) => {
            tracing::debug!(id = w.id, error = %e, file = %target.display(), "open failed");
            return not_found(w, path);
        }
    };

    w.response.data.reset();
    w.response.data.content_type = content_type_for(&target);
    w.response.data.no_cacheable = false;
    w.response.data.date = Some(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));

    w.mode = Mode::FileCopy;
    w.response.rlen = meta.len();
    w.ifd = fd;
    w.transfer.wait_read = true;
    w.transfer.wait_send = false;

    200
}

fn not_found(w: &mut WebClient, path: &str) -> u16 {
    w.response.data.reset();
    w.response.data.content_type = "text/html; charset=utf-8";
    w.response.data.push_str("File does not exist: ");
    w.response.data.push_html_escaped(path);
    404
}

/// Relative 301 for a directory requested without its trailing slash: the
/// browser re-requests last-segment/ plus the original query.
fn redirect_to_slash(w: &mut WebClient) -> u16 {
    let last_segment = w
        .path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string();
    let location = format!("{}/{}", last_segment, w.query);

    let _ = write!(w.response.header, "Location: {}\r\n", location);

    w.response.data.reset();
    w.response.data.content_type = "text/html; charset=utf-8";
    w.response.data.push_str("<!DOCTYPE html><html><head><meta http-equiv=\"refresh\" content=\"0; url=");
    w.response.data.push_html_escaped(&location);
    w.response.data.push_str("\"></head><body>Moved <a href=\"");
    w.response.data.push_html_escaped(&location);
    w.response.data.push_str("\">here</a>.</body></html>");
    301
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_table() {
        assert_eq!(
            content_type_for(Path::new("a/main.js")),
            "application/javascript; charset=utf-8"
        );
        assert_eq!(content_type_for(Path::new("logo.PNG")), "image/png");
        assert_eq!(
            content_type_for(Path::new("font.woff2")),
            "application/font-woff2"
        );
        assert_eq!(
            content_type_for(Path::new("unknown.bin")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for(Path::new("noext")),
            "application/octet-stream"
        );
    }

    #[test]
    fn path_charset() {
        assert!(allowed_path_char('a'));
        assert!(allowed_path_char('/'));
        assert!(allowed_path_char('.'));
        assert!(!allowed_path_char(' '));
        assert!(!allowed_path_char('\\'));
        assert!(!allowed_path_char('%'));
    }
}

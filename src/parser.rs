// src/parser.rs
//
// Incremental HTTP/1.1 request validation. The receive buffer accumulates
// across reads and this runs after every one of them: it must be safe to
// call repeatedly with idempotent effect until it returns Ok.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::client::{Mode, WebClient};
use crate::compress::Compressor;
use crate::config::Config;
use crate::transport::TransportFamily;
use crate::url;

/// Parse attempts allowed without the receive buffer growing.
pub const MAX_HEADER_PARSE_TRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Ok,
    Incomplete,
    NotSupported,
    MalformedUrl,
    ExcessRequestData,
    TooManyReadRetries,
    /// Plain-TCP request under the force-TLS policy; answer with the
    /// https upgrade.
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownHeader {
    Origin,
    Connection,
    AcceptEncoding,
    Dnt,
    UserAgent,
    AuthToken,
    Host,
    ForwardedHost,
}

// Built once on first parse; every worker converges on the same table.
static KNOWN_HEADERS: Lazy<HashMap<&'static str, KnownHeader>> = Lazy::new(|| {
    HashMap::from([
        ("origin", KnownHeader::Origin),
        ("connection", KnownHeader::Connection),
        ("accept-encoding", KnownHeader::AcceptEncoding),
        ("dnt", KnownHeader::Dnt),
        ("user-agent", KnownHeader::UserAgent),
        ("x-auth-token", KnownHeader::AuthToken),
        ("host", KnownHeader::Host),
        ("x-forwarded-host", KnownHeader::ForwardedHost),
    ])
});

const METHODS: [(&[u8], Mode); 6] = [
    (b"GET ", Mode::Get),
    (b"OPTIONS ", Mode::Options),
    (b"POST ", Mode::Post),
    (b"PUT ", Mode::Put),
    (b"DELETE ", Mode::Delete),
    (b"STREAM ", Mode::Stream),
];

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn ascii_contains_ignore_case(haystack: &str, needle: &str) -> bool {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || n.len() > h.len() {
        return n.is_empty();
    }
    h.windows(n.len()).any(|w| w.eq_ignore_ascii_case(n))
}

/// Pull `hostname=` out of a raw query string for the refusal log.
fn ingest_hostname(target: &str) -> Option<&str> {
    let query = &target[target.find('?')? + 1..];
    for kv in query.split('&') {
        if let Some(v) = kv.strip_prefix("hostname=") {
            return Some(v);
        }
    }
    None
}

/// Validate the accumulated receive buffer. Mutates the slot only on a
/// definitive outcome; Incomplete leaves everything but the progress
/// counters untouched.
pub fn validate(w: &mut WebClient, cfg: &Config) -> ValidationResult {
    let size = w.response.data.len();

    w.parse.tries += 1;
    if w.parse.tries > MAX_HEADER_PARSE_TRIES && size <= w.parse.last_size {
        return ValidationResult::TooManyReadRetries;
    }

    // Watermark trick: restart the terminator search a few bytes behind the
    // previous size so a \r\n\r\n straddling two reads is still found.
    let search_from = w.parse.last_size.saturating_sub(4);

    let header_end = {
        let data = w.response.data.as_bytes();
        match find(&data[search_from..], b"\r\n\r\n") {
            Some(pos) => search_from + pos,
            None => {
                w.parse.last_size = size;
                return ValidationResult::Incomplete;
            }
        }
    };
    w.parse.last_size = size;

    // Method prefix.
    let (mode, target_start) = {
        let data = w.response.data.as_bytes();
        match METHODS
            .iter()
            .find(|(prefix, _)| data.len() >= prefix.len() && &data[..prefix.len()] == *prefix)
        {
            Some((prefix, mode)) => (*mode, prefix.len()),
            None => return ValidationResult::NotSupported,
        }
    };

    // Request-target, delimited by " HTTP/".
    let target = {
        let data = w.response.data.as_bytes();
        let rel = match find(&data[target_start..header_end], b" HTTP/") {
            Some(pos) => pos,
            None => return ValidationResult::Incomplete,
        };
        match std::str::from_utf8(&data[target_start..target_start + rel]) {
            Ok(t) => t.to_string(),
            Err(_) => return ValidationResult::MalformedUrl,
        }
    };

    if mode == Mode::Stream
        && cfg.force_https
        && !w.transport.is_encrypted()
        && w.transport.family() == TransportFamily::Tcp
    {
        tracing::warn!(
            id = w.id,
            hostname = ingest_hostname(&target).unwrap_or("unknown"),
            "refusing plain-TCP STREAM under the force-TLS policy"
        );
        return ValidationResult::NotSupported;
    }

    // Header lines.
    let mut origin = None;
    let mut user_agent = None;
    let mut auth_token = None;
    let mut host = None;
    let mut forwarded_host = None;
    let mut keepalive = false;
    let mut gzip_ok = false;
    let mut dnt: Option<bool> = None;

    {
        let data = w.response.data.as_bytes();
        let mut cursor = {
            // Skip the request line.
            match find(&data[..header_end + 2], b"\r\n") {
                Some(pos) => pos + 2,
                None => header_end + 2,
            }
        };

        while cursor < header_end {
            let line_end = match find(&data[cursor..header_end + 2], b"\r\n") {
                Some(pos) => cursor + pos,
                None => header_end,
            };
            let line = &data[cursor..line_end];
            cursor = line_end + 2;

            let colon = match line.iter().position(|&b| b == b':') {
                Some(pos) => pos,
                None => continue,
            };
            let name = match std::str::from_utf8(&line[..colon]) {
                Ok(n) => n.trim(),
                Err(_) => continue,
            };
            let value = match std::str::from_utf8(&line[colon + 1..]) {
                Ok(v) => v.trim_start_matches(' ').trim_end(),
                Err(_) => continue,
            };

            let known = KNOWN_HEADERS
                .get(name.to_ascii_lowercase().as_str())
                .copied();
            match known {
                Some(KnownHeader::Origin) => origin = Some(value.to_string()),
                Some(KnownHeader::UserAgent) => user_agent = Some(value.to_string()),
                Some(KnownHeader::AuthToken) => auth_token = Some(value.to_string()),
                Some(KnownHeader::Host) => host = Some(value.to_string()),
                Some(KnownHeader::ForwardedHost) => forwarded_host = Some(value.to_string()),
                Some(KnownHeader::Connection) => {
                    if ascii_contains_ignore_case(value, "keep-alive") {
                        keepalive = true;
                    }
                }
                Some(KnownHeader::AcceptEncoding) => {
                    if ascii_contains_ignore_case(value, "gzip") {
                        gzip_ok = true;
                    }
                }
                Some(KnownHeader::Dnt) => {
                    dnt = Some(value.starts_with('1'));
                }
                None => {}
            }
        }
    }

    // Anything beyond the terminator must be a body this method can carry.
    {
        let data = w.response.data.as_bytes();
        let trailing = &data[header_end + 4..];
        let body_allowed = matches!(mode, Mode::Post | Mode::Put | Mode::Stream);
        if !body_allowed && trailing.iter().any(|b| !b.is_ascii_whitespace()) {
            return ValidationResult::ExcessRequestData;
        }
    }

    let decoded = match url::decode_target(&target) {
        Some(d) => d,
        None => return ValidationResult::MalformedUrl,
    };

    // Definitive: commit to the slot.
    w.mode = mode;
    w.url_as_received = target;
    w.path = decoded.path;
    w.query = decoded.query;
    url::classify(&w.path, &mut w.path_flags);

    w.headers.origin = origin;
    w.headers.user_agent = user_agent;
    w.headers.auth_token = auth_token;
    w.headers.host = host;
    w.headers.forwarded_host = forwarded_host;

    w.transfer.keepalive = keepalive;
    if gzip_ok && cfg.enable_gzip && w.response.compressor.is_none() {
        w.response.compressor = Some(Compressor::new(cfg.gzip_level));
        w.response.zoutput = true;
    }
    if cfg.respect_do_not_track {
        match dnt {
            Some(true) => w.policy.donottrack = true,
            Some(false) => w.policy.tracking_required = true,
            None => {}
        }
    }

    if !w.transport.is_encrypted()
        && cfg.force_https
        && w.transport.family() == TransportFamily::Tcp
        && mode != Mode::Stream
    {
        return ValidationResult::Redirect;
    }

    ValidationResult::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_client;

    fn feed(w: &mut crate::client::WebClient, bytes: &[u8]) {
        w.response.data.push_bytes(bytes);
    }

    #[test]
    fn complete_get_request() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(
            &mut w,
            b"GET /api/v1/data?chart=cpu HTTP/1.1\r\nHost: box1\r\nConnection: keep-alive\r\n\r\n",
        );

        assert_eq!(validate(&mut w, &cfg), ValidationResult::Ok);
        assert_eq!(w.mode, Mode::Get);
        assert_eq!(w.url_as_received, "/api/v1/data?chart=cpu");
        assert_eq!(w.path, "/api/v1/data");
        assert_eq!(w.query, "?chart=cpu");
        assert_eq!(w.headers.host.as_deref(), Some("box1"));
        assert!(w.transfer.keepalive);
    }

    #[test]
    fn parsing_is_monotone_over_partial_feeds() {
        let cfg = Config::default();
        let request: &[u8] =
            b"GET /index.html HTTP/1.1\r\nHost: h\r\nUser-Agent: test\r\n\r\n";

        let (mut w, _) = make_client(&cfg, vec![]);
        for i in 1..request.len() {
            w.response.data.reset();
            w.parse = Default::default();
            feed(&mut w, &request[..i]);
            assert_eq!(
                validate(&mut w, &cfg),
                ValidationResult::Incomplete,
                "prefix of {} bytes must stay incomplete",
                i
            );
        }

        w.response.data.reset();
        w.parse = Default::default();
        feed(&mut w, request);
        assert_eq!(validate(&mut w, &cfg), ValidationResult::Ok);
    }

    #[test]
    fn terminator_straddling_two_reads_is_found() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);

        feed(&mut w, b"GET / HTTP/1.1\r\nHost: h\r\n\r");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::Incomplete);
        feed(&mut w, b"\n");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::Ok);
    }

    #[test]
    fn unknown_method_not_supported() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"PATCH /x HTTP/1.1\r\n\r\n");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::NotSupported);
    }

    #[test]
    fn excess_data_after_get() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"GET / HTTP/1.1\r\nHost: h\r\n\r\nGARBAGE");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::ExcessRequestData);
    }

    #[test]
    fn post_body_is_not_excess() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"POST /api/v1/x HTTP/1.1\r\nHost: h\r\n\r\n{\"a\":1}");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::Ok);
        assert_eq!(w.mode, Mode::Post);
    }

    #[test]
    fn recognized_headers_are_stored() {
        let cfg = Config {
            respect_do_not_track: true,
            ..Config::default()
        };
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(
            &mut w,
            b"GET / HTTP/1.1\r\n\
              Origin: https://app.example\r\n\
              User-Agent: curl/8\r\n\
              X-Auth-Token: Bearer abc123\r\n\
              Host: box1\r\n\
              X-Forwarded-Host: outer\r\n\
              DNT: 1\r\n\
              Accept-Encoding: deflate, gzip\r\n\
              Ignored-Header: whatever\r\n\r\n",
        );

        assert_eq!(validate(&mut w, &cfg), ValidationResult::Ok);
        assert_eq!(w.headers.origin.as_deref(), Some("https://app.example"));
        assert_eq!(w.headers.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(w.bearer_token(), Some("abc123"));
        assert_eq!(w.headers.host.as_deref(), Some("box1"));
        assert_eq!(w.headers.forwarded_host.as_deref(), Some("outer"));
        assert!(w.policy.donottrack);
        assert!(w.response.zoutput);
        assert!(w.response.compressor.is_some());
    }

    #[test]
    fn gzip_not_armed_when_disabled() {
        let cfg = Config {
            enable_gzip: false,
            ..Config::default()
        };
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"GET / HTTP/1.1\r\nAccept-Encoding: gzip\r\n\r\n");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::Ok);
        assert!(!w.response.zoutput);
    }

    #[test]
    fn header_names_match_case_insensitively() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"GET / HTTP/1.1\r\nCONNECTION: Keep-Alive\r\nhOsT: h\r\n\r\n");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::Ok);
        assert!(w.transfer.keepalive);
        assert_eq!(w.headers.host.as_deref(), Some("h"));
    }

    #[test]
    fn retries_exhaust_without_progress() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"GET / HTTP/1.1\r\nHost");

        assert_eq!(validate(&mut w, &cfg), ValidationResult::Incomplete);
        for _ in 0..MAX_HEADER_PARSE_TRIES - 1 {
            assert_eq!(validate(&mut w, &cfg), ValidationResult::Incomplete);
        }
        assert_eq!(validate(&mut w, &cfg), ValidationResult::TooManyReadRetries);
    }

    #[test]
    fn progress_resets_the_retry_window() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"GET / HTTP/1.1\r\n");
        for _ in 0..MAX_HEADER_PARSE_TRIES {
            validate(&mut w, &cfg);
        }
        // New bytes arrive: the stalled request may still complete.
        feed(&mut w, b"Host: h\r\n\r\n");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::Ok);
    }

    #[test]
    fn malformed_escape_in_target() {
        let cfg = Config::default();
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"GET /a%zz HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::MalformedUrl);
    }

    #[test]
    fn force_https_redirects_plain_tcp() {
        let cfg = Config {
            force_https: true,
            ..Config::default()
        };
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(&mut w, b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(validate(&mut w, &cfg), ValidationResult::Redirect);
    }

    #[test]
    fn force_https_refuses_plain_stream() {
        let cfg = Config {
            force_https: true,
            ..Config::default()
        };
        let (mut w, _) = make_client(&cfg, vec![]);
        feed(
            &mut w,
            b"STREAM /stream?key=k&hostname=edge-7 HTTP/1.1\r\n\r\n",
        );
        assert_eq!(validate(&mut w, &cfg), ValidationResult::NotSupported);
    }

    #[test]
    fn ingest_hostname_extraction() {
        assert_eq!(
            ingest_hostname("/stream?key=k&hostname=edge-7&ver=3"),
            Some("edge-7")
        );
        assert_eq!(ingest_hostname("/stream?key=k"), None);
        assert_eq!(ingest_hostname("/stream"), None);
    }
}

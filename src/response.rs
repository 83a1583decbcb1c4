// src/response.rs
use std::fmt::Write;
use std::time::{Duration, SystemTime};

use crate::client::{Mode, WebClient};
use crate::config::Config;

/// Synthetic status: a plain-TCP request that must move to https. Emitted
/// on the wire as 301.
pub const HTTP_RESP_HTTPS_UPGRADE: u16 = 399;

pub const HTTP_RESP_CLIENT_CLOSED: u16 = 499;

/// Cacheable static bodies are published with this freshness window.
pub const STATIC_EXPIRES: Duration = Duration::from_secs(86_400);

const SERVER_TOKEN: &str = "Vigil Embedded HTTP Server";

pub fn reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        422 => "Unprocessable Content",
        423 => "Locked",
        424 => "Failed Dependency",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        HTTP_RESP_CLIENT_CLOSED => "Client Closed Request",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",
        _ => "Unknown",
    }
}

/// Serialize the response header block into `header_output`, once per
/// response and in a fixed order.
pub fn build_header(w: &mut WebClient, cfg: &Config) {
    let upgrade = w.response.code == HTTP_RESP_HTTPS_UPGRADE;
    if upgrade {
        w.response.code = 301;
    }
    let code = w.response.code;

    let now = SystemTime::now();
    let date = w.response.data.date.unwrap_or(now);

    // Temporaries first; header_output is written in one pass below.
    let location = if upgrade {
        let host = w
            .headers
            .forwarded_host
            .as_deref()
            .or(w.headers.host.as_deref())
            .unwrap_or("localhost");
        Some(format!("https://{}{}", host, w.url_as_received))
    } else {
        None
    };

    // Keep-alive needs a knowable body length: in-memory, declared
    // remaining-length, or chunked transfer.
    if !w.response.zoutput && !w.response.length_known {
        w.transfer.keepalive = false;
    }

    let h = &mut w.response.header_output;
    h.reset();

    let _ = write!(h, "HTTP/1.1 {} {}\r\n", code, reason(code));

    if let Some(location) = location {
        let _ = write!(h, "Location: {}\r\n", location);
        h.push_str("\r\n");
        return;
    }

    let _ = write!(
        h,
        "Connection: {}\r\n",
        if w.transfer.keepalive { "keep-alive" } else { "close" }
    );
    let _ = write!(h, "Server: {}\r\n", SERVER_TOKEN);
    let _ = write!(
        h,
        "Access-Control-Allow-Origin: {}\r\n",
        w.headers.origin.as_deref().unwrap_or("*")
    );
    h.push_str("Access-Control-Allow-Credentials: true\r\n");
    let _ = write!(h, "Content-Type: {}\r\n", w.response.data.content_type);
    let _ = write!(h, "Date: {}\r\n", httpdate::fmt_http_date(date));

    if let Some(xfo) = &cfg.x_frame_options {
        let _ = write!(h, "X-Frame-Options: {}\r\n", xfo);
    }

    if cfg.respect_do_not_track {
        if w.policy.donottrack {
            h.push_str("Tk: N\r\n");
        } else if w.policy.tracking_required {
            h.push_str("Tk: T;cookies\r\n");
        }
    }

    if w.mode == Mode::Options {
        h.push_str("Access-Control-Allow-Methods: GET, OPTIONS\r\n");
        h.push_str(
            "Access-Control-Allow-Headers: accept, x-requested-with, origin, content-type, cookie, x-auth-token\r\n",
        );
        h.push_str("Access-Control-Max-Age: 1209600\r\n");
    } else if w.response.data.no_cacheable {
        h.push_str("Cache-Control: no-cache, no-store, must-revalidate\r\nPragma: no-cache\r\n");
        let _ = write!(h, "Expires: {}\r\n", httpdate::fmt_http_date(now));
    } else {
        h.push_str("Cache-Control: public\r\n");
        let expires = w.response.data.expires.unwrap_or(now + STATIC_EXPIRES);
        let _ = write!(h, "Expires: {}\r\n", httpdate::fmt_http_date(expires));
    }

    // Custom headers accumulated during routing.
    let custom = w.response.header.as_bytes().to_vec();
    let h = &mut w.response.header_output;
    h.push_bytes(&custom);

    if w.response.zoutput {
        h.push_str("Content-Encoding: gzip\r\n");
        h.push_str("Transfer-Encoding: chunked\r\n");
        w.transfer.chunked = true;
    } else if w.response.length_known {
        let length = if w.mode == Mode::FileCopy {
            w.response.rlen
        } else {
            w.response.data.len() as u64
        };
        let _ = write!(w.response.header_output, "Content-Length: {}\r\n", length);
    }

    w.response.header_output.push_str("\r\n");
}

// src/url.rs
use percent_encoding::percent_decode_str;

/// Facts about the decoded path the router and the static resolver both
/// need. Version flags are filled in by the router as it walks segments.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PathFlags {
    pub has_version: bool,
    pub is_v0: bool,
    pub is_v1: bool,
    pub is_v2: bool,
    pub trailing_slash: bool,
    pub has_extension: bool,
}

impl PathFlags {
    pub fn version(&self) -> Option<u8> {
        if self.is_v0 {
            Some(0)
        } else if self.is_v1 {
            Some(1)
        } else if self.is_v2 {
            Some(2)
        } else {
            None
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct DecodedTarget {
    pub path: String,
    /// Decoded query string, leading `?` preserved. Empty when absent.
    pub query: String,
}

/// Percent-decode the request-target and split it into path and query.
/// Escapes never survive into the decoded output; bad escapes or non-UTF-8
/// sequences are a malformed URL.
pub fn decode_target(target: &str) -> Option<DecodedTarget> {
    let (raw_path, raw_query) = match target.find('?') {
        Some(idx) => (&target[..idx], Some(&target[idx + 1..])),
        None => (target, None),
    };

    let path = decode_component(raw_path)?;
    let query = match raw_query {
        Some(q) => {
            let mut s = String::with_capacity(q.len() + 1);
            s.push('?');
            s.push_str(&decode_component(q)?);
            s
        }
        None => String::new(),
    };

    Some(DecodedTarget { path, query })
}

fn decode_component(raw: &str) -> Option<String> {
    // A lone '%' or a short escape is rejected rather than passed through.
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return None;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_decode_str(raw).decode_utf8().ok().map(Into::into)
}

/// Trailing-slash and file-extension classification of a decoded path.
/// An empty path counts as trailing-slash (it is the root).
pub fn classify(path: &str, flags: &mut PathFlags) {
    flags.trailing_slash = path.is_empty() || path.ends_with('/');

    let last_segment = match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    };
    flags.has_extension = last_segment.contains('.');
}

/// Dashboard version prefix of one path segment.
pub fn version_of(segment: &str) -> Option<u8> {
    match segment {
        "v0" => Some(0),
        "v1" => Some(1),
        "v2" => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_path_and_query() {
        let t = decode_target("/api/v1/data?chart=system.cpu&after=-60").unwrap();
        assert_eq!(t.path, "/api/v1/data");
        assert_eq!(t.query, "?chart=system.cpu&after=-60");
    }

    #[test]
    fn percent_escapes_are_decoded() {
        let t = decode_target("/a%20b/c%2Fd?x=%41").unwrap();
        assert_eq!(t.path, "/a b/c/d");
        assert_eq!(t.query, "?x=A");
        assert!(!t.path.contains('%'));
    }

    #[test]
    fn bad_escape_is_malformed() {
        assert!(decode_target("/a%2").is_none());
        assert!(decode_target("/a%zz").is_none());
        assert!(decode_target("/%ff%fe").is_none());
    }

    #[test]
    fn classify_trailing_slash() {
        let mut f = PathFlags::default();
        classify("/foo/", &mut f);
        assert!(f.trailing_slash);
        classify("", &mut f);
        assert!(f.trailing_slash);
        classify("/foo", &mut f);
        assert!(!f.trailing_slash);
    }

    #[test]
    fn classify_extension() {
        let mut f = PathFlags::default();
        classify("/v2/main.js", &mut f);
        assert!(f.has_extension);
        classify("/v2.1/main", &mut f);
        assert!(!f.has_extension);
        classify("/index.html", &mut f);
        assert!(f.has_extension);
    }

    #[test]
    fn version_segments() {
        assert_eq!(version_of("v0"), Some(0));
        assert_eq!(version_of("v1"), Some(1));
        assert_eq!(version_of("v2"), Some(2));
        assert_eq!(version_of("v3"), None);
        assert_eq!(version_of("api"), None);
    }
}

// src/buffer.rs
use std::fmt;
use std::time::SystemTime;

/// Growable append-only byte buffer carrying the metadata a response body
/// needs on its way out: content type, date, expires and the cacheable bit.
///
/// `reset` keeps the allocation so a slot can serve many requests without
/// churning the allocator.
#[derive(Debug)]
pub struct WebBuffer {
    data: Vec<u8>,
    pub content_type: &'static str,
    pub date: Option<SystemTime>,
    pub expires: Option<SystemTime>,
    pub no_cacheable: bool,
}

impl WebBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
            content_type: "text/plain; charset=utf-8",
            date: None,
            expires: None,
            no_cacheable: true,
        }
    }

    /// Length 0, capacity retained, metadata back to defaults.
    pub fn reset(&mut self) {
        self.data.clear();
        self.content_type = "text/plain; charset=utf-8";
        self.date = None;
        self.expires = None;
        self.no_cacheable = true;
    }

    /// Ensure room for `n` more bytes.
    pub fn need_bytes(&mut self, n: usize) {
        self.data.reserve(n);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn push_str(&mut self, s: &str) {
        self.data.extend_from_slice(s.as_bytes());
    }

    /// Append `s` with the five HTML metacharacters escaped. Error bodies
    /// echo client-supplied names and must never reflect raw markup.
    pub fn push_html_escaped(&mut self, s: &str) {
        for c in s.chars() {
            match c {
                '&' => self.push_str("&amp;"),
                '<' => self.push_str("&lt;"),
                '>' => self.push_str("&gt;"),
                '"' => self.push_str("&quot;"),
                '\'' => self.push_str("&#39;"),
                c if (c as u32) < 0x20 => self.data.push(b' '),
                c => {
                    let mut tmp = [0u8; 4];
                    self.push_str(c.encode_utf8(&mut tmp));
                }
            }
        }
    }

    /// Replace every occurrence of `from` with `to` in place.
    pub fn replace_char(&mut self, from: u8, to: u8) {
        for b in self.data.iter_mut() {
            if *b == from {
                *b = to;
            }
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl Default for WebBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// `write!(buf, ...)` appends formatted text, the sprintf of this engine.
impl fmt::Write for WebBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.data.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn reset_keeps_capacity() {
        let mut b = WebBuffer::with_capacity(64);
        b.push_str("hello");
        b.content_type = "text/html; charset=utf-8";
        b.no_cacheable = false;
        let cap = b.capacity();
        b.reset();
        assert_eq!(b.len(), 0);
        assert!(b.capacity() >= cap);
        assert_eq!(b.content_type, "text/plain; charset=utf-8");
        assert!(b.no_cacheable);
    }

    #[test]
    fn formatted_append() {
        let mut b = WebBuffer::new();
        write!(b, "HTTP/1.1 {} {}\r\n", 200, "OK").unwrap();
        assert_eq!(b.as_bytes(), b"HTTP/1.1 200 OK\r\n");
    }

    #[test]
    fn html_escape() {
        let mut b = WebBuffer::new();
        b.push_html_escaped("<script>\"a&b\"</script>\x01");
        assert_eq!(
            b.as_bytes(),
            b"&lt;script&gt;&quot;a&amp;b&quot;&lt;/script&gt; " as &[u8]
        );
    }

    #[test]
    fn replace_char() {
        let mut b = WebBuffer::new();
        b.push_str("a\nb\nc");
        b.replace_char(b'\n', b' ');
        assert_eq!(b.as_bytes(), b"a b c");
    }
}

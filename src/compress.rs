// src/compress.rs
use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;

/// Streaming gzip with chunked transfer framing.
///
/// The source body is fed in as it becomes available; each refill is
/// sync-flushed so the client sees bytes without waiting for the stream to
/// end, and the final refill finishes the gzip stream (CRC trailer included).
/// Chunk framing travels through the same staging buffer as the payload, so
/// a partial socket write can never tear a `{hex}\r\n` header.
#[derive(Debug)]
pub struct Compressor {
    enc: Option<GzEncoder<Vec<u8>>>,
    /// Framed bytes staged for the socket.
    wire: Vec<u8>,
    /// Bytes of `wire` already written out. Invariant: `zsent <= zhave()`.
    pub zsent: usize,
    chunks_sent: usize,
    trailer_queued: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl Compressor {
    pub fn new(level: u32) -> Self {
        Self {
            enc: Some(GzEncoder::new(Vec::new(), Compression::new(level))),
            wire: Vec::new(),
            zsent: 0,
            chunks_sent: 0,
            trailer_queued: false,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Valid bytes staged for the socket.
    #[inline]
    pub fn zhave(&self) -> usize {
        self.wire.len()
    }

    #[inline]
    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent
    }

    #[inline]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    #[inline]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Feed new source bytes. `finish` when the producer is complete; that
    /// ends the gzip stream and queues the chunked-transfer terminator.
    /// Returns the compressed payload bytes produced by this call.
    pub fn feed(&mut self, input: &[u8], finish: bool) -> io::Result<usize> {
        if self.enc.is_none() || (input.is_empty() && !finish) {
            return Ok(0);
        }

        let enc = self.enc.as_mut().expect("stream already finished");
        enc.write_all(input)?;
        self.bytes_in += input.len() as u64;

        let payload: Vec<u8> = if finish {
            let enc = self.enc.take().expect("stream already finished");
            enc.finish()?
        } else {
            enc.flush()?;
            std::mem::take(enc.get_mut())
        };
        self.bytes_out += payload.len() as u64;

        if !payload.is_empty() {
            if self.chunks_sent > 0 {
                self.wire.extend_from_slice(b"\r\n");
            }
            self.wire
                .extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
            self.wire.extend_from_slice(&payload);
            self.chunks_sent += 1;
        }

        if finish && !self.trailer_queued {
            if self.chunks_sent > 0 {
                self.wire.extend_from_slice(b"\r\n0\r\n\r\n");
            }
            self.trailer_queued = true;
        }

        Ok(payload.len())
    }

    /// Framed bytes still to be written.
    #[inline]
    pub fn pending(&self) -> &[u8] {
        &self.wire[self.zsent..]
    }

    /// Record `n` bytes written; compacts the staging buffer when drained.
    pub fn advance(&mut self, n: usize) {
        self.zsent += n;
        debug_assert!(self.zsent <= self.wire.len());
        if self.zsent == self.wire.len() {
            self.wire.clear();
            self.zsent = 0;
        }
    }

    /// Everything fed, finished, and drained to the socket.
    pub fn is_done(&self) -> bool {
        self.enc.is_none() && self.trailer_queued && self.zsent == self.wire.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    // Split a chunked-transfer stream back into its payload bytes.
    fn dechunk(mut wire: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let pos = wire
                .windows(2)
                .position(|w| w == b"\r\n")
                .expect("chunk header");
            let size = usize::from_str_radix(std::str::from_utf8(&wire[..pos]).unwrap(), 16)
                .expect("hex size");
            wire = &wire[pos + 2..];
            if size == 0 {
                assert_eq!(wire, b"\r\n");
                break;
            }
            out.extend_from_slice(&wire[..size]);
            wire = &wire[size..];
            assert_eq!(&wire[..2], b"\r\n");
            wire = &wire[2..];
        }
        out
    }

    #[test]
    fn round_trip_two_refills() {
        let part1 = vec![b'a'; 6000];
        let part2 = vec![b'b'; 5000];

        let mut c = Compressor::new(3);
        c.feed(&part1, false).unwrap();
        assert!(c.zhave() > 0);
        c.feed(&part2, true).unwrap();

        let mut wire = Vec::new();
        while !c.is_done() {
            let pending = c.pending().to_vec();
            wire.extend_from_slice(&pending);
            c.advance(pending.len());
        }

        assert!(wire.ends_with(b"\r\n0\r\n\r\n"));

        let payload = dechunk(&wire);
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&payload[..])
            .read_to_end(&mut decoded)
            .unwrap();
        let mut original = part1;
        original.extend_from_slice(&part2);
        assert_eq!(decoded, original);
    }

    #[test]
    fn single_shot_small_body() {
        let mut c = Compressor::new(1);
        c.feed(b"hello gzip", true).unwrap();
        assert_eq!(c.chunks_sent(), 1);

        let wire = c.pending().to_vec();
        c.advance(wire.len());
        assert!(c.is_done());

        let payload = dechunk(&wire);
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&payload[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, b"hello gzip");
    }

    #[test]
    fn partial_drain_keeps_counters_sane() {
        let mut c = Compressor::new(3);
        c.feed(&vec![b'x'; 10_000], true).unwrap();
        while c.pending().len() > 3 {
            assert!(c.zsent <= c.zhave());
            c.advance(3);
        }
        let rest = c.pending().len();
        c.advance(rest);
        assert!(c.is_done());
    }

    #[test]
    fn payload_bytes_match_compressor_output() {
        let mut c = Compressor::new(3);
        let mut produced = 0;
        produced += c.feed(&vec![b'q'; 4096], false).unwrap();
        produced += c.feed(&vec![b'r'; 4096], true).unwrap();

        let mut wire = Vec::new();
        while !c.is_done() {
            let pending = c.pending().to_vec();
            wire.extend_from_slice(&pending);
            c.advance(pending.len());
        }
        assert_eq!(dechunk(&wire).len(), produced);
        assert_eq!(c.bytes_out() as usize, produced);
    }
}

//! Length-prefixed frame codec for the parent/worker control pipes.
//!
//! A frame is an ASCII decimal payload length, a newline, then exactly
//! that many payload bytes holding one JSON document. Each pipe carries
//! one direction of traffic, so the codec is half-duplex per stream.
//!
//! The reader treats every malformed input the same way: a header that
//! is not `digits + '\n'`, a short payload read, or plain end of stream
//! all yield `Ok(None)`, the end-of-stream sentinel. Callers respond to
//! the sentinel by treating the peer as gone.

use std::io::{self, BufRead, BufReader, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound on a single frame payload. Control traffic is tiny; a
/// header announcing more than this means the stream is corrupt.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Frames one message as header + payload bytes.
pub fn encode<T: Serialize>(msg: &T) -> io::Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    let mut frame = format!("{}\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writes framed messages to one pipe end.
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    /// Wraps a write end.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Frames and writes one message, flushing the stream.
    pub fn send<T: Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let frame = encode(msg)?;
        self.inner.write_all(&frame)?;
        self.inner.flush()
    }

    /// Returns the underlying write end.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Reads framed messages from one pipe end.
///
/// Reads are buffered, so a select loop must check
/// [`has_buffered_data`](FrameReader::has_buffered_data) before polling
/// the raw fd: a frame that arrived behind an already-consumed one is
/// invisible to `poll(2)`.
pub struct FrameReader<R: Read> {
    inner: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a read end.
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// True when bytes already read from the fd are waiting in the buffer.
    pub fn has_buffered_data(&self) -> bool {
        !self.inner.buffer().is_empty()
    }

    /// Returns the underlying read end.
    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    /// Reads one frame, returning `Ok(None)` as the end-of-stream
    /// sentinel for EOF, a malformed header, or a short payload.
    pub fn recv<T: DeserializeOwned>(&mut self) -> io::Result<Option<T>> {
        let mut header = Vec::with_capacity(16);
        let n = self.inner.read_until(b'\n', &mut header)?;
        if n == 0 || header.last() != Some(&b'\n') {
            return Ok(None);
        }
        header.pop();

        let len = match parse_len(&header) {
            Some(len) if len <= MAX_FRAME => len,
            _ => return Ok(None),
        };

        let mut payload = vec![0u8; len];
        if let Err(err) = self.inner.read_exact(&mut payload) {
            return match err.kind() {
                io::ErrorKind::UnexpectedEof => Ok(None),
                _ => Err(err),
            };
        }

        match serde_json::from_slice(&payload) {
            Ok(msg) => Ok(Some(msg)),
            Err(_) => Ok(None),
        }
    }
}

fn parse_len(header: &[u8]) -> Option<usize> {
    if header.is_empty() || !header.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(header).ok()?.parse().ok()
}

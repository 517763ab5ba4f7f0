//! Line framing for the ASCII command protocol.
//!
//! Wire format:
//! ```text
//! → device:  #G_STIME=3 CR
//! ← device:  #G_STIME=5123 CR [LF]
//! ```
//!
//! Inbound bytes arrive in arbitrary chunks. [`LineSplitter`] buffers them and
//! yields complete lines; the terminator is whichever of CR or LF comes first.

use tracing::warn;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Upper bound on an unterminated line before the buffer is discarded.
pub const MAX_LINE: usize = 1024;

/// Encode a command line for transmission (appends CR).
pub fn encode_line(text: &str) -> Vec<u8> {
    let mut wire = Vec::with_capacity(text.len() + 1);
    wire.extend_from_slice(text.as_bytes());
    wire.push(CR);
    wire
}

/// Splits a byte stream into trimmed, non-empty lines. Buffers partial data
/// across calls, so it can be fed transport chunk boundaries.
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(128),
        }
    }

    /// Feed new data and iterate the complete lines now available.
    ///
    /// The iterator is lazy: lines not pulled before it is dropped stay
    /// buffered and come out of the next `feed` call.
    pub fn feed(&mut self, data: &[u8]) -> Lines<'_> {
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_LINE && !self.buf.iter().any(|&b| b == CR || b == LF) {
            warn!(len = self.buf.len(), "unterminated line overflow, discarding buffer");
            self.buf.clear();
        }
        Lines { buf: &mut self.buf }
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial line.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over complete lines, see [`LineSplitter::feed`].
pub struct Lines<'a> {
    buf: &'a mut Vec<u8>,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            let end = self.buf.iter().position(|&b| b == CR || b == LF)?;
            let raw: Vec<u8> = self.buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.trim();
            // CRLF leaves an empty segment behind the CR; skip it.
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

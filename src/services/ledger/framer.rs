//! Incremental line framing over a byte stream
//!
//! Lines are cut on `\n` at the byte level so every emitted line knows
//! exactly how many source bytes it consumed. The resume cursor is the sum
//! of consumed bytes, which always lands on a line boundary.

use std::borrow::Cow;

/// Default cap on a single line, terminator excluded
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// Leading bytes kept from an oversized line, enough to read its tag
const OVERSIZED_HEAD: usize = 16;

/// A complete line borrowed from the framer's buffer
#[derive(Debug, PartialEq, Eq)]
pub struct FramedLine<'a> {
    /// Line content without the terminator (`\n` or `\r\n`); only the
    /// leading bytes when `oversized`
    pub bytes: &'a [u8],
    /// Source bytes consumed, terminator included
    pub consumed: usize,
    /// The line exceeded the length cap and its content was dropped
    pub oversized: bool,
}

/// Splits pushed chunks into lines, carrying the unterminated tail.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    start: usize,
    /// Bytes from `start` up to here hold no newline
    scanned: usize,
    max_line: usize,
    /// Bytes of the current oversized line already dropped from the buffer
    dropped: usize,
    head: Vec<u8>,
    /// Bytes still to discard before framing (server ignored a range request)
    skip: u64,
    finished: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            start: 0,
            scanned: 0,
            max_line: max_line.max(1),
            dropped: 0,
            head: Vec::new(),
            skip: 0,
            finished: false,
        }
    }

    /// Discard the next `bytes` pushed bytes
    pub fn skip_bytes(&mut self, bytes: u64) {
        self.skip = bytes;
    }

    /// Append raw data from the stream
    pub fn push(&mut self, mut chunk: &[u8]) {
        if self.skip > 0 {
            let dropped = (self.skip as usize).min(chunk.len());
            chunk = &chunk[dropped..];
            self.skip -= dropped as u64;
        }

        // Compact once the consumed prefix dominates the buffer
        if self.start > 0 && self.start >= self.buffer.len() / 2 {
            self.buffer.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete line, if the buffer holds one
    pub fn next_line(&mut self) -> Option<FramedLine<'_>> {
        let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buffer.len();
            self.drop_if_oversized();
            return None;
        };

        let begin = self.start;
        let newline = self.scanned + offset;
        self.start = newline + 1;
        self.scanned = self.start;
        Some(self.emit(begin, newline, newline + 1 - begin))
    }

    /// End of stream: the unterminated tail, if non-empty, as a final line
    pub fn finish(&mut self) -> Option<FramedLine<'_>> {
        if self.finished || (self.start >= self.buffer.len() && self.dropped == 0) {
            self.finished = true;
            return None;
        }
        self.finished = true;

        let begin = self.start;
        let end = self.buffer.len();
        self.start = end;
        self.scanned = end;
        Some(self.emit(begin, end, end - begin))
    }

    /// Line `buffer[begin..end]` plus any bytes already dropped from it
    fn emit(&mut self, begin: usize, end: usize, consumed: usize) -> FramedLine<'_> {
        let dropped = std::mem::take(&mut self.dropped);
        let mut line = &self.buffer[begin..end];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }

        if dropped > 0 {
            return FramedLine {
                bytes: &self.head,
                consumed: dropped + consumed,
                oversized: true,
            };
        }
        if line.len() > self.max_line {
            return FramedLine {
                bytes: &line[..OVERSIZED_HEAD.min(line.len())],
                consumed,
                oversized: true,
            };
        }
        FramedLine {
            bytes: line,
            consumed,
            oversized: false,
        }
    }

    /// Release the unterminated tail once it outgrows the cap, keeping its head
    fn drop_if_oversized(&mut self) {
        let pending = self.buffer.len() - self.start;
        if pending <= self.max_line {
            return;
        }
        if self.dropped == 0 {
            let head = OVERSIZED_HEAD.min(pending);
            self.head = self.buffer[self.start..self.start + head].to_vec();
        }
        self.dropped += pending;
        self.buffer.clear();
        self.start = 0;
        self.scanned = 0;
    }

    /// Bytes buffered but not yet emitted as a line
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.buffer.len() - self.start
    }
}

/// UTF-8 when valid, ISO-8859-1 otherwise
pub fn decode_line(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

//! Line Framer
//!
//! Reassembles notification chunks into newline-delimited lines and decodes
//! each one. Chunk boundaries are MTU artifacts and carry no meaning.

use crate::domain::models::DecodedMessage;
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::protocol;
use std::collections::VecDeque;
use tracing::warn;

/// Bytes discarded from an unterminated line. `offset` is where the line
/// started in the buffer, so it is reported after every line before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Overflow {
    offset: usize,
    dropped: usize,
}

#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_bytes: Option<usize>,
    overflows: VecDeque<Overflow>,
}

impl LineFramer {
    /// `max_line_bytes` bounds the pending buffer; `None` leaves it unbounded.
    pub fn new(max_line_bytes: Option<usize>) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
            overflows: VecDeque::new(),
        }
    }

    /// Append a chunk and iterate over the lines it completes.
    ///
    /// Lines not pulled from the iterator stay buffered for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.push(chunk);
        Frames { framer: self }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        if let Some(limit) = self.max_line_bytes {
            // Only the unterminated tail counts against the cap.
            let tail = match self.buffer.iter().rposition(|&b| b == b'\n') {
                Some(pos) => self.buffer.len() - pos - 1,
                None => self.buffer.len(),
            };
            if tail > limit {
                let keep = self.buffer.len() - tail;
                self.buffer.truncate(keep);
                match self.overflows.back_mut() {
                    Some(last) if last.offset == keep => last.dropped += tail,
                    _ => self.overflows.push_back(Overflow {
                        offset: keep,
                        dropped: tail,
                    }),
                }
                warn!("Discarding {} unterminated bytes (limit {})", tail, limit);
            }
        }
    }

    /// Next complete, trimmed, non-empty line. Overflows are skipped.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            if let Ok(line) = self.next_checked()? {
                return Some(line);
            }
        }
    }

    /// Bytes received after the last line terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflows.clear();
    }

    /// Next line or overflow, in arrival order.
    fn next_checked(&mut self) -> Option<Result<String, ProtocolError>> {
        loop {
            if self.overflows.front().is_some_and(|o| o.offset == 0) {
                let overflow = self.overflows.pop_front()?;
                return Some(Err(ProtocolError::LineTooLong {
                    limit: self.max_line_bytes.unwrap_or(0),
                    dropped: overflow.dropped,
                }));
            }
            let line = self.take_line()?;
            if !line.is_empty() {
                return Some(Ok(line));
            }
        }
    }

    /// Drain through the next terminator, possibly yielding an empty line.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        for overflow in self.overflows.iter_mut() {
            overflow.offset = overflow.offset.saturating_sub(raw.len());
        }
        let text = String::from_utf8_lossy(&raw);
        Some(text.trim_end_matches('\n').trim_end_matches('\r').trim().to_string())
    }
}

/// Lazy iterator returned by [`LineFramer::feed`].
pub struct Frames<'a> {
    framer: &'a mut LineFramer,
}

impl Frames<'_> {
    /// Like [`Iterator::next`] but keeps the raw line next to its decoding.
    pub fn next_with_line(&mut self) -> Option<Result<(String, DecodedMessage), ProtocolError>> {
        self.framer.next_checked().map(|line| {
            line.and_then(|line| protocol::decode_line(&line).map(|message| (line, message)))
        })
    }
}

impl Iterator for Frames<'_> {
    type Item = Result<DecodedMessage, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with_line().map(|frame| frame.map(|(_, message)| message))
    }
}

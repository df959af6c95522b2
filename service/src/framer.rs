//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//


//! Newline framing for the inbound byte stream
//!
//! [`LineFramer`] accumulates whatever bytes a read produced and hands back
//! the complete lines currently buffered. Bytes are appended at the tail and
//! consumed from the head, so a line split across several reads is decoded
//! exactly once, after its terminating newline arrives.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Bytes requested from the socket per underlying read
pub const READ_CHUNK_SIZE: usize = 1024;

/// Default bound on the length of a single line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Incremental newline-delimited UTF-8 decoder
#[derive(Debug, Clone)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line_length: usize,
    /// Prefix of `buffer` already known to contain no newline
    scanned: usize,
    /// Dropping the rest of an oversized line up to its newline
    discarding: bool,
    discarded: u64,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    /// Create a framer with the default line length bound
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a framer that discards lines longer than `max_line_length`
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_line_length,
            scanned: 0,
            discarding: false,
            discarded: 0,
        }
    }

    /// Append freshly read bytes and iterate the lines they complete
    ///
    /// The returned iterator is lazy: lines are removed from the buffer only
    /// as they are yielded. Dropping it early leaves the remaining lines
    /// buffered for the next call to [`LineFramer::feed`] or
    /// [`LineFramer::lines`].
    pub fn feed(&mut self, bytes: &[u8]) -> Lines<'_> {
        self.buffer.extend_from_slice(bytes);
        Lines { framer: self }
    }

    /// Iterate lines already buffered without adding new bytes
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { framer: self }
    }

    /// Number of bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Check whether any undecoded bytes remain
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Return and reset the count of oversized lines dropped
    pub fn take_discarded(&mut self) -> u64 {
        std::mem::take(&mut self.discarded)
    }

    fn discard(&mut self, length: usize) {
        warn!(
            length,
            limit = self.max_line_length,
            "Discarding oversized line"
        );
        self.discarded += 1;
    }

    fn next_line(&mut self) -> Option<String> {
        loop {
            match self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
                Some(offset) => {
                    let end = self.scanned + offset;
                    let raw = self.buffer.split_to(end + 1);
                    self.scanned = 0;
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if end > self.max_line_length {
                        self.discard(end);
                        continue;
                    }
                    return Some(decode_line(&raw[..end]));
                }
                None => {
                    self.scanned = self.buffer.len();
                    if self.buffer.len() > self.max_line_length {
                        if !self.discarding {
                            self.discard(self.buffer.len());
                            self.discarding = true;
                        }
                        self.buffer.clear();
                        self.scanned = 0;
                    }
                    return None;
                }
            }
        }
    }
}

/// Decode one line body, tolerating CRLF terminators and invalid UTF-8
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Lazy iterator over the complete lines held by a [`LineFramer`]
#[derive(Debug)]
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_line()
    }
}

impl Decoder for LineFramer {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.has_remaining() {
            let chunk = src.split();
            self.buffer.extend_from_slice(&chunk);
        }
        Ok(self.next_line())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if self.buffer.is_empty() || self.discarding {
            self.buffer.clear();
            self.discarding = false;
            return Ok(None);
        }
        let rest = self.buffer.split();
        self.scanned = 0;
        Ok(Some(decode_line(&rest)))
    }
}

impl Encoder<String> for LineFramer {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

//! Incremental decoder for HTTP chunked transfer coding.
//!
//! The decoder is byte-driven: framing boundaries may fall anywhere inside the
//! fragments handed to [`ChunkedDecoder::feed`], including one byte at a time.

use crate::error::{ProbeError, Result};
use crate::verify::ContentDigests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Init,
    ReadingLength,
    SkippingLengthCRLF,
    ReadingData,
    SkippingTrailingCRLF,
    Done,
    Malformed,
}

/// Result of feeding a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    NeedMore,
    Done,
}

#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkState,
    remaining: u64,
    size_digits: usize,
    in_extension: bool,
    output: Vec<u8>,
    limit: usize,
    truncated: bool,
    digests: Option<ContentDigests>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Decoded bytes past `limit` are dropped, but framing is still tracked.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: ChunkState::Init,
            remaining: 0,
            size_digits: 0,
            in_extension: false,
            output: Vec::new(),
            limit,
            truncated: false,
            digests: None,
        }
    }

    /// Hash every decoded byte, including those past the limit.
    pub fn with_digests(mut self, digests: ContentDigests) -> Self {
        self.digests = Some(digests);
        self
    }

    pub fn digests(&self) -> Option<&ContentDigests> {
        self.digests.as_ref()
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn into_output(self) -> Vec<u8> {
        self.output
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Consume a fragment of the encoded body.
    ///
    /// Returns `NeedMore` until the terminating zero-size chunk has been seen.
    /// Bytes after that (trailers) are ignored.
    pub fn feed(&mut self, input: &[u8]) -> Result<DecodeStatus> {
        let mut pos = 0;
        while pos < input.len() {
            let b = input[pos];
            match self.state {
                ChunkState::Init => {
                    self.reset_length();
                    self.state = ChunkState::ReadingLength;
                }
                ChunkState::ReadingLength => {
                    if b == b'\r' || b == b'\n' {
                        if self.size_digits == 0 {
                            return self.fail("empty chunk size");
                        }
                        self.state = ChunkState::SkippingLengthCRLF;
                        continue;
                    }
                    if self.in_extension {
                        pos += 1;
                        continue;
                    }
                    match hex_value(b) {
                        Some(v) => {
                            self.remaining = match self
                                .remaining
                                .checked_mul(16)
                                .and_then(|r| r.checked_add(u64::from(v)))
                            {
                                Some(r) => r,
                                None => return self.fail("chunk size overflow"),
                            };
                            self.size_digits += 1;
                        }
                        None if (b == b';' || b == b' ' || b == b'\t') && self.size_digits > 0 => {
                            self.in_extension = true;
                        }
                        None => return self.fail(format!("invalid chunk size byte 0x{b:02x}")),
                    }
                    pos += 1;
                }
                ChunkState::SkippingLengthCRLF => match b {
                    b'\r' => pos += 1,
                    b'\n' => {
                        pos += 1;
                        self.state = if self.remaining == 0 {
                            ChunkState::Done
                        } else {
                            ChunkState::ReadingData
                        };
                    }
                    _ => return self.fail("missing line feed after chunk size"),
                },
                ChunkState::ReadingData => {
                    let avail = input.len() - pos;
                    let take = usize::try_from(self.remaining).map_or(avail, |r| r.min(avail));
                    self.push_output(&input[pos..pos + take]);
                    self.remaining -= take as u64;
                    pos += take;
                    if self.remaining == 0 {
                        self.state = ChunkState::SkippingTrailingCRLF;
                    }
                }
                ChunkState::SkippingTrailingCRLF => match b {
                    b'\r' => pos += 1,
                    b'\n' => {
                        pos += 1;
                        self.reset_length();
                        self.state = ChunkState::ReadingLength;
                    }
                    _ => return self.fail("missing CRLF after chunk data"),
                },
                ChunkState::Done => return Ok(DecodeStatus::Done),
                ChunkState::Malformed => return self.fail("decoder already failed"),
            }
        }

        match self.state {
            ChunkState::Done => Ok(DecodeStatus::Done),
            ChunkState::Malformed => self.fail("decoder already failed"),
            _ => Ok(DecodeStatus::NeedMore),
        }
    }

    /// Signal end of input. Anything short of a completed body is malformed.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            ChunkState::Done => Ok(()),
            _ => {
                self.state = ChunkState::Malformed;
                Err(ProbeError::malformed("premature end of chunked body"))
            }
        }
    }

    fn reset_length(&mut self) {
        self.remaining = 0;
        self.size_digits = 0;
        self.in_extension = false;
    }

    fn push_output(&mut self, data: &[u8]) {
        if let Some(digests) = self.digests.as_mut() {
            digests.update(data);
        }
        let room = self.limit.saturating_sub(self.output.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.output.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn fail<T>(&mut self, reason: impl Into<String>) -> Result<T> {
        self.state = ChunkState::Malformed;
        Err(ProbeError::malformed(reason))
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"4\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";

    #[test]
    fn decodes_whole_body() {
        let mut d = ChunkedDecoder::new();
        assert_eq!(d.feed(BODY).unwrap(), DecodeStatus::Done);
        assert_eq!(d.output(), b"Wikipedia in\r\n\r\nchunks.");
        assert!(d.finish().is_ok());
    }

    #[test]
    fn decodes_byte_at_a_time() {
        let mut d = ChunkedDecoder::new();
        let mut last = DecodeStatus::NeedMore;
        for b in BODY {
            last = d.feed(std::slice::from_ref(b)).unwrap();
        }
        assert_eq!(last, DecodeStatus::Done);
        assert_eq!(d.output(), b"Wikipedia in\r\n\r\nchunks.");
    }

    #[test]
    fn accepts_extensions_and_bare_lf() {
        let mut d = ChunkedDecoder::new();
        let status = d.feed(b"3;name=val\nabc\n0\n\n").unwrap();
        assert_eq!(status, DecodeStatus::Done);
        assert_eq!(d.output(), b"abc");
    }

    #[test]
    fn ignores_trailers_after_last_chunk() {
        let mut d = ChunkedDecoder::new();
        d.feed(b"2\r\nok\r\n0\r\nX-Trailer: 1\r\n\r\n").unwrap();
        assert!(d.is_done());
        assert_eq!(d.output(), b"ok");
    }

    #[test]
    fn non_hex_size_is_malformed() {
        let mut d = ChunkedDecoder::new();
        assert!(d.feed(b"zz\r\n").is_err());
        assert_eq!(d.state(), ChunkState::Malformed);
        assert!(d.feed(b"0\r\n\r\n").is_err());
    }

    #[test]
    fn missing_crlf_after_data_is_malformed() {
        let mut d = ChunkedDecoder::new();
        assert!(d.feed(b"2\r\nabX").is_err());
    }

    #[test]
    fn premature_eof_is_malformed() {
        let mut d = ChunkedDecoder::new();
        assert_eq!(d.feed(b"a\r\nhello").unwrap(), DecodeStatus::NeedMore);
        assert!(d.finish().is_err());
        assert_eq!(d.state(), ChunkState::Malformed);
    }

    #[test]
    fn limit_truncates_but_keeps_framing() {
        let mut d = ChunkedDecoder::with_limit(5);
        assert_eq!(d.feed(BODY).unwrap(), DecodeStatus::Done);
        assert_eq!(d.output(), b"Wikip");
        assert!(d.truncated());
    }

    #[test]
    fn huge_size_overflows_cleanly() {
        let mut d = ChunkedDecoder::new();
        assert!(d.feed(b"fffffffffffffffff\r\n").is_err());
    }
}

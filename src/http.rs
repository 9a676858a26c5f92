//! HTTP/1.x response framing for probe dialogs.
//!
//! Inbound bytes are split into a header block and a body. The body is framed
//! by chunked transfer coding, `Content-Length`, or connection close.

use crate::chunked::{ChunkedDecoder, DecodeStatus};
use crate::error::{ProbeError, Result};
use crate::verify::ContentDigests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProgress {
    NeedMore,
    Complete,
}

#[derive(Debug)]
enum BodyFraming {
    Chunked(ChunkedDecoder),
    Length(u64),
    UntilClose,
    Empty,
}

#[derive(Debug)]
pub struct HttpResponseReader {
    headers: Vec<u8>,
    headers_done: bool,
    status: Option<u16>,
    content_type: Option<String>,
    framing: Option<BodyFraming>,
    body: Vec<u8>,
    body_limit: usize,
    header_limit: usize,
    truncated: bool,
    complete: bool,
    digests: ContentDigests,
}

impl HttpResponseReader {
    pub fn new(header_limit: usize, body_limit: usize) -> Self {
        Self {
            headers: Vec::new(),
            headers_done: false,
            status: None,
            content_type: None,
            framing: None,
            body: Vec::new(),
            body_limit,
            header_limit,
            truncated: false,
            complete: false,
            digests: ContentDigests::new(),
        }
    }

    pub fn with_digests(mut self, digests: ContentDigests) -> Self {
        self.digests = digests;
        self
    }

    /// Running digests over the whole decoded body, truncated or not.
    pub fn digests(&self) -> &ContentDigests {
        match &self.framing {
            Some(BodyFraming::Chunked(d)) => d.digests().unwrap_or(&self.digests),
            _ => &self.digests,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Raw status line and headers of the final (non-100) response.
    pub fn header_bytes(&self) -> &[u8] {
        &self.headers
    }

    pub fn headers_complete(&self) -> bool {
        self.headers_done
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The body length is only known from connection close.
    pub fn close_delimited(&self) -> bool {
        matches!(self.framing, Some(BodyFraming::UntilClose))
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Decoded body.
    pub fn body(&self) -> &[u8] {
        match &self.framing {
            Some(BodyFraming::Chunked(d)) => d.output(),
            _ => &self.body,
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<HttpProgress> {
        if self.complete {
            return Ok(HttpProgress::Complete);
        }
        if self.headers_done {
            return self.feed_body(data);
        }

        self.headers.extend_from_slice(data);
        loop {
            let end = match find_header_end(&self.headers) {
                Some(end) => end,
                None => {
                    if self.headers.len() > self.header_limit {
                        return Err(ProbeError::malformed(format!(
                            "response headers exceed {} bytes",
                            self.header_limit
                        )));
                    }
                    return Ok(HttpProgress::NeedMore);
                }
            };

            let rest = self.headers.split_off(end);
            let status = parse_status(&self.headers)?;
            if status == 100 {
                // interim response, headers start over
                self.headers = rest;
                continue;
            }

            self.status = Some(status);
            self.headers_done = true;
            self.content_type = header_value(&self.headers, "content-type");
            self.framing = Some(self.select_framing(status)?);
            if matches!(self.framing, Some(BodyFraming::Empty) | Some(BodyFraming::Length(0))) {
                self.complete = true;
                return Ok(HttpProgress::Complete);
            }
            return self.feed_body(&rest);
        }
    }

    /// Peer closed the connection.
    pub fn finish(&mut self) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        match &mut self.framing {
            None => Err(ProbeError::malformed("connection closed before response headers")),
            Some(BodyFraming::UntilClose) | Some(BodyFraming::Empty) => {
                self.complete = true;
                Ok(())
            }
            Some(BodyFraming::Chunked(d)) => d.finish(),
            Some(BodyFraming::Length(left)) => Err(ProbeError::malformed(format!(
                "connection closed with {left} body bytes outstanding"
            ))),
        }
    }

    fn select_framing(&self, status: u16) -> Result<BodyFraming> {
        if (100..200).contains(&status) || status == 204 || status == 304 {
            return Ok(BodyFraming::Empty);
        }
        if let Some(te) = header_value(&self.headers, "transfer-encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                return Ok(BodyFraming::Chunked(
                    ChunkedDecoder::with_limit(self.body_limit).with_digests(self.digests.clone()),
                ));
            }
        }
        match header_value(&self.headers, "content-length") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(BodyFraming::Length)
                .map_err(|_| ProbeError::malformed(format!("bad Content-Length: {v}"))),
            None => Ok(BodyFraming::UntilClose),
        }
    }

    fn feed_body(&mut self, data: &[u8]) -> Result<HttpProgress> {
        let limit = self.body_limit;
        let done = match self.framing.as_mut() {
            Some(BodyFraming::Chunked(d)) => {
                let status = d.feed(data)?;
                self.truncated = d.truncated();
                status == DecodeStatus::Done
            }
            Some(BodyFraming::Length(left)) => {
                let take = usize::try_from(*left).map_or(data.len(), |l| l.min(data.len()));
                *left -= take as u64;
                self.digests.update(&data[..take]);
                store(&mut self.body, &mut self.truncated, &data[..take], limit);
                *left == 0
            }
            Some(BodyFraming::UntilClose) => {
                self.digests.update(data);
                store(&mut self.body, &mut self.truncated, data, limit);
                false
            }
            Some(BodyFraming::Empty) => true,
            None => false,
        };
        if done {
            self.complete = true;
            Ok(HttpProgress::Complete)
        } else {
            Ok(HttpProgress::NeedMore)
        }
    }
}

fn store(body: &mut Vec<u8>, truncated: &mut bool, data: &[u8], limit: usize) {
    let room = limit.saturating_sub(body.len());
    if data.len() > room {
        *truncated = true;
    }
    body.extend_from_slice(&data[..data.len().min(room)]);
}

/// Offset just past the blank line ending the header block. Bare `\n\n` is
/// accepted as well as `\r\n\r\n`.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn parse_status(headers: &[u8]) -> Result<u16> {
    let line_end = headers.iter().position(|&b| b == b'\n').unwrap_or(headers.len());
    let line = String::from_utf8_lossy(&headers[..line_end]);
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(ProbeError::malformed(format!("not an HTTP status line: {}", line.trim())));
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProbeError::malformed(format!("bad HTTP status line: {}", line.trim())))
}

/// First value of header `name` (case-insensitive).
pub fn header_value(headers: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(headers);
    text.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader() -> HttpResponseReader {
        HttpResponseReader::new(8192, 1 << 20)
    }

    #[test]
    fn content_length_body() {
        let mut r = reader();
        assert_eq!(r.feed(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Le").unwrap(), HttpProgress::NeedMore);
        assert_eq!(r.feed(b"ngth: 5\r\n\r\nhel").unwrap(), HttpProgress::NeedMore);
        assert_eq!(r.feed(b"lo").unwrap(), HttpProgress::Complete);
        assert_eq!(r.status(), Some(200));
        assert_eq!(r.content_type(), Some("text/plain"));
        assert_eq!(r.body(), b"hello");
    }

    #[test]
    fn skips_100_continue() {
        let mut r = reader();
        let resp = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
        assert_eq!(r.feed(resp).unwrap(), HttpProgress::Complete);
        assert_eq!(r.status(), Some(201));
        assert_eq!(r.body(), b"ok");
    }

    #[test]
    fn chunked_body_across_reads() {
        let mut r = reader();
        r.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nab").unwrap();
        assert!(!r.is_complete());
        assert_eq!(r.feed(b"c\r\n0\r\n\r\n").unwrap(), HttpProgress::Complete);
        assert_eq!(r.body(), b"abc");
    }

    #[test]
    fn close_delimited_body_completes_on_finish() {
        let mut r = reader();
        r.feed(b"HTTP/1.0 200 OK\n\nsome body").unwrap();
        assert!(r.close_delimited());
        r.finish().unwrap();
        assert!(r.is_complete());
        assert_eq!(r.body(), b"some body");
    }

    #[test]
    fn short_body_at_eof_is_malformed() {
        let mut r = reader();
        r.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").unwrap();
        assert!(r.finish().is_err());
    }

    #[test]
    fn no_body_statuses_complete_at_headers() {
        let mut r = reader();
        assert_eq!(r.feed(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 99\r\n\r\n").unwrap(), HttpProgress::Complete);
    }

    #[test]
    fn digests_cover_the_whole_body_past_the_limit() {
        use crate::verify::{compute_digest, DigestAlgorithm};

        let body = b"0123456789abcdefghijklmnopqrstuvwxyz";
        let mut r = HttpResponseReader::new(8192, 16);
        r.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 36\r\n\r\n").unwrap();
        r.feed(&body[..20]).unwrap();
        assert_eq!(r.feed(&body[20..]).unwrap(), HttpProgress::Complete);
        assert!(r.truncated());
        assert_eq!(r.body(), &body[..16]);
        assert_eq!(r.digests().total_bytes(), 36);
        assert_eq!(r.digests().digest(DigestAlgorithm::Sha256), Some(compute_digest(DigestAlgorithm::Sha256, body)));

        let mut r = HttpResponseReader::new(8192, 4);
        r.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .unwrap();
        assert_eq!(r.body(), b"hell");
        assert_eq!(
            r.digests().digest(DigestAlgorithm::Sha256),
            Some(compute_digest(DigestAlgorithm::Sha256, b"hello world"))
        );
    }

    #[test]
    fn rejects_non_http_and_oversized_headers() {
        assert!(reader().feed(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        let mut r = HttpResponseReader::new(16, 1024);
        assert!(r.feed(b"HTTP/1.1 200 OK\r\nX-Long: aaaaaaaaaaaaaaaa").is_err());
    }
}

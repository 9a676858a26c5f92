//! Protocol dialog scripts: the ordered send/expect/read/close/starttls steps
//! run against one connection.

use regex::bytes::Regex;
use serde::Deserialize;
use std::fmt;

use crate::error::{ProbeError, Result};

/// How an `Expect` step judges the bytes received so far.
#[derive(Debug, Clone)]
pub enum ExpectPattern {
    /// Case-insensitive leading-substring match.
    Prefix(Vec<u8>),
    /// Regular-expression search anywhere in the received bytes.
    Regex(Regex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectMatch {
    Matched,
    /// Not decided yet, keep reading.
    Partial,
    Mismatch,
}

impl ExpectPattern {
    pub fn regex(re: &str) -> Result<Self> {
        Regex::new(re)
            .map(ExpectPattern::Regex)
            .map_err(|e| ProbeError::invalid_dialog(format!("bad expect regex: {e}")))
    }

    pub fn check(&self, received: &[u8]) -> ExpectMatch {
        match self {
            ExpectPattern::Prefix(want) => {
                let n = received.len().min(want.len());
                if !received[..n].eq_ignore_ascii_case(&want[..n]) {
                    ExpectMatch::Mismatch
                } else if n < want.len() {
                    ExpectMatch::Partial
                } else {
                    ExpectMatch::Matched
                }
            }
            ExpectPattern::Regex(re) if re.is_match(received) => ExpectMatch::Matched,
            ExpectPattern::Regex(_) => ExpectMatch::Partial,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DialogStep {
    Send(Vec<u8>),
    Expect(ExpectPattern),
    ReadUntilIdle,
    Close,
    StartTls,
}

impl fmt::Display for DialogStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogStep::Send(data) => write!(f, "send:\"{}\"", escape_payload(data)),
            DialogStep::Expect(ExpectPattern::Prefix(p)) => write!(f, "expect:\"{}\"", escape_payload(p)),
            DialogStep::Expect(ExpectPattern::Regex(re)) => write!(f, "expect-re:\"{}\"", re.as_str()),
            DialogStep::ReadUntilIdle => f.write_str("read"),
            DialogStep::Close => f.write_str("close"),
            DialogStep::StartTls => f.write_str("starttls"),
        }
    }
}

/// Ordered steps executed strictly in sequence for one connection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "Vec<String>")]
pub struct DialogScript {
    steps: Vec<DialogStep>,
}

impl DialogScript {
    pub fn new(steps: Vec<DialogStep>) -> Self {
        Self { steps }
    }

    /// Script that only checks the port accepts a connection.
    pub fn connect_only() -> Self {
        Self::new(vec![DialogStep::Close])
    }

    /// Parse one directive per line, e.g. `send:"quit\r\n"` or `expect:"220"`.
    pub fn parse_directives<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut steps = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            steps.push(parse_directive(line)?);
        }
        Ok(Self { steps })
    }

    /// A GET request followed by reading the full response. `port` is put in
    /// the Host header when it is not the scheme's default.
    pub fn http_get(host: &str, port: Option<u16>, path: &str) -> Self {
        let path = if path.is_empty() { "/" } else { path };
        let host = host_header(host, port);
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: svcprobe/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            env!("CARGO_PKG_VERSION")
        );
        Self::new(vec![
            DialogStep::Send(request.into_bytes()),
            DialogStep::ReadUntilIdle,
            DialogStep::Close,
        ])
    }

    pub fn steps(&self) -> &[DialogStep] {
        &self.steps
    }

    pub fn get(&self, idx: usize) -> Option<&DialogStep> {
        self.steps.get(idx)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl TryFrom<Vec<String>> for DialogScript {
    type Error = ProbeError;

    fn try_from(lines: Vec<String>) -> Result<Self> {
        Self::parse_directives(lines)
    }
}

/// Parse a single dialog directive.
pub fn parse_directive(line: &str) -> Result<DialogStep> {
    if let Some(p) = payload_of(line, "expect-re") {
        return Ok(DialogStep::Expect(ExpectPattern::regex(unquote(p))?));
    }
    if let Some(p) = payload_of(line, "send") {
        let data = decode_escapes(p)?;
        if data.is_empty() {
            return Err(ProbeError::invalid_dialog("empty send payload"));
        }
        return Ok(DialogStep::Send(data));
    }
    if let Some(p) = payload_of(line, "expect") {
        let data = decode_escapes(p)?;
        if data.is_empty() {
            return Err(ProbeError::invalid_dialog("empty expect payload"));
        }
        return Ok(DialogStep::Expect(ExpectPattern::Prefix(data)));
    }
    match line.to_ascii_lowercase().as_str() {
        "read" | "readall" => Ok(DialogStep::ReadUntilIdle),
        "close" => Ok(DialogStep::Close),
        "starttls" => Ok(DialogStep::StartTls),
        _ => Err(ProbeError::invalid_dialog(format!("unknown directive: {line}"))),
    }
}

/// Payload following `keyword`, separated by `:` or whitespace.
fn payload_of<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let head = line.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &line[keyword.len()..];
    match rest.strip_prefix(':') {
        Some(r) => Some(r),
        None if rest.starts_with([' ', '\t']) => Some(rest),
        None => None,
    }
}

/// Regex payloads keep their backslashes; only surrounding quotes go.
fn unquote(raw: &str) -> &str {
    let s = raw.trim();
    s.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(s)
}

/// `host[:port]` for a Host header, with IPv6 literals bracketed.
pub fn host_header(host: &str, port: Option<u16>) -> String {
    let host = match host.parse::<std::net::Ipv6Addr>() {
        Ok(_) => format!("[{host}]"),
        Err(_) => host.to_string(),
    };
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

/// Decode an escape-coded payload, optionally wrapped in double quotes.
///
/// Supported escapes: `\r`, `\n`, `\t`, `\\`, `\"` and `\xH` / `\xHH`.
pub fn decode_escapes(raw: &str) -> Result<Vec<u8>> {
    let s = raw.trim();
    let (body, quoted) = match s.strip_prefix('"') {
        Some(rest) => (rest, true),
        None => (s, false),
    };

    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.bytes().peekable();
    let mut closed = false;
    while let Some(b) = bytes.next() {
        match b {
            b'"' if quoted => {
                closed = true;
                break;
            }
            b'\\' => {
                let esc = bytes
                    .next()
                    .ok_or_else(|| ProbeError::invalid_dialog("dangling escape at end of payload"))?;
                match esc {
                    b'r' => out.push(b'\r'),
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'\\' => out.push(b'\\'),
                    b'"' => out.push(b'"'),
                    b'x' => {
                        let mut value: u8 = 0;
                        let mut digits = 0;
                        while digits < 2 {
                            match bytes.peek().and_then(|c| (*c as char).to_digit(16)) {
                                Some(v) => {
                                    value = value * 16 + v as u8;
                                    digits += 1;
                                    bytes.next();
                                }
                                None => break,
                            }
                        }
                        if digits == 0 {
                            return Err(ProbeError::invalid_dialog(format!("invalid hex escape in {raw}")));
                        }
                        out.push(value);
                    }
                    other => {
                        return Err(ProbeError::invalid_dialog(format!(
                            "unknown escape \\{} in {raw}",
                            other as char
                        )))
                    }
                }
            }
            _ => out.push(b),
        }
    }

    if quoted {
        if !closed {
            return Err(ProbeError::invalid_dialog(format!("unterminated quote in {raw}")));
        }
        if bytes.any(|b| !b.is_ascii_whitespace()) {
            return Err(ProbeError::invalid_dialog(format!("trailing data after quote in {raw}")));
        }
    }
    Ok(out)
}

/// Printable rendering of raw protocol bytes: control characters become
/// `\r`, `\n`, `\t` or `\xHH`.
pub fn escape_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02X}")),
        }
    }
    out
}

fn escape_payload(data: &[u8]) -> String {
    escape_bytes(data).replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_quoted_payload_with_escapes() {
        assert_eq!(decode_escapes(r#""quit\r\n""#).unwrap(), b"quit\r\n");
        assert_eq!(decode_escapes(r#"RFB 000.000\n"#).unwrap(), b"RFB 000.000\n");
        assert_eq!(decode_escapes(r#""\x00\xff\x7""#).unwrap(), vec![0x00, 0xff, 0x07]);
        assert_eq!(decode_escapes(r#""say \"hi\"""#).unwrap(), b"say \"hi\"");
    }

    #[test]
    fn rejects_bad_escapes() {
        assert!(decode_escapes(r#""\q""#).is_err());
        assert!(decode_escapes(r#""\xzz""#).is_err());
        assert!(decode_escapes(r#""open"#).is_err());
        assert!(decode_escapes(r#""a" b"#).is_err());
    }

    #[test]
    fn parses_directives_in_order() {
        let script = DialogScript::parse_directives([
            r#"expect:"220""#,
            r#"send:"EHLO probe\r\n""#,
            "expect-re: \"^250[ -]\"",
            "STARTTLS",
            "read",
            "close",
        ])
        .unwrap();
        assert_eq!(script.len(), 6);
        assert!(matches!(script.get(0), Some(DialogStep::Expect(ExpectPattern::Prefix(p))) if p == b"220"));
        assert!(matches!(script.get(1), Some(DialogStep::Send(d)) if d == b"EHLO probe\r\n"));
        assert!(matches!(script.get(2), Some(DialogStep::Expect(ExpectPattern::Regex(_)))));
        assert!(matches!(script.get(3), Some(DialogStep::StartTls)));
        assert!(matches!(script.get(4), Some(DialogStep::ReadUntilIdle)));
        assert!(matches!(script.get(5), Some(DialogStep::Close)));
    }

    #[test]
    fn legacy_space_separated_form() {
        let step = parse_directive(r#"send "quit\r\n""#).unwrap();
        assert!(matches!(step, DialogStep::Send(d) if d == b"quit\r\n"));
        assert!(parse_directive("sendfoo").is_err());
        assert!(parse_directive(r#"send:"""#).is_err());
    }

    #[test]
    fn prefix_expect_is_incremental_and_case_insensitive() {
        let p = ExpectPattern::Prefix(b"* OK".to_vec());
        assert_eq!(p.check(b""), ExpectMatch::Partial);
        assert_eq!(p.check(b"* o"), ExpectMatch::Partial);
        assert_eq!(p.check(b"* ok IMAP4rev1 ready"), ExpectMatch::Matched);
        assert_eq!(p.check(b"* BYE"), ExpectMatch::Mismatch);
    }

    #[test]
    fn regex_expect_keeps_reading_until_match() {
        let p = ExpectPattern::regex(r"^SSH-\d\.\d").unwrap();
        assert_eq!(p.check(b"SSH-"), ExpectMatch::Partial);
        assert_eq!(p.check(b"SSH-2.0-OpenSSH"), ExpectMatch::Matched);
    }

    #[test]
    fn display_round_trips_through_parser() {
        let step = DialogStep::Send(b"PING\r\n".to_vec());
        let again = parse_directive(&step.to_string()).unwrap();
        assert!(matches!(again, DialogStep::Send(d) if d == b"PING\r\n"));
    }

    #[test]
    fn escape_bytes_renders_controls() {
        assert_eq!(escape_bytes(b"220 ok\r\n\x01"), "220 ok\\r\\n\\x01");
    }

    #[test]
    fn host_header_brackets_ipv6_and_adds_explicit_port() {
        assert_eq!(host_header("www.example.com", None), "www.example.com");
        assert_eq!(host_header("www.example.com", Some(8080)), "www.example.com:8080");
        assert_eq!(host_header("2001:db8::1", None), "[2001:db8::1]");
        assert_eq!(host_header("::1", Some(8443)), "[::1]:8443");

        let script = DialogScript::http_get("::1", Some(8080), "/health");
        match script.get(0) {
            Some(DialogStep::Send(req)) => {
                assert!(req.starts_with(b"GET /health HTTP/1.1\r\nHost: [::1]:8080\r\n"))
            }
            other => panic!("unexpected first step: {other:?}"),
        }
    }
}

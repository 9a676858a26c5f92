//! One connection test: connect, optional TLS, the dialog script, and
//! content verification.
//!
//! The transport lives only inside [`ConnectionTest::execute`]. Whatever ends
//! the test (completion, its deadline, or run cancellation) drops that future
//! and with it the socket and any TLS session, before the result is built from
//! the counters and buffers gathered so far.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::catalog::ProtocolDefinition;
use crate::config::EngineConfig;
use crate::dialog::{escape_bytes, DialogScript, DialogStep, ExpectMatch, ExpectPattern};
use crate::error::{ProbeError, Result};
use crate::http::HttpResponseReader;
use crate::scheduler::ResultSink;
use crate::stream::ProbeStream;
use crate::telnet::TelnetNegotiator;
use crate::tls::TlsSession;
use crate::types::{now_rfc3339, CertificateInfo, Outcome, TargetDescriptor, TestPhase, TestResult};
use crate::verify::{verify, Content, ContentDigests, DigestAlgorithm, Verdict};

const READ_CHUNK: usize = 8 * 1024;

/// Buffer and timing limits shared by every test of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialogLimits {
    pub idle_window: Duration,
    pub max_read_bytes: usize,
    pub max_header_bytes: usize,
}

impl DialogLimits {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            idle_window: cfg.idle_window(),
            max_read_bytes: cfg.max_read_bytes.max(1),
            max_header_bytes: cfg.max_header_bytes.max(1),
        }
    }
}

impl Default for DialogLimits {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

enum Inbound {
    Data,
    Idle,
    Eof,
}

pub struct ConnectionTest {
    target: TargetDescriptor,
    protocol: Arc<ProtocolDefinition>,
    script: DialogScript,
    port: u16,
    started: Instant,
    deadline: Instant,
    limits: DialogLimits,
    sink: Option<Arc<dyn ResultSink>>,

    phase: TestPhase,
    step: usize,
    opened: bool,
    connect_ms: u64,
    bytes_read: u64,
    bytes_written: u64,
    /// Every clean inbound byte, capped.
    banner: Vec<u8>,
    /// Hashes of every clean inbound byte, uncapped.
    digests: ContentDigests,
    /// Bytes received since the last satisfied read step.
    received: Vec<u8>,
    telnet: Option<TelnetNegotiator>,
    http: Option<HttpResponseReader>,
    certificate: Option<CertificateInfo>,
    verdict: Option<Verdict>,
}

impl ConnectionTest {
    pub fn new(
        target: TargetDescriptor,
        protocol: Arc<ProtocolDefinition>,
        limits: DialogLimits,
        deadline: Instant,
    ) -> Self {
        let port = target.port.unwrap_or(protocol.port);
        let flags = protocol.flags;
        let script = match &target.dialog {
            Some(d) => d.clone(),
            None if flags.http && protocol.script.is_empty() => {
                let host = target.display_name();
                let explicit_port = (port != protocol.port).then_some(port);
                DialogScript::http_get(&host, explicit_port, target.http_path.as_deref().unwrap_or("/"))
            }
            None => protocol.script.clone(),
        };
        let digests = ContentDigests::for_rule(&target.content);
        Self {
            telnet: flags.telnet.then(TelnetNegotiator::new),
            http: flags.http.then(|| {
                HttpResponseReader::new(limits.max_header_bytes, limits.max_read_bytes).with_digests(digests.clone())
            }),
            target,
            protocol,
            script,
            port,
            started: Instant::now(),
            deadline,
            limits,
            sink: None,
            phase: TestPhase::Pending,
            step: 0,
            opened: false,
            connect_ms: 0,
            bytes_read: 0,
            bytes_written: 0,
            banner: Vec::new(),
            digests,
            received: Vec::new(),
            certificate: None,
            verdict: None,
        }
    }

    pub fn with_sink(mut self, sink: Option<Arc<dyn ResultSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn phase(&self) -> TestPhase {
        self.phase
    }

    /// Drive the test to completion, its deadline, or cancellation.
    pub async fn run(mut self, cancel: CancellationToken) -> TestResult {
        let deadline = self.deadline;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Timeout,
            res = self.execute() => match res {
                Ok(()) => Outcome::Ok,
                Err(e) => {
                    debug!(error = %e, "test failed");
                    e.outcome()
                }
            },
            _ = time::sleep_until(deadline) => Outcome::Timeout,
        };
        debug!(
            host = %self.target.display_name(),
            protocol = %self.protocol.name,
            step = self.step,
            %outcome,
            "test finished"
        );
        self.into_result(outcome)
    }

    /// Connect, handshake and run the dialog. Not deadline-bounded by itself.
    pub async fn execute(&mut self) -> Result<()> {
        let ip = self
            .target
            .ip
            .ok_or_else(|| ProbeError::Unresolved(self.target.display_name()))?;
        if self.port == 0 {
            return Err(ProbeError::Connect(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no port known for {}", self.protocol.name),
            )));
        }
        let flags = self.protocol.flags;
        let addr = SocketAddr::new(ip, self.port);

        self.phase = TestPhase::Connecting;
        debug!(host = %self.target.display_name(), %addr, protocol = %self.protocol.name, "connecting");
        let mut stream = ProbeStream::connect(addr, self.target.source, flags.udp)
            .await
            .map_err(ProbeError::Connect)?;
        self.connect_ms = millis(self.started.elapsed());
        self.opened = !flags.udp;

        if flags.external {
            self.close(&mut stream).await;
            self.verify_content();
            return Ok(());
        }

        if self.wants_implicit_tls() {
            stream = self.start_tls(stream).await?;
        }

        self.phase = TestPhase::InDialog;
        let mut last_was_send = false;
        let mut closed = false;
        while let Some(step) = self.script.get(self.step).cloned() {
            trace!(step = %step, index = self.step, "dialog step");
            let is_send = matches!(step, DialogStep::Send(_));
            match step {
                DialogStep::Send(data) => self.send(&mut stream, &data).await?,
                DialogStep::Expect(pattern) => self.expect(&mut stream, &pattern).await?,
                DialogStep::ReadUntilIdle => self.read_until_idle(&mut stream).await?,
                DialogStep::StartTls => stream = self.start_tls(stream).await?,
                DialogStep::Close => {
                    self.close(&mut stream).await;
                    closed = true;
                }
            }
            last_was_send = is_send;
            self.step += 1;
            if closed {
                break;
            }
        }
        if !closed {
            // the peer still owes a reply to the final send
            if last_was_send {
                self.drain(&mut stream).await?;
            }
            self.close(&mut stream).await;
        }

        self.verify_content();
        Ok(())
    }

    fn wants_implicit_tls(&self) -> bool {
        let upgrades_later = self.protocol.flags.starttls
            || self.script.steps().iter().any(|s| matches!(s, DialogStep::StartTls));
        self.protocol.flags.ssl || (self.target.tls.is_some() && !upgrades_later)
    }

    async fn start_tls(&mut self, stream: ProbeStream) -> Result<ProbeStream> {
        let tcp = match stream {
            ProbeStream::Plain(tcp) => tcp,
            ProbeStream::Tls(_) => return Err(ProbeError::tls("stream is already encrypted")),
            ProbeStream::Udp(_) => return Err(ProbeError::tls("no tls over a datagram transport")),
        };
        if self.phase < TestPhase::Handshaking {
            self.phase = TestPhase::Handshaking;
        }
        let options = self.target.tls.clone().unwrap_or_default();
        let server_name = options
            .server_name
            .clone()
            .unwrap_or_else(|| self.target.display_name());
        let session = TlsSession::establish(tcp, &server_name, &options).await?;
        let (tls, certificate) = session.into_parts();
        self.certificate = certificate;
        self.received.clear();
        Ok(ProbeStream::Tls(Box::new(tls)))
    }

    async fn send(&mut self, stream: &mut ProbeStream, data: &[u8]) -> Result<()> {
        stream.write_all(data).await?;
        stream.flush().await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn expect(&mut self, stream: &mut ProbeStream, pattern: &ExpectPattern) -> Result<()> {
        loop {
            match pattern.check(&self.received) {
                ExpectMatch::Matched => {
                    self.received.clear();
                    return Ok(());
                }
                ExpectMatch::Mismatch => {
                    return Err(ProbeError::bad_data(format!(
                        "unexpected reply \"{}\"",
                        escape_bytes(&self.received)
                    )))
                }
                ExpectMatch::Partial => {}
            }
            if self.received.len() >= self.limits.max_read_bytes {
                return Err(ProbeError::bad_data(format!(
                    "no match within {} bytes",
                    self.limits.max_read_bytes
                )));
            }
            if let Inbound::Eof = self.receive(stream, None).await? {
                return Err(ProbeError::bad_data("connection closed before the expected reply"));
            }
        }
    }

    async fn read_until_idle(&mut self, stream: &mut ProbeStream) -> Result<()> {
        loop {
            let idle = match &self.http {
                Some(h) if h.is_complete() => break,
                Some(h) if h.close_delimited() && h.truncated() => break,
                Some(h) if h.close_delimited() => Some(self.limits.idle_window),
                Some(_) => None,
                None if self.received.len() >= self.limits.max_read_bytes => break,
                None => Some(self.limits.idle_window),
            };
            match self.receive(stream, idle).await? {
                Inbound::Data => {}
                Inbound::Idle => break,
                Inbound::Eof => {
                    if let Some(http) = self.http.as_mut() {
                        http.finish()?;
                    }
                    break;
                }
            }
        }
        self.received.clear();
        Ok(())
    }

    async fn drain(&mut self, stream: &mut ProbeStream) -> Result<()> {
        while self.received.len() < self.limits.max_read_bytes {
            match self.receive(stream, Some(self.limits.idle_window)).await? {
                Inbound::Data => {}
                Inbound::Idle | Inbound::Eof => break,
            }
        }
        Ok(())
    }

    async fn close(&mut self, stream: &mut ProbeStream) {
        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "shutdown failed");
        }
    }

    /// Read one fragment, answer telnet negotiation, and record the clean bytes.
    async fn receive(&mut self, stream: &mut ProbeStream, idle: Option<Duration>) -> Result<Inbound> {
        let mut buf = [0u8; READ_CHUNK];
        let n = match idle {
            Some(window) => match time::timeout(window, stream.read(&mut buf)).await {
                Ok(r) => r?,
                Err(_) => return Ok(Inbound::Idle),
            },
            None => stream.read(&mut buf).await?,
        };
        if n == 0 {
            return Ok(Inbound::Eof);
        }
        self.bytes_read += n as u64;
        self.opened = true;

        let negotiated;
        let data: &[u8] = match self.telnet.as_mut() {
            Some(telnet) => {
                negotiated = telnet.feed(&buf[..n]);
                if !negotiated.replies.is_empty() {
                    stream.write_all(&negotiated.replies).await?;
                    self.bytes_written += negotiated.replies.len() as u64;
                }
                &negotiated.data
            }
            None => &buf[..n],
        };
        self.absorb(data)?;
        Ok(Inbound::Data)
    }

    fn absorb(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(sink) = &self.sink {
            sink.on_data(&self.target, data);
        }
        let max = self.limits.max_read_bytes;
        self.digests.update(data);
        push_capped(&mut self.banner, data, max);
        push_capped(&mut self.received, data, max);
        if let Some(http) = self.http.as_mut() {
            http.feed(data)?;
        }
        Ok(())
    }

    /// Decoded content (possibly truncated), its declared type, and the
    /// digests of the full content.
    fn content(&self) -> Content<'_> {
        match &self.http {
            Some(h) if h.headers_complete() => Content::new(h.body())
                .with_content_type(h.content_type())
                .with_digests(h.digests()),
            _ => Content::new(&self.banner).with_digests(&self.digests),
        }
    }

    fn verify_content(&mut self) {
        self.phase = TestPhase::Verifying;
        let verdict = verify(&self.content(), &self.target.content);
        if let Verdict::Fail(reason) = &verdict {
            debug!(host = %self.target.display_name(), %reason, "content check failed");
        }
        self.verdict = Some(verdict);
    }

    fn keeps_banner(&self) -> bool {
        let flags = self.protocol.flags;
        flags.banner || flags.http || self.target.dialog.is_some()
    }

    /// Build the emitted record. Consumes the test.
    pub fn into_result(mut self, outcome: Outcome) -> TestResult {
        self.phase = TestPhase::Done;

        let content_digest = self
            .content()
            .digests
            .filter(|d| d.total_bytes() > 0)
            .and_then(|d| d.digest(DigestAlgorithm::Sha256));
        let banner_bytes: &[u8] = match &self.http {
            Some(h) if h.headers_complete() => h.header_bytes(),
            _ => self.banner.as_slice(),
        };
        let banner = (self.keeps_banner() && !banner_bytes.is_empty()).then(|| render_banner(banner_bytes));
        let (http_status, content_type) = match &self.http {
            Some(h) => (h.status(), h.content_type().map(str::to_string)),
            None => (None, None),
        };
        let content_verification = match outcome {
            Outcome::Ok => self.verdict.take(),
            _ => None,
        };

        TestResult {
            target: self.target.display_name(),
            address: self.target.ip,
            port: self.port,
            protocol: if self.target.protocol.is_empty() {
                self.protocol.name.clone()
            } else {
                self.target.protocol.clone()
            },
            outcome,
            opened: self.opened,
            connect_ms: self.connect_ms,
            total_ms: millis(self.started.elapsed()),
            bytes_read: self.bytes_read,
            bytes_written: self.bytes_written,
            banner,
            certificate: self.certificate.take(),
            content_verification,
            http_status,
            content_type,
            content_digest,
            finished_at: now_rfc3339(),
        }
    }
}

fn push_capped(buf: &mut Vec<u8>, data: &[u8], max: usize) {
    let room = max.saturating_sub(buf.len());
    buf.extend_from_slice(&data[..data.len().min(room)]);
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Lossy UTF-8 with control characters escaped.
pub fn render_banner(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\x{:02X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

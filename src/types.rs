use ::time::{format_description::well_known::Rfc3339, OffsetDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use crate::dialog::DialogScript;
use crate::tls::TlsOptions;
use crate::verify::{ContentRule, Verdict};

/// Terminal classification of one probe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    #[serde(rename = "ENOERROR")]
    Ok,
    #[serde(rename = "ETIMEOUT")]
    Timeout,
    #[serde(rename = "ENOCONN")]
    NoConn,
    #[serde(rename = "EDNS")]
    Dns,
    #[serde(rename = "EIO")]
    Io,
    #[serde(rename = "ESSL")]
    Ssl,
    #[serde(rename = "EBADDATA")]
    BadData,
}

impl Outcome {
    pub fn code(&self) -> &'static str {
        match self {
            Outcome::Ok => "ENOERROR",
            Outcome::Timeout => "ETIMEOUT",
            Outcome::NoConn => "ENOCONN",
            Outcome::Dns => "EDNS",
            Outcome::Io => "EIO",
            Outcome::Ssl => "ESSL",
            Outcome::BadData => "EBADDATA",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.code())
    }
}

/// Lifecycle phase of a connection test. Phases only advance, and `Done` is
/// terminal. A STARTTLS upgrade runs inside `InDialog`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestPhase {
    Pending,
    Connecting,
    Handshaking,
    InDialog,
    Verifying,
    Done,
}

/// One endpoint to probe, as handed over by the configuration loader.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TargetDescriptor {
    /// Host name used for display, SNI and the HTTP `Host` header.
    pub host: String,
    /// Resolved address. `None` means resolution failed upstream.
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Falls back to the protocol's default port.
    #[serde(default)]
    pub port: Option<u16>,
    pub protocol: String,
    #[serde(default)]
    pub source: Option<IpAddr>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub tls: Option<TlsOptions>,
    #[serde(default)]
    pub dialog: Option<DialogScript>,
    #[serde(default)]
    pub content: ContentRule,
    #[serde(default)]
    pub http_path: Option<String>,
}

impl TargetDescriptor {
    pub fn new(host: impl Into<String>, ip: IpAddr, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ip: Some(ip),
            port: Some(port),
            protocol: protocol.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_dialog(mut self, dialog: DialogScript) -> Self {
        self.dialog = Some(dialog);
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_content(mut self, rule: ContentRule) -> Self {
        self.content = rule;
        self
    }

    pub fn with_http_path(mut self, path: impl Into<String>) -> Self {
        self.http_path = Some(path.into());
        self
    }

    /// Name used in results: the host, or the address when no host was given.
    pub fn display_name(&self) -> String {
        match (&self.host, self.ip) {
            (h, _) if !h.is_empty() => h.clone(),
            (_, Some(ip)) => ip.to_string(),
            _ => String::new(),
        }
    }
}

/// Peer certificate details captured after a successful TLS handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub expires_at: String,
    pub expires_unix: i64,
    /// Weakest cipher strength seen in the session, when the TLS backend
    /// reports it.
    #[serde(default)]
    pub min_cipher_bits: Option<u16>,
}

/// One finished probe, handed to the status-reporting side.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestResult {
    pub target: String,
    pub address: Option<IpAddr>,
    pub port: u16,
    pub protocol: String,
    pub outcome: Outcome,
    pub opened: bool,
    pub connect_ms: u64,
    pub total_ms: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub banner: Option<String>,
    pub certificate: Option<CertificateInfo>,
    pub content_verification: Option<Verdict>,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub content_digest: Option<String>,
    pub finished_at: String,
}

impl TestResult {
    /// Result for a target that never reached the connect stage.
    pub fn unstarted(target: &TargetDescriptor, port: u16, outcome: Outcome) -> Self {
        Self {
            target: target.display_name(),
            address: target.ip,
            port,
            protocol: target.protocol.clone(),
            outcome,
            opened: false,
            connect_ms: 0,
            total_ms: 0,
            bytes_read: 0,
            bytes_written: 0,
            banner: None,
            certificate: None,
            content_verification: None,
            http_status: None,
            content_type: None,
            content_digest: None,
            finished_at: now_rfc3339(),
        }
    }
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Aggregate counters for one probe run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub submitted: u64,
    pub completed: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub by_protocol: BTreeMap<String, u64>,
    pub by_outcome: BTreeMap<Outcome, u64>,
}

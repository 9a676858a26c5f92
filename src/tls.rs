//! TLS handshake and peer-certificate extraction.
//!
//! The handshake is a future driven by socket readiness: when the TLS engine
//! needs more bytes it yields `Pending` and is resumed on the next readiness
//! event for the same socket. Callers bound it with the test deadline.

use native_tls::{Identity, Protocol};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_native_tls::{TlsConnector, TlsStream};
use tracing::debug;

use crate::error::{ProbeError, Result};
use crate::types::CertificateInfo;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
}

impl TlsVersion {
    fn protocol(self) -> Protocol {
        match self {
            TlsVersion::Tls10 => Protocol::Tlsv10,
            TlsVersion::Tls11 => Protocol::Tlsv11,
            TlsVersion::Tls12 => Protocol::Tlsv12,
        }
    }
}

/// Requested cipher strength.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CipherTier {
    #[default]
    Default,
    Medium,
    High,
}

impl CipherTier {
    fn version_floor(self) -> Option<TlsVersion> {
        match self {
            CipherTier::Default => None,
            CipherTier::Medium => Some(TlsVersion::Tls10),
            CipherTier::High => Some(TlsVersion::Tls12),
        }
    }
}

/// Client certificate and key, PEM encoded (key in PKCS#8).
#[derive(Deserialize, Debug, Clone)]
pub struct ClientIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TlsOptions {
    #[serde(default)]
    pub min_version: Option<TlsVersion>,
    #[serde(default)]
    pub cipher_tier: CipherTier,
    #[serde(default)]
    pub client_identity: Option<ClientIdentity>,
    /// Reject untrusted chains and host-name mismatches. Off by default:
    /// the certificate is reported, not judged.
    #[serde(default)]
    pub verify: bool,
    /// SNI / verification name; defaults to the target host.
    #[serde(default)]
    pub server_name: Option<String>,
}

impl TlsOptions {
    /// Version floor after applying the cipher tier.
    pub fn effective_min_version(&self) -> Option<TlsVersion> {
        match (self.min_version, self.cipher_tier.version_floor()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn connector(&self) -> Result<TlsConnector> {
        let mut builder = native_tls::TlsConnector::builder();
        builder
            .danger_accept_invalid_certs(!self.verify)
            .danger_accept_invalid_hostnames(!self.verify)
            .min_protocol_version(self.effective_min_version().map(TlsVersion::protocol));
        if let Some(id) = &self.client_identity {
            let identity = Identity::from_pkcs8(id.cert_pem.as_bytes(), id.key_pem.as_bytes())
                .map_err(|e| ProbeError::tls(format!("client identity: {e}")))?;
            builder.identity(identity);
        }
        let connector = builder
            .build()
            .map_err(|e| ProbeError::tls(format!("tls setup: {e}")))?;
        Ok(TlsConnector::from(connector))
    }
}

/// An established TLS session, owned by exactly one connection test.
#[derive(Debug)]
pub struct TlsSession<S> {
    stream: TlsStream<S>,
    certificate: Option<CertificateInfo>,
}

impl<S> TlsSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the client handshake over `stream`. Any failure is fatal for the
    /// session; there is no retry.
    pub async fn establish(stream: S, server_name: &str, options: &TlsOptions) -> Result<Self> {
        let connector = options.connector()?;
        let stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProbeError::tls(format!("handshake with {server_name}: {e}")))?;

        let certificate = match stream.get_ref().peer_certificate() {
            Ok(Some(cert)) => {
                let der = cert
                    .to_der()
                    .map_err(|e| ProbeError::tls(format!("peer certificate: {e}")))?;
                Some(certificate_info(&der)?)
            }
            Ok(None) => None,
            Err(e) => return Err(ProbeError::tls(format!("peer certificate: {e}"))),
        };
        debug!(server_name, subject = ?certificate.as_ref().map(|c| &c.subject), "tls established");

        Ok(Self { stream, certificate })
    }

    pub fn into_parts(self) -> (TlsStream<S>, Option<CertificateInfo>) {
        (self.stream, self.certificate)
    }
}

/// Subject, issuer and expiry of a DER-encoded certificate.
///
/// `min_cipher_bits` stays empty: the platform TLS backend does not report
/// the negotiated cipher suite.
pub fn certificate_info(der: &[u8]) -> Result<CertificateInfo> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ProbeError::tls(format!("unparseable peer certificate: {e}")))?;
    let not_after = cert.validity().not_after;
    let expires_at = not_after
        .to_datetime()
        .format(&Rfc3339)
        .unwrap_or_else(|_| not_after.to_string());
    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        expires_at,
        expires_unix: not_after.timestamp(),
        min_cipher_bits: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_raises_version_floor() {
        let opts = TlsOptions {
            min_version: Some(TlsVersion::Tls10),
            cipher_tier: CipherTier::High,
            ..Default::default()
        };
        assert_eq!(opts.effective_min_version(), Some(TlsVersion::Tls12));

        let opts = TlsOptions {
            min_version: Some(TlsVersion::Tls11),
            cipher_tier: CipherTier::Medium,
            ..Default::default()
        };
        assert_eq!(opts.effective_min_version(), Some(TlsVersion::Tls11));
        assert_eq!(TlsOptions::default().effective_min_version(), None);
    }

    #[test]
    fn garbage_certificate_is_tls_error() {
        let err = certificate_info(b"not a certificate").unwrap_err();
        assert!(matches!(err, ProbeError::Tls(_)));
    }

    #[test]
    fn options_deserialize() {
        let opts: TlsOptions = serde_json::from_str(r#"{"min_version":"tls12","cipher_tier":"high","verify":true}"#).unwrap();
        assert_eq!(opts.min_version, Some(TlsVersion::Tls12));
        assert_eq!(opts.cipher_tier, CipherTier::High);
        assert!(opts.verify);
    }
}

use thiserror::Error;

use crate::types::Outcome;

/// Failures raised while driving a single probe.
///
/// These never escape the scheduler: every variant is folded into the
/// test's [`Outcome`] via [`ProbeError::outcome`].
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("tls failure: {0}")]
    Tls(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("unexpected data: {0}")]
    BadData(String),

    #[error("deadline elapsed")]
    Timeout,

    #[error("address for {0} is not resolved")]
    Unresolved(String),

    #[error("invalid dialog: {0}")]
    InvalidDialog(String),

    #[error("invalid content rule: {0}")]
    InvalidRule(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

impl ProbeError {
    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Self::Tls(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn bad_data<S: Into<String>>(msg: S) -> Self {
        Self::BadData(msg.into())
    }

    pub fn invalid_dialog<S: Into<String>>(msg: S) -> Self {
        Self::InvalidDialog(msg.into())
    }

    /// Outcome code reported for a test that failed with this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            ProbeError::Connect(_) => Outcome::NoConn,
            ProbeError::Tls(_) => Outcome::Ssl,
            ProbeError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Outcome::NoConn
            }
            ProbeError::Io(_) | ProbeError::Malformed(_) => Outcome::Io,
            ProbeError::BadData(_) => Outcome::BadData,
            ProbeError::Timeout => Outcome::Timeout,
            ProbeError::Unresolved(_) => Outcome::Dns,
            ProbeError::InvalidDialog(_) | ProbeError::InvalidRule(_) | ProbeError::Config(_) => {
                Outcome::Io
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn errors_map_to_outcome_codes() {
        assert_eq!(ProbeError::Connect(Error::from(ErrorKind::ConnectionRefused)).outcome(), Outcome::NoConn);
        assert_eq!(ProbeError::tls("handshake").outcome(), Outcome::Ssl);
        assert_eq!(ProbeError::malformed("bad chunk").outcome(), Outcome::Io);
        assert_eq!(ProbeError::Io(Error::from(ErrorKind::BrokenPipe)).outcome(), Outcome::Io);
        assert_eq!(ProbeError::Io(Error::from(ErrorKind::ConnectionRefused)).outcome(), Outcome::NoConn);
        assert_eq!(ProbeError::bad_data("mismatch").outcome(), Outcome::BadData);
        assert_eq!(ProbeError::Timeout.outcome(), Outcome::Timeout);
        assert_eq!(ProbeError::Unresolved("db1".into()).outcome(), Outcome::Dns);
    }
}

//! Content verification of a captured response.
//!
//! Pure functions over the captured bytes; nothing here touches the network.
//! Digests are kept as running hashes so that a body longer than the capture
//! limit still hashes to the same value as the full content.

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProbeError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    #[serde(rename = "rmd160", alias = "ripemd160")]
    Ripemd160,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Clone)]
enum Hasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Ripemd160(ripemd::Ripemd160),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Ripemd160(h) => h.update(data),
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finish_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Ripemd160(h) => hex::encode(h.finalize()),
            Hasher::Sha224(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha384(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

impl DigestAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Ripemd160 => "rmd160",
            DigestAlgorithm::Sha224 => "sha224",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            DigestAlgorithm::Md5 => Hasher::Md5(md5::Md5::new()),
            DigestAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            DigestAlgorithm::Ripemd160 => Hasher::Ripemd160(ripemd::Ripemd160::new()),
            DigestAlgorithm::Sha224 => Hasher::Sha224(Sha224::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn hash_hex(self, data: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finish_hex()
    }
}

impl FromStr for DigestAlgorithm {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "rmd160" | "ripemd160" => Ok(DigestAlgorithm::Ripemd160),
            "sha224" => Ok(DigestAlgorithm::Sha224),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(ProbeError::InvalidRule(format!("unsupported digest algorithm: {other}"))),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Digest of `data` in the `algo:hex` notation used by digest rules.
pub fn compute_digest(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    format!("{}:{}", algorithm.name(), algorithm.hash_hex(data))
}

/// Running digests over every content byte, including bytes dropped by the
/// capture limit. SHA-256 is always kept; a digest rule adds its own
/// algorithm.
#[derive(Clone)]
pub struct ContentDigests {
    hashers: Vec<(DigestAlgorithm, Hasher)>,
    total: u64,
}

impl ContentDigests {
    pub fn new() -> Self {
        Self::with_algorithms(&[DigestAlgorithm::Sha256])
    }

    pub fn with_algorithms(algorithms: &[DigestAlgorithm]) -> Self {
        let mut hashers: Vec<(DigestAlgorithm, Hasher)> = Vec::with_capacity(algorithms.len());
        for &algorithm in algorithms {
            if !hashers.iter().any(|(a, _)| *a == algorithm) {
                hashers.push((algorithm, algorithm.hasher()));
            }
        }
        Self { hashers, total: 0 }
    }

    /// The hashes `rule` needs next to the SHA-256 content digest.
    pub fn for_rule(rule: &ContentRule) -> Self {
        match rule {
            ContentRule::Digest { algorithm, .. } => Self::with_algorithms(&[DigestAlgorithm::Sha256, *algorithm]),
            _ => Self::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, hasher) in &mut self.hashers {
            hasher.update(data);
        }
        self.total += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    /// Hex digest of everything hashed so far; `None` if `algorithm` is not
    /// tracked.
    pub fn hex(&self, algorithm: DigestAlgorithm) -> Option<String> {
        self.hashers
            .iter()
            .find(|(a, _)| *a == algorithm)
            .map(|(_, hasher)| hasher.clone().finish_hex())
    }

    /// `algo:hex` form, as [`compute_digest`] renders it.
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Option<String> {
        self.hex(algorithm).map(|h| format!("{}:{h}", algorithm.name()))
    }
}

impl Default for ContentDigests {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContentDigests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentDigests")
            .field("algorithms", &self.hashers.iter().map(|(a, _)| a.name()).collect::<Vec<_>>())
            .field("total", &self.total)
            .finish()
    }
}

/// What a response must look like to pass.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "ContentRuleSpec")]
pub enum ContentRule {
    #[default]
    None,
    Pattern(Regex),
    /// Passes when the pattern does not occur.
    NoPattern(Regex),
    Digest {
        algorithm: DigestAlgorithm,
        expected: String,
    },
    ContentType(String),
}

impl ContentRule {
    pub fn pattern(re: &str) -> Result<Self> {
        Ok(ContentRule::Pattern(compile(re)?))
    }

    pub fn no_pattern(re: &str) -> Result<Self> {
        Ok(ContentRule::NoPattern(compile(re)?))
    }

    /// Parse `algo:hex`, with an optional leading `#`.
    pub fn digest(spec: &str) -> Result<Self> {
        let spec = spec.trim().trim_start_matches('#');
        let (algo, value) = spec
            .split_once(':')
            .ok_or_else(|| ProbeError::InvalidRule(format!("digest must be algo:hex, got {spec}")))?;
        let algorithm: DigestAlgorithm = algo.parse()?;
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProbeError::InvalidRule(format!("digest value is not hex: {value}")));
        }
        Ok(ContentRule::Digest {
            algorithm,
            expected: value.to_ascii_lowercase(),
        })
    }

    pub fn content_type(value: &str) -> Self {
        ContentRule::ContentType(value.trim().to_string())
    }

}

fn compile(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| ProbeError::InvalidRule(e.to_string()))
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ContentRuleSpec {
    None,
    Pattern { pattern: String },
    NoPattern { pattern: String },
    Digest { digest: String },
    ContentType { content_type: String },
}

impl TryFrom<ContentRuleSpec> for ContentRule {
    type Error = ProbeError;

    fn try_from(spec: ContentRuleSpec) -> Result<Self> {
        match spec {
            ContentRuleSpec::None => Ok(ContentRule::None),
            ContentRuleSpec::Pattern { pattern } => ContentRule::pattern(&pattern),
            ContentRuleSpec::NoPattern { pattern } => ContentRule::no_pattern(&pattern),
            ContentRuleSpec::Digest { digest } => ContentRule::digest(&digest),
            ContentRuleSpec::ContentType { content_type } => Ok(ContentRule::content_type(&content_type)),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "verdict", content = "reason")]
pub enum Verdict {
    Pass,
    Fail(String),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Captured response material a rule is judged against.
#[derive(Debug, Clone, Copy, Default)]
pub struct Content<'a> {
    pub body: &'a [u8],
    pub content_type: Option<&'a str>,
    /// Running digests over the full content when `body` may be truncated.
    pub digests: Option<&'a ContentDigests>,
}

impl<'a> Content<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            body,
            content_type: None,
            digests: None,
        }
    }

    pub fn with_content_type(mut self, content_type: Option<&'a str>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_digests(mut self, digests: &'a ContentDigests) -> Self {
        self.digests = Some(digests);
        self
    }
}

pub fn verify(content: &Content<'_>, rule: &ContentRule) -> Verdict {
    match rule {
        ContentRule::None => Verdict::Pass,
        ContentRule::Pattern(re) => {
            if re.is_match(content.body) {
                Verdict::Pass
            } else {
                Verdict::Fail(format!("pattern /{}/ not found", re.as_str()))
            }
        }
        ContentRule::NoPattern(re) => {
            if re.is_match(content.body) {
                Verdict::Fail(format!("forbidden pattern /{}/ found", re.as_str()))
            } else {
                Verdict::Pass
            }
        }
        ContentRule::Digest { algorithm, expected } => {
            let actual = content
                .digests
                .and_then(|d| d.hex(*algorithm))
                .unwrap_or_else(|| algorithm.hash_hex(content.body));
            if actual.eq_ignore_ascii_case(expected) {
                Verdict::Pass
            } else {
                Verdict::Fail(format!("digest mismatch: expected {algorithm}:{expected}, got {algorithm}:{actual}"))
            }
        }
        ContentRule::ContentType(expected) => match content.content_type {
            Some(actual) if media_type(actual).eq_ignore_ascii_case(media_type(expected)) => Verdict::Pass,
            Some(actual) => Verdict::Fail(format!("content type {actual} does not match {expected}")),
            None => Verdict::Fail("no content type in response".to_string()),
        },
    }
}

fn media_type(value: &str) -> &str {
    value.split(';').next().unwrap_or("").trim()
}

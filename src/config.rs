use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::types::TargetDescriptor;

pub const MAX_CONCURRENCY: usize = 5_000;

/// Engine-wide settings, fixed for the lifetime of a scheduler.
///
/// All durations are in milliseconds when read from JSON.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub global_timeout: u64,
    pub default_test_timeout: u64,
    /// Quiescence window that ends a read-until-idle step.
    pub idle_window: u64,
    pub max_read_bytes: usize,
    pub max_header_bytes: usize,
    /// Upper bound of the random delay applied before each admission.
    pub jitter: u64,
    pub shuffle: bool,
    pub source_ipv4: Option<IpAddr>,
    pub source_ipv6: Option<IpAddr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 256,
            global_timeout: 300_000,
            default_test_timeout: 10_000,
            idle_window: 500,
            max_read_bytes: 1 << 20,
            max_header_bytes: 64 << 10,
            jitter: 0,
            shuffle: false,
            source_ipv4: None,
            source_ipv6: None,
        }
    }
}

impl EngineConfig {
    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout)
    }

    pub fn default_test_timeout(&self) -> Duration {
        Duration::from_millis(self.default_test_timeout)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window)
    }

    /// Source address to bind for a destination of the given family.
    pub fn source_for(&self, dest: IpAddr) -> Option<IpAddr> {
        match dest {
            IpAddr::V4(_) => self.source_ipv4,
            IpAddr::V6(_) => self.source_ipv6,
        }
    }
}

pub fn clamp_concurrency(n: usize) -> usize {
    n.clamp(1, MAX_CONCURRENCY)
}

/// Load engine settings from a JSON file. Missing fields take their defaults.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<EngineConfig> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid config file: {}", path.as_ref().display()))
}

/// Load a JSON array of target descriptors.
pub fn load_targets_from_path(path: impl AsRef<Path>) -> Result<Vec<TargetDescriptor>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read targets file: {}", path.as_ref().display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid targets file: {}", path.as_ref().display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::DialogStep;
    use crate::verify::ContentRule;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"concurrency": 8, "shuffle": true}"#).unwrap();
        assert_eq!(cfg.concurrency, 8);
        assert!(cfg.shuffle);
        assert_eq!(cfg.default_test_timeout, 10_000);
        assert_eq!(cfg.idle_window(), Duration::from_millis(500));
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(clamp_concurrency(0), 1);
        assert_eq!(clamp_concurrency(1_000_000), MAX_CONCURRENCY);
        assert_eq!(clamp_concurrency(64), 64);
    }

    #[test]
    fn source_by_family() {
        let cfg = EngineConfig {
            source_ipv4: Some("10.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(cfg.source_for("192.0.2.1".parse().unwrap()), cfg.source_ipv4);
        assert_eq!(cfg.source_for("::1".parse().unwrap()), None);
    }

    #[test]
    fn targets_deserialize_with_dialog_and_rule() {
        let json = r#"[
            {"host": "mail", "ip": "127.0.0.1", "protocol": "smtp"},
            {"host": "web", "ip": "127.0.0.1", "port": 8080, "protocol": "http",
             "http_path": "/health",
             "content": {"kind": "pattern", "pattern": "ok"}},
            {"host": "odd", "protocol": "custom",
             "dialog": ["send:\"HELLO\\r\\n\"", "expect:\"HI\"", "close"]}
        ]"#;
        let targets: Vec<TargetDescriptor> = serde_json::from_str(json).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].port, None);
        assert!(matches!(targets[1].content, ContentRule::Pattern(_)));
        assert_eq!(targets[2].ip, None);
        let dialog = targets[2].dialog.as_ref().unwrap();
        assert!(matches!(dialog.get(0), Some(DialogStep::Send(d)) if d == b"HELLO\r\n"));
    }
}

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::dialog::{self, DialogScript, DialogStep, ExpectPattern};

/// Per-protocol behaviour switches.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolFlags {
    /// Strip and answer telnet option negotiation.
    pub telnet: bool,
    /// TLS handshake immediately after connect.
    pub ssl: bool,
    /// Plaintext first, upgraded by a `starttls` step.
    pub starttls: bool,
    pub udp: bool,
    /// Response is framed as HTTP.
    pub http: bool,
    /// Dialog is run by an external module; only the connect is checked here.
    pub external: bool,
    /// Keep the banner text in the result.
    pub banner: bool,
}

impl ProtocolFlags {
    fn set(&mut self, option: &str) -> Result<()> {
        match option {
            "telnet" => self.telnet = true,
            "ssl" | "tls" => self.ssl = true,
            "starttls" => self.starttls = true,
            "udp" => self.udp = true,
            "http" => self.http = true,
            "external" => self.external = true,
            "banner" => self.banner = true,
            other => bail!("unknown option: {other}"),
        }
        Ok(())
    }
}

/// A named protocol: default port, dialog script and flags. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct ProtocolDefinition {
    pub name: String,
    pub aliases: Vec<String>,
    pub port: u16,
    pub script: DialogScript,
    pub flags: ProtocolFlags,
}

impl ProtocolDefinition {
    /// Fallback for services without a definition: connect and close.
    pub fn connect_only(name: &str) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            port: 0,
            script: DialogScript::connect_only(),
            flags: ProtocolFlags::default(),
        }
    }
}

/// Lookup table of protocol definitions by name or alias (case-insensitive).
#[derive(Debug, Clone, Default)]
pub struct ProtocolCatalog {
    defs: Vec<Arc<ProtocolDefinition>>,
    index: HashMap<String, usize>,
}

impl ProtocolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition; names already present are re-pointed to it.
    pub fn insert(&mut self, def: ProtocolDefinition) {
        let idx = self.defs.len();
        self.index.insert(def.name.to_ascii_lowercase(), idx);
        for alias in &def.aliases {
            self.index.insert(alias.to_ascii_lowercase(), idx);
        }
        self.defs.push(Arc::new(def));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ProtocolDefinition>> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|&idx| Arc::clone(&self.defs[idx]))
    }

    /// Default port for `name`, 0 when unknown.
    pub fn default_port(&self, name: &str) -> u16 {
        self.lookup(name).map(|d| d.port).unwrap_or(0)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The built-in service table.
    pub fn builtin() -> Self {
        let plain = ProtocolFlags {
            banner: true,
            ..Default::default()
        };
        let ssl = ProtocolFlags { ssl: true, ..plain };

        let mut c = Self::new();
        c.insert(banner_service(&["ftp"], 21, Some(b"220"), Some(b"quit\r\n"), plain));
        c.insert(banner_service(&["ssh", "ssh1", "ssh2"], 22, Some(b"SSH"), None, plain));
        c.insert(banner_service(&["telnet"], 23, None, None, ProtocolFlags { telnet: true, ..plain }));
        c.insert(banner_service(&["smtp"], 25, Some(b"220"), Some(b"mail\r\nquit\r\n"), plain));
        c.insert(banner_service(&["pop2", "pop-2"], 109, Some(b"+OK"), Some(b"quit\r\n"), plain));
        c.insert(banner_service(&["pop", "pop3", "pop-3"], 110, Some(b"+OK"), Some(b"quit\r\n"), plain));
        c.insert(banner_service(&["nntp"], 119, Some(b"200"), Some(b"quit\r\n"), plain));
        c.insert(banner_service(&["imap", "imap2", "imap4"], 143, Some(b"* OK"), Some(b"ABC123 LOGOUT\r\n"), plain));
        c.insert(banner_service(&["imap3"], 220, Some(b"* OK"), Some(b"ABC123 LOGOUT\r\n"), plain));
        c.insert(banner_service(&["ldap"], 389, None, None, ProtocolFlags::default()));
        c.insert(banner_service(&["rsync"], 873, Some(b"@RSYNCD"), None, plain));
        c.insert(send_first(
            banner_service(&["clamd"], 3310, Some(b"PONG"), None, ProtocolFlags::default()),
            b"PING\r\n",
        ));
        c.insert(banner_service(&["vnc"], 5900, Some(b"RFB "), Some(b"RFB 000.000\r\n"), plain));
        c.insert(banner_service(&["ftps"], 990, Some(b"220"), Some(b"quit\r\n"), ssl));
        c.insert(banner_service(&["telnets"], 992, None, None, ProtocolFlags { telnet: true, ..ssl }));
        c.insert(banner_service(&["smtps"], 465, Some(b"220"), Some(b"mail\r\nquit\r\n"), ssl));
        c.insert(banner_service(&["pop3s"], 995, Some(b"+OK"), Some(b"quit\r\n"), ssl));
        c.insert(banner_service(&["imaps"], 993, Some(b"* OK"), Some(b"ABC123 LOGOUT\r\n"), ssl));
        c.insert(banner_service(&["nntps"], 563, Some(b"200"), Some(b"quit\r\n"), ssl));
        c.insert(banner_service(&["ldaps"], 636, None, None, ProtocolFlags { ssl: true, ..Default::default() }));
        c.insert(http_service(&["http"], 80, false));
        c.insert(http_service(&["https"], 443, true));
        c
    }
}

/// Services that only speak when spoken to.
fn send_first(mut def: ProtocolDefinition, data: &[u8]) -> ProtocolDefinition {
    let mut steps = vec![DialogStep::Send(data.to_vec())];
    steps.extend(def.script.steps().iter().cloned());
    def.script = DialogScript::new(steps);
    def
}

fn banner_service(
    names: &[&str],
    port: u16,
    expect: Option<&[u8]>,
    send: Option<&[u8]>,
    flags: ProtocolFlags,
) -> ProtocolDefinition {
    let mut steps = Vec::new();
    match expect {
        Some(e) => steps.push(DialogStep::Expect(ExpectPattern::Prefix(e.to_vec()))),
        None if flags.banner => steps.push(DialogStep::ReadUntilIdle),
        None => {}
    }
    if let Some(s) = send {
        steps.push(DialogStep::Send(s.to_vec()));
    }
    steps.push(DialogStep::Close);
    ProtocolDefinition {
        name: names[0].to_string(),
        aliases: names[1..].iter().map(|s| s.to_string()).collect(),
        port,
        script: DialogScript::new(steps),
        flags,
    }
}

/// HTTP definitions carry no script; the request is built per target.
fn http_service(names: &[&str], port: u16, ssl: bool) -> ProtocolDefinition {
    ProtocolDefinition {
        name: names[0].to_string(),
        aliases: names[1..].iter().map(|s| s.to_string()).collect(),
        port,
        script: DialogScript::default(),
        flags: ProtocolFlags {
            http: true,
            ssl,
            ..Default::default()
        },
    }
}

/// Parse a services file into a catalog.
///
/// Format:
/// - `[name|alias|...]` starts a section
/// - `port N`, `options a,b,c`
/// - dialog directives in order: `send:"..."`, `expect:"..."`,
///   `expect-re:"..."`, `read`, `close`, `starttls`
/// - comments: everything after a leading `#` is ignored
pub fn parse_services_str(s: &str) -> Result<ProtocolCatalog> {
    let mut catalog = ProtocolCatalog::new();
    let mut current: Option<(ProtocolDefinition, Vec<DialogStep>)> = None;

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let header = header
                .strip_suffix(']')
                .ok_or_else(|| anyhow!("line {line_no}: unterminated section header: {line}"))?;
            if let Some((def, steps)) = current.take() {
                catalog.insert(finish_section(def, steps));
            }
            let mut names = header.split('|').map(str::trim).filter(|n| !n.is_empty());
            let name = names
                .next()
                .ok_or_else(|| anyhow!("line {line_no}: section without a name"))?;
            let def = ProtocolDefinition {
                name: name.to_string(),
                aliases: names.map(str::to_string).collect(),
                port: 0,
                script: DialogScript::default(),
                flags: ProtocolFlags::default(),
            };
            current = Some((def, Vec::new()));
            continue;
        }

        let (def, steps) = current
            .as_mut()
            .ok_or_else(|| anyhow!("line {line_no}: directive outside of a section: {line}"))?;

        let lower = line.to_ascii_lowercase();
        if let Some(v) = lower.strip_prefix("port") {
            let v = v.trim();
            def.port = v
                .parse::<u16>()
                .with_context(|| format!("line {line_no}: invalid port: {v}"))?;
        } else if let Some(v) = lower.strip_prefix("options") {
            for opt in v.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                def.flags
                    .set(opt)
                    .with_context(|| format!("line {line_no}: in section [{}]", def.name))?;
            }
        } else {
            let step = dialog::parse_directive(line).with_context(|| format!("line {line_no}: {line}"))?;
            steps.push(step);
        }
    }

    if let Some((def, steps)) = current.take() {
        catalog.insert(finish_section(def, steps));
    }
    Ok(catalog)
}

fn finish_section(mut def: ProtocolDefinition, steps: Vec<DialogStep>) -> ProtocolDefinition {
    if steps.iter().any(|s| matches!(s, DialogStep::StartTls)) {
        def.flags.starttls = true;
    }
    def.script = DialogScript::new(steps);
    def
}

/// Load a services file. Errors if the file cannot be read or parsed.
pub fn load_services_from_path(path: impl AsRef<Path>) -> Result<ProtocolCatalog> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read services file: {}", path.as_ref().display()))?;
    parse_services_str(&content)
}

/// Load a services file, or fall back to the built-in table if it is missing or empty.
pub fn load_services_or_builtin(path: impl AsRef<Path>) -> ProtocolCatalog {
    match load_services_from_path(&path) {
        Ok(c) if !c.is_empty() => c,
        _ => ProtocolCatalog::builtin(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_has_common_services() {
        let c = ProtocolCatalog::builtin();
        assert_eq!(c.default_port("smtp"), 25);
        assert_eq!(c.default_port("POP-3"), 110);
        assert_eq!(c.default_port("nosuch"), 0);
        let telnet = c.lookup("telnet").unwrap();
        assert!(telnet.flags.telnet);
        assert!(matches!(telnet.script.get(0), Some(DialogStep::ReadUntilIdle)));
        assert!(c.lookup("imaps").unwrap().flags.ssl);
        assert!(c.lookup("https").unwrap().flags.http);
        let clamd = c.lookup("clamd").unwrap();
        assert!(matches!(clamd.script.get(0), Some(DialogStep::Send(d)) if d == b"PING\r\n"));
    }

    #[test]
    fn parse_sections_aliases_and_directives() {
        let input = r#"
            # mail
            [smtp|mail]
               port 25
               options banner
               expect:"220"
               send:"EHLO probe\r\n"
               expect:"250"
               starttls
               send:"QUIT\r\n"
               close

            [ntp]
               port 123
               options udp
        "#;
        let c = parse_services_str(input).unwrap();
        let smtp = c.lookup("MAIL").unwrap();
        assert_eq!(smtp.name, "smtp");
        assert_eq!(smtp.port, 25);
        assert!(smtp.flags.banner && smtp.flags.starttls);
        assert_eq!(smtp.script.len(), 6);
        assert!(matches!(smtp.script.get(3), Some(DialogStep::StartTls)));
        assert!(c.lookup("ntp").unwrap().flags.udp);
    }

    #[test]
    fn unknown_option_reports_line() {
        let err = parse_services_str("[x]\noptions ssl,bogus\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn directive_outside_section_is_error() {
        assert!(parse_services_str("port 80\n").is_err());
        assert!(parse_services_str("[web\n").is_err());
        assert!(parse_services_str("[web]\nport 70000\n").is_err());
    }
}

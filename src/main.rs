use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use svcprobe_rs::catalog::{load_services_from_path, ProtocolCatalog};
use svcprobe_rs::config::{clamp_concurrency, load_config_from_path, load_targets_from_path, EngineConfig};
use svcprobe_rs::{RunStats, Scheduler, TargetDescriptor, TestResult};

/// svcprobe-rs: concurrent multi-protocol service health probes.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "svcprobe-rs",
    version,
    about = "Concurrent multi-protocol service health probes (banner, dialog, TLS, HTTP).",
    long_about = None
)]
struct Cli {
    /// Engine settings as JSON. Missing fields use defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON array of target descriptors.
    #[arg(long)]
    targets: Option<PathBuf>,

    /// Extra target as PROTOCOL://HOST[:PORT][/PATH]; may be repeated.
    #[arg(long = "probe")]
    probes: Vec<String>,

    /// Services file with protocol definitions. Built-in table if omitted.
    #[arg(long)]
    services: Option<PathBuf>,

    /// Max tests in flight.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-test timeout in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Whole-run timeout in milliseconds.
    #[arg(long = "global-timeout-ms")]
    global_timeout_ms: Option<u64>,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config_from_path(path)?,
        None => EngineConfig::default(),
    };
    if let Some(c) = cli.concurrency {
        config.concurrency = clamp_concurrency(c);
    }
    if let Some(ms) = cli.timeout_ms {
        config.default_test_timeout = ms;
    }
    if let Some(ms) = cli.global_timeout_ms {
        config.global_timeout = ms;
    }

    let catalog = match &cli.services {
        Some(path) => load_services_from_path(path)?,
        None => ProtocolCatalog::builtin(),
    };
    info!(protocols = catalog.len(), "protocol catalog loaded");

    let mut targets = match &cli.targets {
        Some(path) => load_targets_from_path(path)?,
        None => Vec::new(),
    };
    for spec in &cli.probes {
        targets.push(parse_probe(spec).await?);
    }
    if targets.is_empty() {
        bail!("nothing to probe: pass --targets FILE or --probe PROTOCOL://HOST[:PORT]");
    }

    let scheduler = Scheduler::new(Arc::new(catalog), config.clone());
    let mut run = scheduler.submit(targets, config.concurrency, config.global_timeout());

    // Ctrl-C cancels the run; unfinished tests are reported as timeouts.
    let cancel = run.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let mut results = Vec::new();
    while let Some(result) = run.next().await {
        results.push(result);
    }
    let stats = run.stats();

    print_results_table(&results, &stats);
    if let Some(path) = cli.output.as_deref() {
        match write_results_json(path, &results) {
            Ok(()) => println!("Wrote JSON results to {}", path.display()),
            Err(e) => eprintln!("Failed to write JSON to {}: {e:#}", path.display()),
        }
    }
    Ok(())
}

/// Parse `PROTOCOL://HOST[:PORT][/PATH]` and resolve the host.
/// Resolution failures leave the address empty and the run reports EDNS.
async fn parse_probe(spec: &str) -> Result<TargetDescriptor> {
    let (protocol, rest) = spec
        .split_once("://")
        .with_context(|| format!("probe must look like PROTOCOL://HOST[:PORT]: {spec}"))?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], Some(&rest[i..])),
        None => (rest, None),
    };
    let (host, port) = split_host_port(authority)
        .with_context(|| format!("invalid host or port in probe: {spec}"))?;
    if host.is_empty() {
        bail!("missing host in probe: {spec}");
    }

    let ip = match host.parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        Err(_) => match tokio::net::lookup_host((host, port.unwrap_or(0))).await {
            Ok(mut addrs) => addrs.next().map(|a| a.ip()),
            Err(e) => {
                warn!(host, error = %e, "name lookup failed");
                None
            }
        },
    };

    Ok(TargetDescriptor {
        host: host.to_string(),
        ip,
        port,
        protocol: protocol.to_string(),
        http_path: path.map(str::to_string),
        ..Default::default()
    })
}

fn split_host_port(authority: &str) -> Result<(&str, Option<u16>)> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').context("unterminated [ipv6] literal")?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>()?),
            None => None,
        };
        return Ok((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, p)) => Ok((host, Some(p.parse::<u16>()?))),
        None => Ok((authority, None)),
    }
}

fn print_results_table(results: &[TestResult], stats: &RunStats) {
    let mut target_w = "target".len();
    let mut proto_w = "protocol".len();
    for r in results {
        target_w = target_w.max(r.target.len());
        proto_w = proto_w.max(r.protocol.len());
    }
    let port_w = 5usize;
    let outcome_w = "ENOERROR".len();
    let ms_w = "total_ms".len();

    println!(
        "\nCompleted: {} of {} (max in flight: {}, read: {} B, written: {} B)",
        stats.completed, stats.submitted, stats.max_in_flight, stats.bytes_read, stats.bytes_written
    );
    println!(
        "{:<target_w$}  {:>port_w$}  {:<proto_w$}  {:<outcome_w$}  {:>ms_w$}  {}",
        "target", "port", "protocol", "outcome", "total_ms", "detail"
    );
    println!(
        "{:-<target_w$}  {:-<port_w$}  {:-<proto_w$}  {:-<outcome_w$}  {:-<ms_w$}  {:-<6}",
        "", "", "", "", "", ""
    );
    for r in results {
        let mut detail = match (&r.certificate, &r.banner) {
            (Some(cert), _) => format!("cert {} expires {}", cert.subject, cert.expires_at),
            (None, Some(b)) => b.clone(),
            (None, None) => String::new(),
        };
        if let Some(v) = &r.content_verification {
            if !v.passed() {
                detail = format!("content check failed; {detail}");
            }
        }
        if detail.len() > 60 {
            let mut cut = 60;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
        }
        println!(
            "{:<target_w$}  {:>port_w$}  {:<proto_w$}  {:<outcome_w$}  {:>ms_w$}  {}",
            r.target, r.port, r.protocol, r.outcome, r.total_ms, detail
        );
    }
}

fn write_results_json(path: &Path, results: &[TestResult]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

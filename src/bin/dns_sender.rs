//! dns-sender: upload a file to a dnsferry receiver through DNS queries
//!
//! Usage: dns-sender [-u <upstream-ip>] <base-host> <destination-path> [<source-file>]
//!
//! Reads stdin when no source file is given.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use dnsferry::config::{parse_upstream, validate_base_host, validate_destination_path};
use dnsferry::{exit_code, resolv, Sender, SenderConfig, TunnelError, UdpChannel};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "dns-sender")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Send a file through DNS queries", long_about = None)]
struct Cli {
    /// Upstream DNS server IP (default: first nameserver in /etc/resolv.conf)
    #[arg(short = 'u', long, value_name = "IP")]
    upstream: Option<String>,

    /// Tunnel suffix the receiver answers for, e.g. tunnel.test
    base_host: String,

    /// Path the receiver writes to, relative to its output directory
    destination: String,

    /// File to send (default: stdin)
    source: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Confirmation timeout per query, e.g. 500ms or 2s
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    ack_timeout: Option<Duration>,

    /// Close retries per attempt and attempts per transfer
    #[arg(long, value_name = "N")]
    max_tries: Option<u32>,

    /// Upstream DNS port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    dnsferry::logging::init(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        let code = e
            .downcast_ref::<TunnelError>()
            .map_or(exit_code::IO, TunnelError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => SenderConfig::from_file(path).map_err(|e| {
            TunnelError::Argument(format!("cannot load {}: {:#}", path.display(), e))
        })?,
        None => SenderConfig::default(),
    };

    if let Some(ip) = &cli.upstream {
        config.upstream = Some(parse_upstream(ip)?);
    }
    if let Some(timeout) = cli.ack_timeout {
        config.ack_timeout = timeout;
    }
    if let Some(max_tries) = cli.max_tries {
        config.max_tries = max_tries;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;

    let suffix = validate_base_host(&cli.base_host)?;
    validate_destination_path(&cli.destination)?;

    let upstream = match config.upstream {
        Some(ip) => ip,
        None => resolv::upstream_from_file(&config.resolv_conf)?,
    };
    let server_addr = SocketAddr::new(upstream, config.port);

    let payload = match &cli.source {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("cannot read stdin")?;
            buf
        }
    };

    let channel = UdpChannel::open(server_addr).await?;
    let mut sender = Sender::new(channel, suffix, config);
    let report = sender
        .send_with_retries(&cli.destination, &payload)
        .await?
        .into_result()?;

    info!(
        "Delivered {} in {} queries ({} attempt(s))",
        cli.destination, report.packets_sent, report.attempts
    );
    Ok(())
}

//! dns-receiver: authoritative endpoint for a dnsferry tunnel suffix
//!
//! Usage: dns-receiver [--listen <addr>] <base-host> <destination-directory>

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;

use dnsferry::config::validate_base_host;
use dnsferry::{exit_code, ReceiverConfig, ReceiverServer, TunnelError};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "dns-receiver")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Receive files sent through DNS queries", long_about = None)]
struct Cli {
    /// Tunnel suffix to answer for, e.g. tunnel.test
    base_host: String,

    /// Directory received files are written below
    output_dir: PathBuf,

    /// UDP listen address (default: 0.0.0.0:53)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

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
        Some(path) => ReceiverConfig::from_file(path).map_err(|e| {
            TunnelError::Argument(format!("cannot load {}: {:#}", path.display(), e))
        })?,
        None => ReceiverConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let suffix = validate_base_host(&cli.base_host)?;

    let is_dir = tokio::fs::metadata(&cli.output_dir)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(TunnelError::Argument(format!(
            "{} is not a directory",
            cli.output_dir.display()
        ))
        .into());
    }

    let mut server = ReceiverServer::bind(&config, suffix, cli.output_dir).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
        }
    }

    let stats = server.stats();
    info!(
        "{} transfers, {} packets, {} ignored, {} dropped",
        stats.completed, stats.packets, stats.ignored, stats.dropped
    );
    Ok(())
}

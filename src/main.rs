//! framelink-host - Generic Auxiliary Protocol Server
//!
//! A child process of the framelink family: speaks the framed protocol on
//! stdin/stdout (default) or a TCP port, honors the lifecycle contract
//! (initialize/shutdown/exit, parent-death watchdog), and serves the
//! `host/` feature module.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use framelink::config::HostConfig;
use framelink::dispatch::DispatchTable;
use framelink::handlers::HostModule;
use framelink::server::Server;

#[derive(Debug, Parser)]
#[command(name = "framelink-host", version, about = "Generic framelink protocol server")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Append logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Serve on this TCP port instead of stdio
    #[arg(long, value_name = "PORT")]
    tcp: Option<u16>,

    /// Read settings from this TOML file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = HostConfig::load(cli.config.as_deref());

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: HostConfig) -> anyhow::Result<()> {
    let mut table = DispatchTable::new();
    table.register_module(&HostModule::new());

    let server = Server::new(table, config.server_config());

    match cli.tcp {
        Some(port) => server.serve_tcp(([127, 0, 0, 1], port).into()).await?,
        None => server.serve_stdio().await?,
    }
    Ok(())
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let default = match cli.verbose {
        0 => "framelink=warn",
        1 => "framelink=info",
        2 => "framelink=debug",
        _ => "framelink=trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default.into());

    // Stdout carries protocol frames; logs go to stderr or the log file.
    match &cli.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .compact()
                        .with_writer(std::sync::Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
    Ok(())
}

//! Inspecta 3-D Host - out-of-process home of the 3-D detection SDK.
//!
//! Binds the IPC server on `127.0.0.1`, prints `IPC_PORT=<port>` on stdout
//! for the supervisor, and serves commands until the controller sends
//! `Shutdown` or the process is interrupted. All logging goes to stderr.

use anyhow::{bail, Context, Result};
use clap::Parser;
use inspecta_core::config::HostConfig;
use inspecta_core::ipc::ThreeDIpcServer;
use inspecta_core::three_d::{SimulatedSdk, ThreeDHostService};
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "inspecta-3d-host")]
#[command(about = "Out-of-process 3-D detection host for Inspecta")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Baseline simulated measurement, as NAME=VALUE (repeatable)
    #[arg(short, long = "measurement", value_name = "NAME=VALUE")]
    measurements: Vec<String>,

    /// Make SDK initialization fail (executions then answer NotInitialized)
    #[arg(long)]
    fail_init: bool,
}

fn parse_measurement(pair: &str) -> Result<(String, f64)> {
    let Some((name, value)) = pair.split_once('=') else {
        bail!("measurement '{}' is not NAME=VALUE", pair);
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("measurement '{}' has an empty name", pair);
    }
    let value = value
        .trim()
        .parse::<f64>()
        .with_context(|| format!("measurement '{}' has a non-numeric value", pair))?;
    Ok((name.to_string(), value))
}

fn build_sdk(args: &Args) -> Result<SimulatedSdk> {
    let mut sdk = SimulatedSdk::new();
    for spec in &args.measurements {
        let (name, value) = parse_measurement(spec)?;
        sdk = sdk.with_measurement(name, value);
    }
    if args.fail_init {
        sdk = sdk.failing_initialize();
    }
    Ok(sdk)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout carries the port handshake, so logs go to stderr.
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Inspecta 3-D host (simulated SDK)");

    let service = Arc::new(ThreeDHostService::new(build_sdk(&args)?));
    if !service.initialize().await {
        warn!("3-D SDK failed to initialize; serving status only");
    }

    let mut handle = ThreeDIpcServer::start_on(args.port, service).await?;

    // The supervisor reads exactly this line.
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}{}", HostConfig::PORT_HANDSHAKE_PREFIX, handle.port)?;
    stdout.flush()?;
    drop(stdout);

    info!("3-D host serving on {}", handle.addr());

    tokio::select! {
        _ = handle.shutdown_requested() => info!("Shutdown requested by controller"),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }
    handle.shutdown();

    info!("3-D host exiting");
    Ok(())
}

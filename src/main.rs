//! Dual-path GOOSE (IEC 61850) Ethernet-over-multicast cloud bridge.
//!
//! Entry point only; the dataplane and liveness controller live in
//! `supervisor`/`relay`/`igmp`/`tap`/`mcast`/`codec`. CLI surface is
//! intentionally thin.

mod codec;
mod config;
mod error;
mod igmp;
mod logging;
mod mcast;
mod pid;
mod relay;
mod stats;
mod supervisor;
mod tap;

use std::path::PathBuf;

use clap::Parser;

use config::Config;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "goose-bridge")]
#[command(about = "Dual-path GOOSE Ethernet-over-multicast cloud bridge")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/goose-bridge/config.toml")]
    config: PathBuf,

    /// Where to write the PID file.
    #[arg(long, default_value = "/var/run/goose-bridge.pid")]
    pid_file: PathBuf,

    /// Raise log verbosity (stackable: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Parser)]
enum Commands {
    /// Load the configuration and print the resolved values, then exit.
    PrintConfig,
}

fn level_for_verbosity(base: &str, verbose: u8) -> String {
    match verbose {
        0 => base.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    logging::init(&level_for_verbosity(&cfg.log_level, cli.verbose));

    if let Some(Commands::PrintConfig) = cli.command {
        println!("{cfg:#?}");
        return Ok(());
    }

    pid::write(&cli.pid_file).await;

    let result = run(cfg).await;

    pid::remove(&cli.pid_file).await;

    if let Err(e) = result {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(cfg).await?;
    let running = supervisor.running_flag();

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let signal_running = running.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, shutting down");
                    signal_running.store(false, std::sync::atomic::Ordering::Relaxed);
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    signal_running.store(false, std::sync::atomic::Ordering::Relaxed);
                    break;
                }
                _ = sighup.recv() => {
                    // Reload log settings only; topology is not hot-swappable.
                    logging::note_reload_requested("unchanged");
                }
            }
        }
    });

    supervisor.run().await;
    Ok(())
}

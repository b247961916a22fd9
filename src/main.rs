use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use emed_mailer::config::{self, Config};
use emed_mailer::service::Service;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Emails a summary of booked and cancelled appointments"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print an example config file and exit
    #[arg(long)]
    example_config: bool,

    /// Run one collection pass, deliver its notification and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.example_config {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("could not load configuration from {}", args.config.display()))?;
    cfg.ensure_dirs()?;
    init_tracing(&cfg)?;

    let mut service = Service::start(&cfg).await?;

    if args.once {
        let outcome = service.run_once().await;
        info!(?outcome, "single pass finished");
        service.stop().await;
        return Ok(());
    }

    service.start_scheduler(&cfg)?;
    info!(schedule = %cfg.general.schedule, "emed-mailer running");

    shutdown_signal().await?;
    info!("termination signal received");
    service.stop().await;
    Ok(())
}

fn init_tracing(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log.level))
        .context("invalid log.level")?;

    let writer = match cfg.log_path() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("could not open log file {}", path.display()))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(cfg.log.colored)
        .with_target(false);
    if cfg.log.pretty {
        builder.pretty().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

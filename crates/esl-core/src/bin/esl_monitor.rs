//! esl-monitor - follow live calls on a switch from the terminal

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rvoip_esl_core::logging::{parse_log_level, setup_logging, LogFormat};
use rvoip_esl_core::{CallControlService, CallEventKind, ConnectionSignal, EslConfig, EslError};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "esl-monitor")]
#[command(about = "Monitor calls and statistics of a switch over its event socket")]
pub struct Args {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long, env = "ESL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Switch host
    #[arg(long)]
    pub host: Option<String>,

    /// Event socket port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Event socket password
    #[arg(long)]
    pub password: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log as JSON
    #[arg(long)]
    pub json: bool,

    /// Seconds between statistics lines
    #[arg(long, default_value = "30")]
    pub stats_every: u64,
}

fn load_config(args: &Args) -> Result<EslConfig> {
    let config = match &args.config {
        Some(path) => EslConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EslConfig::default(),
    };
    let mut config = config.with_env_overrides()?;

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(password) = &args.password {
        config.password = password.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.json { LogFormat::Json } else { LogFormat::Pretty };
    setup_logging(parse_log_level(&args.log_level)?, format, "esl-monitor")?;

    let config = load_config(&args)?;
    let service = CallControlService::new(config);

    let mut calls = service.subscribe_calls();
    let mut signals = service.subscribe_signals();

    if let Err(e) = service.start().await {
        warn!(error = %e, "Initial connect failed, retrying in the background");
    }

    let mut stats_tick = tokio::time::interval(Duration::from_secs(args.stats_every.max(1)));
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = calls.recv() => match event {
                Ok(event) => match &event.kind {
                    CallEventKind::HungUp { duration_secs, cause } => info!(
                        call_id = %event.call_id,
                        duration_secs,
                        cause = cause.as_deref().unwrap_or("unknown"),
                        "Call ended"
                    ),
                    kind => info!(
                        call_id = %event.call_id,
                        caller = %event.caller_number,
                        callee = %event.callee_number,
                        status = %event.status,
                        "{:?}", kind
                    ),
                },
                Err(RecvError::Lagged(missed)) => warn!(missed, "Call event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            signal = signals.recv() => match signal {
                Ok(ConnectionSignal::MaxReconnectAttemptsReached { attempts }) => {
                    error!(attempts, "Switch unreachable, giving up");
                    outcome = Err(EslError::MaxReconnectAttempts { attempts });
                    break;
                }
                Ok(signal) => info!(?signal, "Connection"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = stats_tick.tick() => {
                let stats = service.stats();
                info!(
                    total = stats.total,
                    inbound = stats.inbound,
                    outbound = stats.outbound,
                    answered = stats.answered,
                    ringing = stats.ringing,
                    held = stats.held,
                    avg_secs = stats.average_duration_secs,
                    answer_rate = stats.answer_rate,
                    "Stats"
                );
            }
        }
    }

    service.shutdown().await?;
    outcome.map_err(Into::into)
}

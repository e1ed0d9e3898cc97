//! Logging setup for binaries embedding the client
//!
//! The level chosen by the operator applies to this crate and to the binary
//! itself, everything else logs warnings only. A `RUST_LOG` value replaces
//! that default entirely.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{EslError, EslResult};

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per line on stdout
    Json,
}

/// Filter for `binary` at `level`, or `rust_log` when one is given
pub fn build_filter(rust_log: Option<&str>, level: Level, binary: &str) -> EslResult<EnvFilter> {
    let directives = match rust_log.map(str::trim).filter(|d| !d.is_empty()) {
        Some(directives) => directives.to_string(),
        None => {
            let level = level.as_str().to_ascii_lowercase();
            format!(
                "warn,{}={},{}={}",
                env!("CARGO_CRATE_NAME"),
                level,
                binary.replace('-', "_"),
                level
            )
        }
    };
    EnvFilter::try_new(&directives)
        .map_err(|e| EslError::invalid_configuration("log_level", format!("{}: {}", directives, e)))
}

/// Install the global subscriber for `binary`
pub fn setup_logging(level: Level, format: LogFormat, binary: &str) -> EslResult<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(rust_log.as_deref(), level, binary)?;

    let subscriber = fmt::Subscriber::builder().with_env_filter(filter);
    let result = match format {
        LogFormat::Pretty => subscriber.try_init(),
        LogFormat::Json => subscriber.with_writer(std::io::stdout).json().try_init(),
    };
    result.map_err(|e| EslError::internal(format!("failed to install logger: {}", e)))?;

    tracing::info!(app = binary, version = crate::VERSION, "Starting");
    Ok(())
}

pub fn parse_log_level(level: &str) -> EslResult<Level> {
    Level::from_str(level)
        .map_err(|_| EslError::invalid_configuration("log_level", format!("Invalid log level: {}", level)))
}

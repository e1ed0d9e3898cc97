//! Configuration for the event-socket client
//!
//! Configuration can be built in code, loaded from a TOML or JSON file, or
//! taken from `ESL_*` environment variables. File values are overridden by
//! the environment when both are used:
//!
//! ```rust
//! use rvoip_esl_core::EslConfig;
//!
//! let config = EslConfig::new("10.0.0.5", 8021, "ClueCon");
//! assert_eq!(config.addr(), "10.0.0.5:8021");
//! assert!(config.validate().is_ok());
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EslError, EslResult};

/// Default event socket port of the switch
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EslConfig {
    /// Switch host name or address
    pub host: String,
    /// Switch event socket port
    pub port: u16,
    /// Event socket password
    pub password: String,
    /// Timeout for TCP connect plus the auth/subscribe handshake
    pub connect_timeout_ms: u64,
    /// Timeout for synchronous (`api`) commands
    pub command_timeout_ms: u64,
    /// Timeout for reload-style commands such as `reloadxml`
    pub reload_timeout_ms: u64,
    /// Timeout for background (`bgapi`) job completion
    pub job_timeout_ms: u64,
    /// Capacity of the channel between the socket reader and the dispatcher
    pub event_channel_capacity: usize,
    /// Capacity of each broadcast channel exposed to subscribers
    pub broadcast_capacity: usize,
    /// CDR updates queued for the sink before new ones are dropped
    pub cdr_queue_capacity: usize,
    /// Directory recordings are written to on the switch host
    pub recordings_dir: String,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
    /// Snapshot and statistics polling
    pub snapshot: SnapshotConfig,
    /// Billing leg detection
    pub billing: BillingLegConfig,
}

/// Reconnect backoff: delay = base x 2^attempt, at most `max_attempts` retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
}

/// Snapshot polling and statistics history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Interval between full call-list polls
    pub poll_interval_ms: u64,
    /// Interval between statistics snapshots appended to the history
    pub stats_interval_ms: u64,
    /// Number of statistics snapshots retained
    pub history_capacity: usize,
}

/// Channel name fragments marking a leg as the billing leg
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BillingLegConfig {
    pub channel_markers: Vec<String>,
}

impl Default for EslConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_ESL_PORT,
            password: "ClueCon".to_string(),
            connect_timeout_ms: 5_000,
            command_timeout_ms: 5_000,
            reload_timeout_ms: 10_000,
            job_timeout_ms: 30_000,
            event_channel_capacity: 4_096,
            broadcast_capacity: 1_000,
            cdr_queue_capacity: 1_024,
            recordings_dir: "/var/lib/freeswitch/recordings".to_string(),
            reconnect: ReconnectConfig::default(),
            snapshot: SnapshotConfig::default(),
            billing: BillingLegConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_attempts: 5,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            stats_interval_ms: 30_000,
            history_capacity: 120,
        }
    }
}

impl Default for BillingLegConfig {
    fn default() -> Self {
        Self {
            channel_markers: vec!["sofia/gateway/".to_string()],
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl SnapshotConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

impl EslConfig {
    /// Create a configuration for the given switch with default timeouts
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.into(),
            ..Default::default()
        }
    }

    /// `host:port` string used for connecting
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_timeout_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn with_reconnect(mut self, base_delay: Duration, max_attempts: u32) -> Self {
        self.reconnect = ReconnectConfig {
            base_delay_ms: base_delay.as_millis() as u64,
            max_attempts,
        };
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Load configuration from a file (`.json`, otherwise TOML)
    pub fn from_file(path: impl AsRef<Path>) -> EslResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EslError::invalid_configuration(path.display().to_string(), e.to_string())
        })?;

        let config: Self = if path.extension().map_or(false, |ext| ext == "json") {
            serde_json::from_str(&contents).map_err(|e| {
                EslError::invalid_configuration(path.display().to_string(), e.to_string())
            })?
        } else {
            toml::from_str(&contents).map_err(|e| {
                EslError::invalid_configuration(path.display().to_string(), e.to_string())
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Default configuration with `ESL_*` environment overrides applied
    pub fn from_env() -> EslResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `ESL_*` environment variables on top of this configuration
    pub fn with_env_overrides(self) -> EslResult<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn with_overrides<F>(mut self, lookup: F) -> EslResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(name: &str, value: String) -> EslResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| EslError::invalid_configuration(name, format!("cannot parse '{}'", value)))
        }

        if let Some(v) = lookup("ESL_HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("ESL_PORT") {
            self.port = parsed("ESL_PORT", v)?;
        }
        if let Some(v) = lookup("ESL_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = lookup("ESL_COMMAND_TIMEOUT_MS") {
            self.command_timeout_ms = parsed("ESL_COMMAND_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("ESL_RECONNECT_BASE_MS") {
            self.reconnect.base_delay_ms = parsed("ESL_RECONNECT_BASE_MS", v)?;
        }
        if let Some(v) = lookup("ESL_RECONNECT_MAX_ATTEMPTS") {
            self.reconnect.max_attempts = parsed("ESL_RECONNECT_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("ESL_RECORDINGS_DIR") {
            self.recordings_dir = v;
        }

        self.validate()?;
        Ok(self)
    }

    /// Check the configuration for values the client cannot work with
    pub fn validate(&self) -> EslResult<()> {
        if self.host.trim().is_empty() {
            return Err(EslError::invalid_configuration("host", "cannot be empty"));
        }
        if self.port == 0 {
            return Err(EslError::invalid_configuration("port", "must be non-zero"));
        }
        if self.command_timeout_ms == 0 || self.job_timeout_ms == 0 || self.reload_timeout_ms == 0 {
            return Err(EslError::invalid_configuration(
                "timeouts",
                "command, reload and job timeouts must be non-zero",
            ));
        }
        if self.event_channel_capacity == 0
            || self.broadcast_capacity == 0
            || self.cdr_queue_capacity == 0
        {
            return Err(EslError::invalid_configuration(
                "capacity",
                "channel capacities must be non-zero",
            ));
        }
        if self.snapshot.history_capacity == 0 {
            return Err(EslError::invalid_configuration(
                "snapshot.history_capacity",
                "must be non-zero",
            ));
        }
        if self.snapshot.poll_interval_ms == 0 || self.snapshot.stats_interval_ms == 0 {
            return Err(EslError::invalid_configuration(
                "snapshot",
                "intervals must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = EslConfig::default();
        assert_eq!(config.port, DEFAULT_ESL_PORT);
        assert_eq!(config.reload_timeout(), Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parse_with_partial_sections() {
        let text = r#"
            host = "fs1.example.net"
            password = "secret"

            [reconnect]
            max_attempts = 8

            [snapshot]
            history_capacity = 10
        "#;
        let config: EslConfig = toml::from_str(text).unwrap();
        assert_eq!(config.host, "fs1.example.net");
        assert_eq!(config.port, DEFAULT_ESL_PORT);
        assert_eq!(config.reconnect.max_attempts, 8);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.snapshot.history_capacity, 10);
        assert_eq!(config.snapshot.poll_interval_ms, 5_000);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ESL_HOST", "10.1.1.1"),
            ("ESL_PORT", "9021"),
            ("ESL_RECONNECT_MAX_ATTEMPTS", "3"),
        ]
        .into_iter()
        .collect();

        let config = EslConfig::default()
            .with_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.addr(), "10.1.1.1:9021");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.password, "ClueCon");
    }

    #[test]
    fn test_override_parse_error() {
        let result = EslConfig::default()
            .with_overrides(|name| (name == "ESL_PORT").then(|| "eighty".to_string()));
        assert!(matches!(
            result,
            Err(EslError::InvalidConfiguration { ref field, .. }) if field == "ESL_PORT"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = EslConfig::new("localhost", 0, "ClueCon");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cdr_queue_capacity() {
        let config: EslConfig = toml::from_str("cdr_queue_capacity = 64").unwrap();
        assert_eq!(config.cdr_queue_capacity, 64);
        assert_eq!(EslConfig::default().cdr_queue_capacity, 1_024);

        let config = EslConfig {
            cdr_queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EslError::InvalidConfiguration { ref field, .. }) if field == "capacity"
        ));
    }
}

//! BrokerSim configuration
//!
//! Settings are read from a TOML file (every field optional) and then
//! overridden from `BSIM_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const ENV_TRAVEL_SPEED: &str = "BSIM_TRAVEL_SPEED";
pub const ENV_TICK_INTERVAL_MS: &str = "BSIM_TICK_INTERVAL_MS";
pub const ENV_CONSUMER_POLL_INTERVAL_MS: &str = "BSIM_CONSUMER_POLL_INTERVAL_MS";
pub const ENV_HISTORY_CAPACITY: &str = "BSIM_HISTORY_CAPACITY";
pub const ENV_MANUAL_ACK_AUTO_ACK_DELAY_MS: &str = "BSIM_MANUAL_ACK_AUTO_ACK_DELAY_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Transit progress units gained per millisecond (100 units = one hop)
    pub travel_speed: f64,
    /// Real-time driver transit tick period
    pub tick_interval_ms: u64,
    /// Consumer delivery poll period
    pub consumer_poll_interval_ms: u64,
    /// Maximum number of undo snapshots kept
    pub history_capacity: usize,
    /// When set, manual-ack consumers acknowledge this long after processing
    pub manual_ack_auto_ack_delay_ms: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            travel_speed: 0.1,
            tick_interval_ms: 16,
            consumer_poll_interval_ms: 500,
            history_capacity: 50,
            manual_ack_auto_ack_delay_ms: None,
        }
    }
}

impl SimulatorConfig {
    /// Load from a TOML file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading simulator config");
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are
    /// logged and skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override::<f64>(&lookup, ENV_TRAVEL_SPEED) {
            self.travel_speed = v;
        }
        if let Some(v) = parse_override::<u64>(&lookup, ENV_TICK_INTERVAL_MS) {
            self.tick_interval_ms = v;
        }
        if let Some(v) = parse_override::<u64>(&lookup, ENV_CONSUMER_POLL_INTERVAL_MS) {
            self.consumer_poll_interval_ms = v;
        }
        if let Some(v) = parse_override::<usize>(&lookup, ENV_HISTORY_CAPACITY) {
            self.history_capacity = v;
        }
        if let Some(v) = parse_override::<u64>(&lookup, ENV_MANUAL_ACK_AUTO_ACK_DELAY_MS) {
            self.manual_ack_auto_ack_delay_ms = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.travel_speed.is_finite() && self.travel_speed > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "travel_speed must be positive, got {}",
                self.travel_speed
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be > 0".to_string()));
        }
        if self.consumer_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("consumer_poll_interval_ms must be > 0".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn consumer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_interval_ms)
    }

    pub fn manual_ack_auto_ack_delay(&self) -> Option<Duration> {
        self.manual_ack_auto_ack_delay_ms.map(Duration::from_millis)
    }

    /// Wall-clock time a message spends on one hop
    pub fn hop_duration(&self) -> Duration {
        Duration::from_secs_f64(100.0 / self.travel_speed / 1000.0)
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring unparseable config override");
            None
        }
    }
}

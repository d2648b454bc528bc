//! Configuration types for flowstate
//!
//! Every tunable of the flow table is a plain integer or flag with a
//! default, so a config file only needs to name what it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::table::MAX_BUCKET_COUNT;

/// Longest accepted lifetime or interval, ten years
pub const MAX_LIFETIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Root configuration for the simulator binary
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimulatorConfig {
    /// Flow table tunables
    #[serde(default)]
    pub table: FlowTableConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl SimulatorConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.table.validate()?;
        self.log.validate()
    }
}

/// Flow table tunables
///
/// Lifetimes are in whole seconds. All values can be changed on a live
/// table through [`FlowTable::reconfigure`](crate::FlowTable::reconfigure)
/// except `buckets`, which only applies at construction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlowTableConfig {
    /// Initial bucket count (power of two)
    #[serde(default = "default_buckets")]
    pub buckets: usize,

    /// Upper bound for automatic growth (power of two)
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,

    /// Maximum number of records, limit parents included
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Lifetime of a TCP flow that has seen a SYN from one side only
    #[serde(default = "default_syn_lifetime_secs")]
    pub syn_lifetime_secs: u64,

    /// Lifetime granted when both sides acknowledge fresh data
    #[serde(default = "default_ack_lifetime_secs")]
    pub ack_lifetime_secs: u64,

    /// Lifetime of a TCP flow after a FIN
    #[serde(default = "default_fin_lifetime_secs")]
    pub fin_lifetime_secs: u64,

    /// Lifetime of a TCP flow after a RST or an unexpected flag combination
    #[serde(default = "default_rst_lifetime_secs")]
    pub rst_lifetime_secs: u64,

    /// Lifetime of a UDP flow
    #[serde(default = "default_udp_lifetime_secs")]
    pub udp_lifetime_secs: u64,

    /// Lifetime of any other protocol
    #[serde(default = "default_short_lifetime_secs")]
    pub short_lifetime_secs: u64,

    /// Send keepalive probes for established TCP flows close to expiry
    #[serde(default = "default_true")]
    pub keepalive: bool,

    /// Probe flows whose deadline is closer than this
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Run a keepalive pass at most this often
    #[serde(default = "default_keepalive_period_secs")]
    pub keepalive_period_secs: u64,

    /// Maintenance tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Ask the network layer to reset established TCP flows removed by
    /// rule deletion
    #[serde(default)]
    pub reset_on_cascade: bool,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            buckets: default_buckets(),
            max_buckets: default_max_buckets(),
            max_records: default_max_records(),
            syn_lifetime_secs: default_syn_lifetime_secs(),
            ack_lifetime_secs: default_ack_lifetime_secs(),
            fin_lifetime_secs: default_fin_lifetime_secs(),
            rst_lifetime_secs: default_rst_lifetime_secs(),
            udp_lifetime_secs: default_udp_lifetime_secs(),
            short_lifetime_secs: default_short_lifetime_secs(),
            keepalive: true,
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_period_secs: default_keepalive_period_secs(),
            tick_ms: default_tick_ms(),
            reset_on_cascade: false,
        }
    }
}

impl FlowTableConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial bucket count
    #[must_use]
    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.buckets = buckets;
        self
    }

    /// Set the growth limit for the bucket array
    #[must_use]
    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    /// Set the maximum record count
    #[must_use]
    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    /// Enable or disable keepalive probes
    #[must_use]
    pub fn with_keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }

    /// Set the maintenance tick
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Request resets for established flows removed by rule deletion
    #[must_use]
    pub fn with_reset_on_cascade(mut self, enabled: bool) -> Self {
        self.reset_on_cascade = enabled;
        self
    }

    /// Maintenance tick as a `Duration`
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_bucket_count("buckets", self.buckets)?;
        validate_bucket_count("max_buckets", self.max_buckets)?;

        if self.buckets > self.max_buckets {
            return Err(ConfigError::ValidationError(format!(
                "buckets ({}) exceeds max_buckets ({})",
                self.buckets, self.max_buckets
            )));
        }

        if self.max_records == 0 {
            return Err(ConfigError::validation("max_records must be > 0"));
        }

        let lifetimes = [
            ("syn_lifetime_secs", self.syn_lifetime_secs),
            ("ack_lifetime_secs", self.ack_lifetime_secs),
            ("fin_lifetime_secs", self.fin_lifetime_secs),
            ("rst_lifetime_secs", self.rst_lifetime_secs),
            ("udp_lifetime_secs", self.udp_lifetime_secs),
            ("short_lifetime_secs", self.short_lifetime_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
        ];
        for (name, value) in lifetimes {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
            check_upper_bound(name, value, MAX_LIFETIME_SECS)?;
        }

        // fin/rst lifetimes are clamped to period - 1, which must stay positive
        if self.keepalive_period_secs < 2 {
            return Err(ConfigError::validation("keepalive_period_secs must be >= 2"));
        }
        check_upper_bound("keepalive_period_secs", self.keepalive_period_secs, MAX_LIFETIME_SECS)?;

        if self.tick_ms == 0 {
            return Err(ConfigError::validation("tick_ms must be > 0"));
        }
        check_upper_bound("tick_ms", self.tick_ms, MAX_LIFETIME_SECS * 1000)?;

        Ok(())
    }
}

// Deadlines are `Instant + lifetime`, which panics on overflow
fn check_upper_bound(name: &str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::ValidationError(format!(
            "{name} must be <= {max}, got {value}"
        )));
    }
    Ok(())
}

fn validate_bucket_count(name: &str, count: usize) -> Result<(), ConfigError> {
    if count == 0 || count > MAX_BUCKET_COUNT || !count.is_power_of_two() {
        return Err(ConfigError::ValidationError(format!(
            "{name} must be a power of two in [1, {MAX_BUCKET_COUNT}], got {count}"
        )));
    }
    Ok(())
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

impl LogConfig {
    /// Validate the logging configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown log format '{other}', expected 'json' or 'text'"
            ))),
        }
    }
}

// Default value functions for serde

const fn default_true() -> bool {
    true
}

const fn default_buckets() -> usize {
    256
}

const fn default_max_buckets() -> usize {
    MAX_BUCKET_COUNT
}

const fn default_max_records() -> usize {
    16384
}

const fn default_syn_lifetime_secs() -> u64 {
    20
}

const fn default_ack_lifetime_secs() -> u64 {
    300
}

const fn default_fin_lifetime_secs() -> u64 {
    1
}

const fn default_rst_lifetime_secs() -> u64 {
    1
}

const fn default_udp_lifetime_secs() -> u64 {
    10
}

const fn default_short_lifetime_secs() -> u64 {
    5
}

const fn default_keepalive_interval_secs() -> u64 {
    20
}

const fn default_keepalive_period_secs() -> u64 {
    5
}

const fn default_tick_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

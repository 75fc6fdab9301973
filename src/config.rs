//! Configuration snapshot for one curing cycle.
//!
//! Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables prefixed with `AUTOCLAVE_DAQ_`, nested keys separated
//!    by a double underscore (e.g. `AUTOCLAVE_DAQ_LINK__PORT=/dev/ttyUSB1`)
//!
//! The resulting [`Settings`] value is validated once, wrapped in an `Arc` and handed
//! to every component of the cycle. Nothing reads configuration from global state
//! while a cycle is running.
//!
//! # Example
//! ```no_run
//! use autoclave_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/autoclave.toml")?;
//! settings.validate()?;
//! println!("{} channels on {}", settings.channels.len(), settings.link.port);
//! # Ok::<(), autoclave_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::transport::RegisterKind;
use crate::validation::{is_in_range, is_not_empty, is_positive};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Number of channels on the reference autoclave panel.
pub const REFERENCE_CHANNEL_COUNT: usize = 14;

/// Longest accepted loop period, in seconds (one day).
pub const MAX_PERIOD_SECS: f64 = 86_400.0;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Field-bus link parameters
    pub link: LinkSettings,
    /// Loop timing and event-detection parameters
    pub acquisition: AcquisitionSettings,
    /// Per-channel configuration, in channel order (channel 1 first)
    pub channels: Vec<ChannelConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Field-bus link parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Communication speed (e.g., 9600, 19200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits per character (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Register bank used for reads
    #[serde(default)]
    pub register_kind: RegisterKind,
    /// Response timeout for a single transaction in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl LinkSettings {
    /// Per-transaction response timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Loop timing and event-detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Recording period in seconds
    pub sample_period_secs: f64,
    /// Preview (live panel) period in seconds
    #[serde(default = "default_panel_period")]
    pub panel_period_secs: f64,
    /// Sleep granularity while pacing a tick, in milliseconds
    #[serde(default = "default_poll_quantum_ms")]
    pub poll_quantum_ms: u64,
    /// Channel carrying the core temperature (1-based)
    pub core_temp_channel: usize,
    /// Channel carrying the vessel pressure (1-based)
    pub pressure_channel: usize,
    /// Core temperature threshold for dwell accounting
    pub core_temp_setpoint: f64,
    /// Capacity of the notification channel
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
}

impl AcquisitionSettings {
    /// Recording loop period.
    pub fn sample_period(&self) -> Duration {
        period(self.sample_period_secs)
    }

    /// Preview loop period.
    pub fn panel_period(&self) -> Duration {
        period(self.panel_period_secs)
    }

    /// Pacing granularity.
    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }
}

/// Seconds clamped into `0..=MAX_PERIOD_SECS`; NaN maps to zero.
fn period(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.clamp(0.0, MAX_PERIOD_SECS)).unwrap_or(Duration::ZERO)
}

/// Which plot axis a channel is drawn against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AxisSide {
    /// Left vertical axis
    #[default]
    Left,
    /// Right vertical axis
    Right,
}

/// Configuration of one acquisition channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Display label
    pub label: String,
    /// Device (slave) address on the bus
    pub device_address: u8,
    /// Process value register
    pub process_register: u16,
    /// Setpoint register, read every tick and written by the setpoint write path
    pub setpoint_register: u16,
    /// Setpoint value written to `setpoint_register`
    #[serde(default)]
    pub setpoint_value: u16,
    /// Number of implied decimal places in the raw register value
    #[serde(default)]
    pub decimal_point: u8,
    /// Whether the channel is polled
    #[serde(default)]
    pub active: bool,
    /// Whether the linear range remap is applied
    #[serde(default)]
    pub scale: bool,
    /// Input range low end (after decimal scaling)
    #[serde(default)]
    pub input_low: f64,
    /// Input range high end (after decimal scaling)
    #[serde(default)]
    pub input_high: f64,
    /// Output range low end (engineering units)
    #[serde(default)]
    pub output_low: f64,
    /// Output range high end (engineering units)
    #[serde(default)]
    pub output_high: f64,
    /// Plot axis
    #[serde(default)]
    pub axis: AxisSide,
}

impl ChannelConfig {
    /// An inactive, unscaled channel with the given label and address.
    pub fn new(label: impl Into<String>, device_address: u8, process_register: u16) -> Self {
        Self {
            label: label.into(),
            device_address,
            process_register,
            setpoint_register: 0x0500,
            setpoint_value: 0,
            decimal_point: 0,
            active: false,
            scale: false,
            input_low: 0.0,
            input_high: 0.0,
            output_low: 0.0,
            output_high: 0.0,
            axis: AxisSide::Left,
        }
    }

    /// Mark the channel as polled.
    pub fn activated(mut self) -> Self {
        self.active = true;
        self
    }

    /// Set the implied decimal places.
    pub fn with_decimal_point(mut self, decimal_point: u8) -> Self {
        self.decimal_point = decimal_point;
        self
    }

    /// Enable the linear remap from `input` to `output`.
    pub fn with_scaling(mut self, input: (f64, f64), output: (f64, f64)) -> Self {
        self.scale = true;
        self.input_low = input.0;
        self.input_high = input.1;
        self.output_low = output.0;
        self.output_high = output.1;
        self
    }
}

// Default value functions
fn default_app_name() -> String {
    "Autoclave DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    100
}

fn default_panel_period() -> f64 {
    1.0
}

fn default_poll_quantum_ms() -> u64 {
    10
}

fn default_notify_capacity() -> usize {
    64
}

impl Settings {
    /// Load configuration from `config/autoclave.toml` and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/autoclave.toml")
    }

    /// Load configuration from a specific file path plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AUTOCLAVE_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings = Figment::new().merge(Toml::string(toml)).extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        is_not_empty(&self.link.port).or_else(|e| invalid(format!("link.port: {e}")))?;
        if self.link.baud_rate == 0 {
            return invalid("link.baud_rate must be greater than 0".into());
        }
        is_in_range(self.link.data_bits, 5..=8)
            .or_else(|e| invalid(format!("link.data_bits: {e}")))?;
        is_in_range(self.link.stop_bits, 1..=2)
            .or_else(|e| invalid(format!("link.stop_bits: {e}")))?;
        if self.link.timeout_ms == 0 {
            return invalid("link.timeout_ms must be greater than 0".into());
        }

        let acq = &self.acquisition;
        for (key, secs) in [
            ("sample_period_secs", acq.sample_period_secs),
            ("panel_period_secs", acq.panel_period_secs),
        ] {
            is_positive(secs)
                .and_then(|()| is_in_range(secs, f64::MIN_POSITIVE..=MAX_PERIOD_SECS))
                .or_else(|e| invalid(format!("acquisition.{key}: {e}")))?;
        }
        if acq.poll_quantum_ms == 0 {
            return invalid("acquisition.poll_quantum_ms must be greater than 0".into());
        }
        if acq.notify_capacity == 0 {
            return invalid("acquisition.notify_capacity must be greater than 0".into());
        }

        let n = self.channels.len();
        if n == 0 {
            return invalid("At least one channel must be configured".into());
        }
        is_in_range(acq.core_temp_channel, 1..=n)
            .or_else(|e| invalid(format!("acquisition.core_temp_channel: {e}")))?;
        is_in_range(acq.pressure_channel, 1..=n)
            .or_else(|e| invalid(format!("acquisition.pressure_channel: {e}")))?;

        for (i, channel) in self.channels.iter().enumerate() {
            is_in_range(channel.device_address, 1..=247)
                .or_else(|e| invalid(format!("channel {} device_address: {e}", i + 1)))?;
            is_in_range(channel.decimal_point, 0..=6)
                .or_else(|e| invalid(format!("channel {} decimal_point: {e}", i + 1)))?;
        }

        Ok(())
    }

    /// Zero-based index of the core temperature channel.
    pub fn core_temp_index(&self) -> usize {
        self.acquisition.core_temp_channel.saturating_sub(1)
    }

    /// Zero-based index of the pressure channel.
    pub fn pressure_index(&self) -> usize {
        self.acquisition.pressure_channel.saturating_sub(1)
    }

    /// One-based numbers of the polled channels.
    pub fn active_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, ch)| ch.active)
            .map(|(i, _)| i + 1)
            .collect()
    }
}

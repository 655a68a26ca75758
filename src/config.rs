//! Configuration System using Figment
//!
//! Strongly-typed configuration for the disc motor. Configuration is loaded from:
//! 1. a TOML file (default `config/disc_motion.toml`)
//! 2. environment variables prefixed with `DISC_MOTION_` (nested keys split on `__`)
//!
//! Every field carries a default, so an empty or missing file still yields a usable
//! configuration. Defaults are declared once, here.
//!
//! # Example
//! ```no_run
//! use disc_motion::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Port: {}", config.serial.port);
//! # Ok::<(), disc_motion::error::MotionError>(())
//! ```

use crate::error::{AppResult, MotionError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/disc_motion.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial link to the stepper controller
    pub serial: SerialConfig,
    /// Device protocol client settings
    pub driver: DriverConfig,
    /// `move_degrees` settle detection
    pub settle: SettleConfig,
    /// Ramped velocity controller
    pub ramp: RampConfig,
    /// Optional PID trim on measured RPM
    pub pid: Option<PidSettings>,
    /// Angle oscillation
    pub oscillation: OscillationConfig,
    /// Encoder-counter variant
    pub encoder: EncoderConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

/// Serial port settings. Must match the firmware framing exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port path (e.g. "/dev/ttyAMA0", "/dev/serial0")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Stop bits: 1 or 2 (8 data bits, no parity are fixed)
    pub stop_bits: u8,
    /// Read timeout for one line
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Write timeout for one line
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".to_string(),
            baud_rate: 921_600,
            stop_bits: 1,
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
        }
    }
}

/// Device protocol client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// BCM pin wired to the driver ENABLE input, if any
    pub enable_pin: Option<u8>,
    /// True if ENABLE is active high (DRV8825/A4988 are active low)
    pub enable_active_high: bool,
    /// How long one command waits for its ACK
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Bounded retries for stop commands
    pub stop_attempts: u32,
    /// Full steps (times microstepping) per revolution
    pub steps_per_revolution: u32,
    /// Pause after a transient read error before the reader retries
    #[serde(with = "humantime_serde")]
    pub reader_backoff: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enable_pin: None,
            enable_active_high: false,
            ack_timeout: Duration::from_millis(500),
            stop_attempts: 5,
            steps_per_revolution: 400,
            reader_backoff: Duration::from_millis(10),
        }
    }
}

/// Motion-settled heuristic for positional moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    /// |rpm| below this counts as a quiet sample
    pub epsilon_rpm: f64,
    /// Consecutive quiet samples required
    pub quiet_samples: u32,
    /// Spacing between telemetry polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            epsilon_rpm: 0.01,
            quiet_samples: 2,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Ramped velocity controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    /// Control tick period
    #[serde(with = "humantime_serde")]
    pub ts: Duration,
    /// Acceleration bound in RPM per second
    pub accel_rpm_s: f64,
    /// Hard ceiling on commanded |RPM|
    pub max_rpm: f64,
    /// Ramp back to zero before stopping
    pub soft_stop: bool,
    /// Abort the session after this many unacknowledged ticks in a row
    pub max_consecutive_ack_failures: Option<u32>,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            ts: Duration::from_millis(50),
            accel_rpm_s: 300.0,
            max_rpm: 700.0,
            soft_stop: true,
            max_consecutive_ack_failures: Some(20),
        }
    }
}

/// PID gains and output limits as stored in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PidSettings {
    /// Proportional gain
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Derivative gain
    pub kd: f64,
    /// Lower output limit
    pub min: Option<f64>,
    /// Upper output limit
    pub max: Option<f64>,
    /// Back-calculation tracking time constant; `None` means plain clamping
    pub tracking_time_s: Option<f64>,
}

impl Default for PidSettings {
    fn default() -> Self {
        Self {
            kp: 0.1,
            ki: 0.01,
            kd: 0.005,
            min: Some(-50.0),
            max: Some(50.0),
            tracking_time_s: Some(1.0),
        }
    }
}

/// Angle oscillation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscillationConfig {
    /// Safety margin added to one back-and-forth cycle
    pub cycle_margin: f64,
    /// Largest accepted amplitude in degrees
    pub max_angle_deg: f64,
    /// Stop-flag polling increment while waiting
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for OscillationConfig {
    fn default() -> Self {
        Self {
            cycle_margin: 0.03,
            max_angle_deg: 45.0,
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Encoder-counter RPM derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Counter ticks per revolution reported by the remote counter
    pub counts_per_revolution: f64,
    /// Extra multiplier applied to the derived RPM
    pub gearing_factor: f64,
    /// Interval at which status reads are issued
    #[serde(with = "humantime_serde")]
    pub ts: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            counts_per_revolution: 600.0,
            gearing_factor: 2.0,
            ts: Duration::from_millis(5),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path and environment variables.
    ///
    /// Environment variables override the file with prefix `DISC_MOTION_`.
    /// Example: `DISC_MOTION_SERIAL__PORT=/dev/ttyUSB0`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DISC_MOTION_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Render the configuration as TOML, in the same layout the loader reads.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| MotionError::Configuration(format!("cannot serialize configuration: {e}")))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(MotionError::Configuration(msg));

        if !matches!(self.serial.stop_bits, 1 | 2) {
            return invalid(format!(
                "serial.stop_bits must be 1 or 2, got {}",
                self.serial.stop_bits
            ));
        }
        if self.serial.baud_rate == 0 {
            return invalid("serial.baud_rate must be positive".into());
        }
        if self.driver.ack_timeout.is_zero() {
            return invalid("driver.ack_timeout must be positive".into());
        }
        if self.driver.stop_attempts == 0 {
            return invalid("driver.stop_attempts must be at least 1".into());
        }
        if self.driver.steps_per_revolution == 0 {
            return invalid("driver.steps_per_revolution must be positive".into());
        }
        if self.settle.quiet_samples == 0 || self.settle.epsilon_rpm <= 0.0 {
            return invalid("settle.quiet_samples and settle.epsilon_rpm must be positive".into());
        }
        if self.ramp.ts.is_zero() {
            return invalid("ramp.ts must be positive".into());
        }
        if self.ramp.accel_rpm_s <= 0.0 || self.ramp.max_rpm <= 0.0 {
            return invalid(format!(
                "ramp.accel_rpm_s ({}) and ramp.max_rpm ({}) must be positive",
                self.ramp.accel_rpm_s, self.ramp.max_rpm
            ));
        }
        if let Some(pid) = &self.pid {
            if let (Some(min), Some(max)) = (pid.min, pid.max) {
                if min > max {
                    return invalid(format!("pid.min ({min}) exceeds pid.max ({max})"));
                }
            }
            if matches!(pid.tracking_time_s, Some(tt) if tt <= 0.0) {
                return invalid("pid.tracking_time_s must be positive".into());
            }
        }
        if self.oscillation.cycle_margin < 0.0 || self.oscillation.max_angle_deg <= 0.0 {
            return invalid("oscillation margin must be >= 0 and max angle > 0".into());
        }
        if self.encoder.counts_per_revolution <= 0.0 || self.encoder.ts.is_zero() {
            return invalid("encoder.counts_per_revolution and encoder.ts must be positive".into());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return invalid(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.driver.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.settle.quiet_samples, 2);
        assert!((config.oscillation.cycle_margin - 0.03).abs() < f64::EPSILON);
        assert!(config.pid.is_none());
    }

    #[test]
    fn loads_partial_file_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [serial]
            port = "/dev/ttyUSB3"
            stop_bits = 2

            [driver]
            ack_timeout = "250ms"
            enable_pin = 17

            [pid]
            kp = 0.5
            ki = 0.2
            kd = 0.0
            min = 10.0
            max = 50.0
            "#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB3");
        assert_eq!(config.serial.stop_bits, 2);
        assert_eq!(config.serial.baud_rate, 921_600);
        assert_eq!(config.driver.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.driver.enable_pin, Some(17));

        let pid = config.pid.unwrap();
        assert_eq!(pid.kp, 0.5);
        assert_eq!(pid.min, Some(10.0));
    }

    #[test]
    fn rendered_toml_loads_back() {
        let mut config = AppConfig::default();
        config.ramp.ts = Duration::from_millis(20);
        config.pid = Some(PidSettings::default());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        let loaded = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(loaded.ramp.ts, Duration::from_millis(20));
        assert_eq!(loaded.pid.unwrap().tracking_time_s, Some(1.0));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from("/nonexistent/disc_motion.toml").unwrap();
        assert_eq!(config.ramp.max_rpm, 700.0);
    }

    #[test]
    fn rejects_bad_stop_bits() {
        let mut config = AppConfig::default();
        config.serial.stop_bits = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_pid_limits() {
        let config = AppConfig {
            pid: Some(PidSettings {
                min: Some(10.0),
                max: Some(-10.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());
    }
}

//! Configuration layering: TOML file first, `DISC_MOTION_` environment on top.
//!
//! These tests mutate process environment variables and therefore run serially.

use disc_motion::config::AppConfig;
use serial_test::serial;
use std::io::Write;
use std::time::Duration;

fn config_file(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = config_file(
        r#"
        [serial]
        port = "/dev/ttyAMA0"

        [ramp]
        max_rpm = 500.0
        "#,
    );

    std::env::set_var("DISC_MOTION_SERIAL__PORT", "/dev/ttyUSB0");
    std::env::set_var("DISC_MOTION_DRIVER__ACK_TIMEOUT", "750ms");
    let config = AppConfig::load_from(file.path());
    std::env::remove_var("DISC_MOTION_SERIAL__PORT");
    std::env::remove_var("DISC_MOTION_DRIVER__ACK_TIMEOUT");

    let config = config.unwrap();
    assert_eq!(config.serial.port, "/dev/ttyUSB0");
    assert_eq!(config.driver.ack_timeout, Duration::from_millis(750));
    assert_eq!(config.ramp.max_rpm, 500.0);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn file_values_apply_without_environment() {
    let file = config_file(
        r#"
        [oscillation]
        cycle_margin = 0.05
        poll_interval = "10ms"

        [logging]
        level = "debug"
        format = "json"
        "#,
    );

    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(config.serial.port, "/dev/ttyAMA0");
    assert_eq!(config.oscillation.poll_interval, Duration::from_millis(10));
    assert!((config.oscillation.cycle_margin - 0.05).abs() < f64::EPSILON);
    assert_eq!(config.logging.format, "json");
}

#[test]
#[serial]
fn invalid_environment_value_fails_extraction() {
    std::env::set_var("DISC_MOTION_SERIAL__BAUD_RATE", "fast");
    let result = AppConfig::load_from("/nonexistent/disc_motion.toml");
    std::env::remove_var("DISC_MOTION_SERIAL__BAUD_RATE");

    assert!(result.is_err());
}

#[test]
#[serial]
fn shipped_config_file_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/disc_motion.toml");
    let config = AppConfig::load_from(path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.serial.baud_rate, 921_600);
    assert!(config.pid.is_none());
}

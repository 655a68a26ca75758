//! Line protocol spoken by the stepper controller firmware.
//!
//! Every frame is one ASCII line terminated by `\n`:
//!
//! | Direction | Frame                | Meaning                                  |
//! |-----------|----------------------|------------------------------------------|
//! | host →    | `MODO:<n>`           | select operating mode                    |
//! | host →    | `SET:<value>`        | target for the current mode              |
//! | host →    | `VEL:<hz>`           | default velocity for positional moves    |
//! | host →    | `STOP:0`             | explicit stop                            |
//! | host →    | `GET`                | request one encoder status line          |
//! | ← device  | `ACK:<mode>:<echo>`  | acknowledgement of the last command      |
//! | ← device  | `STAT:<pos>:<rpm>`   | unsolicited telemetry                    |
//!
//! Anything else coming from the device is noise and is ignored by the reader.

use crate::error::{AppResult, MotionError};
use std::fmt;

/// Operating mode selected with `MODO:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotorMode {
    /// Relative move by an angle, then stop
    Positional,
    /// Signed RPM target
    ContinuousRpm,
    /// Signed step-rate target
    ContinuousHz,
    /// Stopped
    Stop,
    /// Bounded back-and-forth around the current position
    AngleOscillation,
}

impl MotorMode {
    /// Wire code of this mode.
    pub fn code(self) -> u8 {
        match self {
            MotorMode::Positional => 0,
            MotorMode::ContinuousRpm => 1,
            MotorMode::ContinuousHz => 2,
            MotorMode::Stop => 3,
            MotorMode::AngleOscillation => 4,
        }
    }

    /// Mode for a wire code.
    pub fn from_code(code: u8) -> AppResult<Self> {
        match code {
            0 => Ok(MotorMode::Positional),
            1 => Ok(MotorMode::ContinuousRpm),
            2 => Ok(MotorMode::ContinuousHz),
            3 => Ok(MotorMode::Stop),
            4 => Ok(MotorMode::AngleOscillation),
            other => Err(MotionError::InvalidParameter(format!(
                "unknown motor mode code {other}"
            ))),
        }
    }
}

/// A host-to-device command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// `MODO:<n>`
    SetMode(MotorMode),
    /// `SET:<value>`
    SetValue(f64),
    /// `VEL:<hz>`
    SetVelocity(f64),
    /// `STOP:0`
    Stop,
    /// `GET`
    Get,
}

impl Command {
    /// Encode as a single line without terminator.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetMode(mode) => write!(f, "MODO:{}", mode.code()),
            Command::SetValue(value) => write!(f, "SET:{}", format_value(*value)),
            Command::SetVelocity(hz) => write!(f, "VEL:{}", format_value(*hz)),
            Command::Stop => f.write_str("STOP:0"),
            Command::Get => f.write_str("GET"),
        }
    }
}

/// Shortest text that reads back as the same `f64`, never in exponent form,
/// so `atof` on the firmware side recovers every digit. Integral values carry
/// no fractional part.
fn format_value(value: f64) -> String {
    format!("{value}")
}

/// Acknowledgement line `ACK:<mode>:<echo>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Mode field as sent by the device
    pub mode: String,
    /// Echoed value or result, possibly empty
    pub echo: String,
}

/// Unsolicited `STAT:<pos_deg>:<rpm>` payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusFrame {
    /// Estimated position in degrees
    pub pos_deg: f64,
    /// Estimated speed in RPM
    pub rpm: f64,
}

/// Classification of one incoming line.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceLine {
    /// Acknowledgement of the last command
    Ack(Ack),
    /// Telemetry sample
    Status(StatusFrame),
    /// Anything else
    Noise,
}

const ACK_PREFIX: &str = "ACK:";
const STAT_PREFIX: &str = "STAT:";

/// Classify a raw line.
///
/// A `STAT:` line whose numbers do not parse is a protocol error. The reader
/// logs it and keeps going.
pub fn classify_line(line: &str) -> AppResult<DeviceLine> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(ACK_PREFIX) {
        let (mode, echo) = rest.split_once(':').unwrap_or((rest, ""));
        return Ok(DeviceLine::Ack(Ack {
            mode: mode.trim().to_string(),
            echo: echo.trim().to_string(),
        }));
    }
    if let Some(rest) = line.strip_prefix(STAT_PREFIX) {
        return parse_status(rest).map(DeviceLine::Status);
    }
    Ok(DeviceLine::Noise)
}

fn parse_status(payload: &str) -> AppResult<StatusFrame> {
    let mut fields = payload.split(':');
    let mut next_f64 = |name: &str| -> AppResult<f64> {
        let raw = fields
            .next()
            .ok_or_else(|| MotionError::Protocol(format!("STAT line missing {name}")))?;
        raw.trim().parse::<f64>().map_err(|e| {
            MotionError::Protocol(format!("STAT {name} '{raw}' is not a number: {e}"))
        })
    };
    let pos_deg = next_f64("position")?;
    let rpm = next_f64("rpm")?;
    Ok(StatusFrame { pos_deg, rpm })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_commands() {
        assert_eq!(Command::SetMode(MotorMode::ContinuousRpm).encode(), "MODO:1");
        assert_eq!(Command::SetMode(MotorMode::AngleOscillation).encode(), "MODO:4");
        assert_eq!(Command::SetValue(-120.0).encode(), "SET:-120");
        assert_eq!(Command::SetValue(12.5).encode(), "SET:12.5");
        assert_eq!(Command::SetVelocity(800.0).encode(), "VEL:800");
        assert_eq!(Command::Stop.encode(), "STOP:0");
        assert_eq!(Command::Get.encode(), "GET");
    }

    #[test]
    fn encoded_values_keep_every_digit() {
        assert_eq!(Command::SetValue(0.0004).encode(), "SET:0.0004");
        assert_eq!(Command::SetValue(-0.0004).encode(), "SET:-0.0004");
        assert_eq!(Command::SetVelocity(1234.56789).encode(), "VEL:1234.56789");

        let slow = 1e-9 * 400.0 / 60.0;
        let line = Command::SetVelocity(slow).encode();
        assert!(!line.contains('e'), "{line}");
        assert_eq!(line["VEL:".len()..].parse::<f64>().unwrap(), slow);
    }

    #[test]
    fn mode_codes_are_stable() {
        for code in 0..=4 {
            assert_eq!(MotorMode::from_code(code).unwrap().code(), code);
        }
        assert!(MotorMode::from_code(5).is_err());
    }

    #[test]
    fn classifies_ack_with_and_without_echo() {
        let line = classify_line("ACK:1:250\r").unwrap();
        assert_eq!(
            line,
            DeviceLine::Ack(Ack {
                mode: "1".into(),
                echo: "250".into()
            })
        );

        match classify_line("ACK:3").unwrap() {
            DeviceLine::Ack(ack) => {
                assert_eq!(ack.mode, "3");
                assert!(ack.echo.is_empty());
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn classifies_status() {
        let line = classify_line("STAT:90.5:-300.25").unwrap();
        assert_eq!(
            line,
            DeviceLine::Status(StatusFrame {
                pos_deg: 90.5,
                rpm: -300.25
            })
        );
    }

    #[test]
    fn malformed_status_is_protocol_error() {
        assert!(matches!(
            classify_line("STAT:abc:1"),
            Err(MotionError::Protocol(_))
        ));
        assert!(matches!(classify_line("STAT:1"), Err(MotionError::Protocol(_))));
    }

    #[test]
    fn other_lines_are_noise() {
        assert_eq!(classify_line("boot v1.2").unwrap(), DeviceLine::Noise);
        assert_eq!(classify_line("").unwrap(), DeviceLine::Noise);
    }
}

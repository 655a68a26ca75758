//! Encoder-counter variant of the controller.
//!
//! Older firmware has no telemetry stream. The host asks with `GET` and gets one
//! `|`-delimited status line back, for example
//!
//! ```text
//! RPM: 120.5 | COUNTER: 1834 | Dirección: CW
//! COU:1834 | Dir:CCW
//! ```
//!
//! When the line carries no `RPM:` field the speed is derived from the counter:
//! `(Δcounter / counts_per_revolution) * (60 / ts) * gearing_factor`. That is only
//! correct if `GET` is actually issued every `ts`.

use crate::config::EncoderConfig;
use crate::error::{AppResult, MotionError};
use crate::hardware::capabilities::LineTransport;
use crate::hardware::protocol::Command;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Coarse rotation direction reported by the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderDirection {
    /// Clockwise
    Cw,
    /// Counter-clockwise
    Ccw,
    /// Not reported or not recognised
    #[default]
    Unknown,
}

impl FromStr for EncoderDirection {
    type Err = MotionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CW" | "HORARIO" => Ok(Self::Cw),
            "CCW" | "ANTIHORARIO" => Ok(Self::Ccw),
            "UNKNOWN" | "" => Ok(Self::Unknown),
            other => Err(MotionError::Protocol(format!("unknown direction '{other}'"))),
        }
    }
}

/// One decoded encoder reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderReading {
    /// Speed in RPM
    pub rpm: f64,
    /// Raw counter value
    pub counter: i64,
    /// Direction label
    pub direction: EncoderDirection,
}

/// Running encoder state; keeps the previous counter for RPM derivation.
#[derive(Debug, Clone)]
pub struct EncoderState {
    counts_per_revolution: f64,
    gearing_factor: f64,
    ts: Duration,
    previous_counter: Option<i64>,
    reading: EncoderReading,
}

impl EncoderState {
    /// Fresh state for the given derivation constants.
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            counts_per_revolution: config.counts_per_revolution,
            gearing_factor: config.gearing_factor,
            ts: config.ts,
            previous_counter: None,
            reading: EncoderReading {
                rpm: 0.0,
                counter: 0,
                direction: EncoderDirection::Unknown,
            },
        }
    }

    /// Last decoded reading.
    pub fn reading(&self) -> EncoderReading {
        self.reading
    }

    /// RPM for a counter change over one sampling period.
    pub fn rpm_from_delta(&self, delta_counts: i64) -> f64 {
        (delta_counts as f64 / self.counts_per_revolution)
            * (60.0 / self.ts.as_secs_f64())
            * self.gearing_factor
    }

    /// Parse one status line and update the state.
    ///
    /// On a malformed line the state resets to zero speed, zero count and unknown
    /// direction, and the error is returned.
    pub fn update(&mut self, line: &str) -> AppResult<EncoderReading> {
        match self.parse(line) {
            Ok(reading) => {
                self.previous_counter = Some(reading.counter);
                self.reading = reading;
                Ok(reading)
            }
            Err(e) => {
                self.reading = EncoderReading {
                    rpm: 0.0,
                    counter: 0,
                    direction: EncoderDirection::Unknown,
                };
                self.previous_counter = None;
                Err(e)
            }
        }
    }

    fn parse(&self, line: &str) -> AppResult<EncoderReading> {
        let mut rpm = None;
        let mut counter = None;
        let mut direction = self.reading.direction;

        for part in line.split('|').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once(':')
                .ok_or_else(|| MotionError::Protocol(format!("field without ':' in '{part}'")))?;
            let value = value.trim();
            match key.trim() {
                "RPM" => rpm = Some(parse_number::<f64>("RPM", value)?),
                "COUNTER" | "COU" => counter = Some(parse_number::<i64>("counter", value)?),
                "Dir" | "Dirección" | "Direccion" => direction = value.parse()?,
                other => debug!(field = other, "Ignoring encoder field"),
            }
        }

        if rpm.is_none() && counter.is_none() {
            return Err(MotionError::Protocol(format!(
                "no RPM or counter in encoder line '{line}'"
            )));
        }

        let counter = counter.unwrap_or(self.reading.counter);
        let rpm = match (rpm, self.previous_counter) {
            (Some(rpm), _) => rpm,
            (None, Some(previous)) => self.rpm_from_delta(counter - previous),
            (None, None) => 0.0,
        };

        Ok(EncoderReading {
            rpm,
            counter,
            direction,
        })
    }
}

fn parse_number<T: FromStr>(field: &str, value: &str) -> AppResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| MotionError::Protocol(format!("{field} '{value}': {e}")))
}

/// Polls the counter with `GET` over a line transport.
pub struct EncoderReader {
    transport: Arc<dyn LineTransport>,
    state: EncoderState,
    response_timeout: Duration,
}

impl EncoderReader {
    /// Reader on `transport`, waiting at most `response_timeout` per request.
    pub fn new(
        transport: Arc<dyn LineTransport>,
        config: &EncoderConfig,
        response_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            state: EncoderState::new(config),
            response_timeout,
        }
    }

    /// One `GET` exchange. `Ok(None)` if the counter did not answer in time.
    pub async fn read(&mut self) -> AppResult<Option<EncoderReading>> {
        self.transport.send_line(&Command::Get.encode()).await?;
        let Some(line) = self.transport.read_line(self.response_timeout).await? else {
            warn!("Encoder did not answer GET");
            return Ok(None);
        };
        self.state.update(&line).map(Some)
    }

    /// Last decoded reading.
    pub fn reading(&self) -> EncoderReading {
        self.state.reading()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> EncoderState {
        EncoderState::new(&EncoderConfig::default())
    }

    #[test]
    fn parses_full_status_line() {
        let mut state = state();
        let reading = state
            .update("RPM: 120.5 | COUNTER: 1834 | Dirección: CW")
            .unwrap();
        assert_eq!(reading.rpm, 120.5);
        assert_eq!(reading.counter, 1834);
        assert_eq!(reading.direction, EncoderDirection::Cw);
    }

    #[test]
    fn derives_rpm_from_counter_delta() {
        let mut state = state();
        state.update("COU:1000 | Dir:CCW").unwrap();
        let reading = state.update("COU:1010 | Dir:CCW").unwrap();

        // (10 / 600) * (60 / 0.005) * 2 = 400
        assert!((reading.rpm - 400.0).abs() < 1e-9);
        assert_eq!(reading.direction, EncoderDirection::Ccw);
    }

    #[test]
    fn first_counter_sample_has_zero_rpm() {
        let mut state = state();
        assert_eq!(state.update("COU:55").unwrap().rpm, 0.0);
    }

    #[test]
    fn parse_failure_resets_state() {
        let mut state = state();
        state.update("RPM: 50 | COUNTER: 99 | Dir: CW").unwrap();

        assert!(matches!(
            state.update("RPM: fast | COUNTER: 100"),
            Err(MotionError::Protocol(_))
        ));
        let reading = state.reading();
        assert_eq!(reading.rpm, 0.0);
        assert_eq!(reading.counter, 0);
        assert_eq!(reading.direction, EncoderDirection::Unknown);
    }

    #[test]
    fn derivation_constants_are_configurable() {
        let config = EncoderConfig {
            counts_per_revolution: 1200.0,
            gearing_factor: 1.0,
            ts: Duration::from_millis(100),
        };
        let state = EncoderState::new(&config);
        // (120 / 1200) * (60 / 0.1) * 1 = 60
        assert!((state.rpm_from_delta(120) - 60.0).abs() < 1e-9);
    }
}

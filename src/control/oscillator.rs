//! Open-loop angle oscillation.
//!
//! The firmware's oscillation mode swings the disc ±angle around its current
//! position. The host only selects the mode, sets velocity and amplitude, then
//! waits for the requested number of cycles. There is no encoder feedback.
//!
//! One full back-and-forth cycle covers `4·|angle|` degrees:
//!
//! ```text
//! T_cycle = 4·|angle| / (speed_hz · 360 / steps_per_revolution) · (1 + margin)
//! ```
//!
//! The device always receives exactly one final `stop()`, whether the wait
//! finished, was cancelled, or a command failed.

use crate::config::AppConfig;
use crate::control::stop_signal::StopSignal;
use crate::error::{AppResult, MotionError};
use crate::hardware::capabilities::StepperDevice;
use crate::hardware::protocol::MotorMode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long to keep oscillating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscillationLength {
    /// One cycle
    Single,
    /// `n` cycles
    Cycles(u32),
    /// Until the stop signal is set
    Continuous,
}

/// Inputs for one oscillation run.
#[derive(Debug, Clone, PartialEq)]
pub struct OscillationParams {
    /// Amplitude in degrees, must be positive
    pub angle_deg: f64,
    /// Motor speed in RPM
    pub rpm: f64,
    /// Steps per revolution configured in the firmware
    pub steps_per_revolution: u32,
    /// Run length
    pub length: OscillationLength,
    /// Safety margin on each cycle (0.03 = 3 %)
    pub cycle_margin: f64,
    /// Amplitudes above this are clamped
    pub max_angle_deg: f64,
    /// Stop-signal polling increment while waiting
    pub poll_interval: Duration,
}

impl OscillationParams {
    /// One cycle of `angle_deg` at `rpm`, other values from configuration.
    pub fn from_config(config: &AppConfig, angle_deg: f64, rpm: f64) -> Self {
        Self {
            angle_deg,
            rpm,
            steps_per_revolution: config.driver.steps_per_revolution,
            length: OscillationLength::Single,
            cycle_margin: config.oscillation.cycle_margin,
            max_angle_deg: config.oscillation.max_angle_deg,
            poll_interval: config.oscillation.poll_interval,
        }
    }

    /// Run `n` cycles.
    pub fn with_cycles(mut self, n: u32) -> Self {
        self.length = OscillationLength::Cycles(n);
        self
    }

    /// Run until stopped.
    pub fn continuous(mut self) -> Self {
        self.length = OscillationLength::Continuous;
        self
    }

    /// Step rate for the requested RPM.
    pub fn speed_hz(&self) -> f64 {
        self.rpm.abs() * f64::from(self.steps_per_revolution) / 60.0
    }

    /// Amplitude after clamping to `max_angle_deg`.
    pub fn effective_angle(&self) -> f64 {
        self.angle_deg.abs().min(self.max_angle_deg)
    }

    /// Duration of one back-and-forth cycle including the margin.
    ///
    /// Fails when the result is negative or does not fit in a `Duration`.
    pub fn cycle_duration(&self) -> AppResult<Duration> {
        let deg_per_s = self.speed_hz() * 360.0 / f64::from(self.steps_per_revolution);
        let seconds = 4.0 * self.effective_angle() / deg_per_s * (1.0 + self.cycle_margin);
        Duration::try_from_secs_f64(seconds).map_err(|e| {
            MotionError::InvalidParameter(format!(
                "oscillation cycle of {seconds} s is not representable: {e}"
            ))
        })
    }

    /// Total wait for a bounded run, `None` for continuous.
    pub fn total_duration(&self) -> AppResult<Option<Duration>> {
        let cycle = self.cycle_duration()?;
        match self.length {
            OscillationLength::Single => Ok(Some(cycle)),
            OscillationLength::Cycles(n) => cycle.checked_mul(n).map(Some).ok_or_else(|| {
                MotionError::InvalidParameter(format!(
                    "{n} cycles of {cycle:?} overflow the wait time"
                ))
            }),
            OscillationLength::Continuous => Ok(None),
        }
    }

    fn validate(&self) -> AppResult<()> {
        if !self.angle_deg.is_finite() || self.angle_deg <= 0.0 {
            return Err(MotionError::InvalidParameter(format!(
                "oscillation angle must be positive, got {}",
                self.angle_deg
            )));
        }
        if self.steps_per_revolution == 0 || !self.rpm.is_finite() || self.speed_hz() <= 0.0 {
            return Err(MotionError::InvalidParameter(format!(
                "oscillation speed must be positive, got {} RPM",
                self.rpm
            )));
        }
        self.total_duration().map(|_| ())
    }
}

/// Summary of an oscillation run.
#[derive(Debug, Clone, PartialEq)]
pub struct OscillationRun {
    /// Amplitude actually commanded
    pub angle_deg: f64,
    /// Step rate actually commanded
    pub speed_hz: f64,
    /// Length of one cycle
    pub cycle: Duration,
    /// Time spent waiting
    pub elapsed: Duration,
    /// Whether the stop signal cut the wait short
    pub cancelled: bool,
    /// Whether all three setup commands were acknowledged
    pub acknowledged: bool,
    /// Whether the final stop was acknowledged
    pub stop_acknowledged: bool,
}

/// Runs oscillations on one device.
pub struct AngleOscillator {
    device: Arc<dyn StepperDevice>,
}

impl AngleOscillator {
    /// Oscillator for `device`.
    pub fn new(device: Arc<dyn StepperDevice>) -> Self {
        Self { device }
    }

    /// Configure the oscillation, wait, then stop the device.
    ///
    /// Invalid parameters are rejected before any setup command is sent; the
    /// device is still told to stop.
    pub async fn run(
        &self,
        params: &OscillationParams,
        stop: &StopSignal,
    ) -> AppResult<OscillationRun> {
        if let Err(e) = params.validate() {
            warn!(error = %e, "Rejected oscillation request");
            if let Err(stop_err) = self.device.stop().await {
                warn!(error = %stop_err, "Stop after rejected oscillation failed");
            }
            return Err(e);
        }

        let angle = params.effective_angle();
        if angle < params.angle_deg {
            warn!(
                requested = params.angle_deg,
                max = params.max_angle_deg,
                "Oscillation angle clamped"
            );
        }

        let result = self.oscillate(params, angle, stop).await;

        let stop_acknowledged = match self.device.stop().await {
            Ok(acked) => acked,
            Err(e) => {
                warn!(error = %e, "Stop after oscillation failed");
                if result.is_ok() {
                    return Err(e);
                }
                false
            }
        };

        let mut run = result?;
        run.stop_acknowledged = stop_acknowledged;
        info!(
            cancelled = run.cancelled,
            elapsed = ?run.elapsed,
            "Oscillation finished"
        );
        Ok(run)
    }

    async fn oscillate(
        &self,
        params: &OscillationParams,
        angle: f64,
        stop: &StopSignal,
    ) -> AppResult<OscillationRun> {
        let speed_hz = params.speed_hz();
        let cycle = params.cycle_duration()?;
        let total = params.total_duration()?;
        debug!(angle, speed_hz, cycle = ?cycle, length = ?params.length, "Starting oscillation");

        let mut acknowledged = self.device.set_mode(MotorMode::AngleOscillation).await?;
        acknowledged &= self.device.set_default_velocity(speed_hz).await?;
        acknowledged &= self.device.set_value(angle).await?;
        if !acknowledged {
            warn!("Oscillation setup not fully acknowledged");
        }

        let started = Instant::now();
        let cancelled = match total {
            Some(total) => wait_polling(total, params.poll_interval, stop).await,
            None => {
                stop.cancelled().await;
                true
            }
        };

        Ok(OscillationRun {
            angle_deg: angle,
            speed_hz,
            cycle,
            elapsed: started.elapsed(),
            cancelled,
            acknowledged,
            stop_acknowledged: false,
        })
    }
}

/// Wait `total` in `poll` increments. Returns `true` if the stop signal fired.
async fn wait_polling(total: Duration, poll: Duration, stop: &StopSignal) -> bool {
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= total {
            return false;
        }
        let step = poll.min(total - elapsed);
        if stop.sleep(step).await {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(angle: f64, rpm: f64) -> OscillationParams {
        OscillationParams::from_config(&AppConfig::default(), angle, rpm)
    }

    #[test]
    fn cycle_duration_matches_reference_point() {
        // 120 RPM at 400 steps/rev = 800 Hz = 720 deg/s
        let p = params(30.0, 120.0);
        assert!((p.speed_hz() - 800.0).abs() < 1e-9);
        let cycle = p.cycle_duration().unwrap().as_secs_f64();
        assert!((cycle - 4.0 * 30.0 / 720.0 * 1.03).abs() < 1e-9);
        assert!((cycle - 0.1717).abs() < 1e-3);
    }

    #[test]
    fn angle_is_clamped() {
        let p = params(90.0, 120.0);
        assert_eq!(p.effective_angle(), 45.0);
    }

    #[test]
    fn rejects_non_positive_angle_and_zero_speed() {
        assert!(params(0.0, 120.0).validate().is_err());
        assert!(params(-10.0, 120.0).validate().is_err());
        assert!(params(10.0, 0.0).validate().is_err());
        assert!(params(10.0, 60.0).validate().is_ok());
    }

    #[test]
    fn unrepresentable_waits_fail_validation() {
        // Each cycle lasts centuries, u32::MAX of them overflow a Duration
        let slow = params(30.0, 1e-9).with_cycles(u32::MAX);
        assert!(slow.cycle_duration().is_ok());
        assert!(matches!(slow.validate(), Err(MotionError::InvalidParameter(_))));

        let mut shrinking = params(30.0, 120.0);
        shrinking.cycle_margin = -2.0;
        assert!(shrinking.validate().is_err());

        assert_eq!(params(30.0, 120.0).continuous().total_duration().unwrap(), None);
    }
}

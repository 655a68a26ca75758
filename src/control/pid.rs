//! Discrete PID controller with back-calculation anti-windup.
//!
//! The update order inside [`PidController::compute`] is fixed:
//!
//! 1. error = setpoint − measurement
//! 2. P from the error
//! 3. D from the *previous* error (zero on the first call or when dt ≤ 0)
//! 4. integrate error·dt
//! 5. unsaturated output u = P + ki·∫ + D, clamp to u_sat
//! 6. back-calculate: ∫ += (u_sat − u) / (ki·Tt) · dt (dt > 0, ki ≠ 0, Tt set)
//! 7. recompute the output from the corrected integral and clamp again
//! 8. store error and time for the next call
//!
//! Without a tracking time constant the controller only clamps, and the
//! integral keeps growing while the output is saturated.
//!
//! # Example
//!
//! ```
//! use disc_motion::control::pid::{PidConfig, PidController};
//! use std::time::Duration;
//!
//! let config = PidConfig::new(0.5, 0.2, 0.0)
//!     .with_setpoint(300.0)
//!     .with_output_limits(Some(-50.0), Some(50.0))
//!     .with_sample_time(Duration::from_millis(50))
//!     .with_tracking_time(1.0);
//! let mut pid = PidController::new(config);
//! let correction = pid.compute(280.0, None);
//! assert!(correction > 0.0);
//! ```

use crate::config::PidSettings;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Gains, limits and timing for a [`PidController`].
#[derive(Debug, Clone, PartialEq)]
pub struct PidConfig {
    kp: f64,
    ki: f64,
    kd: f64,
    setpoint: f64,
    lower: Option<f64>,
    upper: Option<f64>,
    sample_time: Option<Duration>,
    tracking_time: Option<f64>,
}

impl PidConfig {
    /// Gains only: setpoint 0, unbounded output, measured dt, plain clamping.
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            setpoint: 0.0,
            lower: None,
            upper: None,
            sample_time: None,
            tracking_time: None,
        }
    }

    /// Build from the `[pid]` settings section.
    pub fn from_settings(settings: &PidSettings) -> Self {
        let config = Self::new(settings.kp, settings.ki, settings.kd)
            .with_output_limits(settings.min, settings.max);
        match settings.tracking_time_s {
            Some(tt) => config.with_tracking_time(tt),
            None => config,
        }
    }

    /// Target value.
    pub fn with_setpoint(mut self, setpoint: f64) -> Self {
        self.setpoint = setpoint;
        self
    }

    /// Output bounds; either side may be open.
    pub fn with_output_limits(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    /// Use a fixed dt instead of measuring time between calls.
    pub fn with_sample_time(mut self, ts: Duration) -> Self {
        self.sample_time = Some(ts);
        self
    }

    /// Enable back-calculation with tracking time constant `tt` seconds.
    pub fn with_tracking_time(mut self, tt: f64) -> Self {
        self.tracking_time = Some(tt);
        self
    }
}

/// PID controller state for one control session.
#[derive(Debug, Clone)]
pub struct PidController {
    config: PidConfig,
    integral: f64,
    last_error: Option<f64>,
    last_time: Option<Instant>,
}

impl PidController {
    /// Fresh controller.
    pub fn new(config: PidConfig) -> Self {
        let saturates = config.lower.is_some() || config.upper.is_some();
        if saturates && config.ki != 0.0 && config.tracking_time.is_none() {
            warn!("PID has output limits but no tracking time; using plain clamping");
        }
        Self {
            config,
            integral: 0.0,
            last_error: None,
            last_time: None,
        }
    }

    /// One controller update.
    ///
    /// `now` defaults to the current time; it only matters without a fixed sample time.
    pub fn compute(&mut self, measurement: f64, now: Option<Instant>) -> f64 {
        let now = now.unwrap_or_else(Instant::now);
        let c = &self.config;

        let error = c.setpoint - measurement;
        let dt = match (c.sample_time, self.last_time) {
            (Some(ts), _) => ts.as_secs_f64(),
            (None, Some(last)) => now.saturating_duration_since(last).as_secs_f64(),
            (None, None) => 0.0,
        };

        let p = c.kp * error;
        let d = match self.last_error {
            Some(last_error) if dt > 0.0 => c.kd * (error - last_error) / dt,
            _ => 0.0,
        };

        if dt > 0.0 {
            self.integral += error * dt;
        }

        let unsaturated = p + c.ki * self.integral + d;
        let mut output = self.clamp(unsaturated);

        if let Some(tt) = c.tracking_time {
            if dt > 0.0 && c.ki != 0.0 && output != unsaturated {
                self.integral += (output - unsaturated) / (c.ki * tt) * dt;
                output = self.clamp(p + c.ki * self.integral + d);
            }
        }

        self.last_error = Some(error);
        self.last_time = Some(now);
        output
    }

    fn clamp(&self, value: f64) -> f64 {
        let mut value = value;
        if let Some(lower) = self.config.lower {
            value = value.max(lower);
        }
        if let Some(upper) = self.config.upper {
            value = value.min(upper);
        }
        value
    }

    /// Change the target without resetting state.
    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.config.setpoint = setpoint;
    }

    /// Current target.
    pub fn setpoint(&self) -> f64 {
        self.config.setpoint
    }

    /// Raw integral accumulator (before the ki gain).
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Forget integral, previous error and previous time.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.last_time = None;
    }
}

//! Ramped velocity controller.
//!
//! Moves the commanded RPM toward the target by at most `accel_rpm_s · ts` per
//! tick instead of stepping straight to it. The current value is sent every
//! tick, changed or not, which keeps the firmware watchdog fed.
//!
//! ```text
//! Starting ─► RampingUp ─► Holding ─┬─► RampingDown ─► Stopped   (soft stop)
//!                                   └────────────────► Stopped
//! ```
//!
//! The loop leaves `RampingUp`/`Holding` when the stop signal is set, the time
//! budget runs out or the stop predicate returns true. Whatever happens, the
//! device receives a final `stop()`.

use crate::config::RampConfig;
use crate::control::pid::{PidConfig, PidController};
use crate::control::stop_signal::StopSignal;
use crate::error::{AppResult, MotionError};
use crate::hardware::capabilities::StepperDevice;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Rotation direction. Clockwise is positive RPM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Clockwise
    Cw,
    /// Counter-clockwise
    Ccw,
}

impl Direction {
    /// +1 for CW, −1 for CCW.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Cw => 1.0,
            Direction::Ccw => -1.0,
        }
    }
}

impl FromStr for Direction {
    type Err = MotionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CW" => Ok(Direction::Cw),
            "CCW" => Ok(Direction::Ccw),
            other => Err(MotionError::InvalidParameter(format!(
                "direction must be CW or CCW, got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Cw => "CW",
            Direction::Ccw => "CCW",
        })
    }
}

/// Bounded-rate approach of a commanded value toward a target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampState {
    current: f64,
    target: f64,
    step: f64,
}

impl RampState {
    /// Start at `current`, heading for `target`, moving at most `accel_rpm_s · ts` per tick.
    pub fn new(current: f64, target: f64, accel_rpm_s: f64, ts: Duration) -> Self {
        Self {
            current,
            target,
            step: accel_rpm_s * ts.as_secs_f64(),
        }
    }

    /// Advance one tick and return the new commanded value.
    pub fn tick(&mut self) -> f64 {
        let gap = self.target - self.current;
        if gap.abs() <= self.step {
            self.current = self.target;
        } else {
            self.current += self.step.copysign(gap);
        }
        self.current
    }

    /// Commanded value.
    pub fn current(&self) -> f64 {
        self.current
    }

    /// Target value.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Largest change per tick.
    pub fn step(&self) -> f64 {
        self.step
    }

    /// Whether the target has been reached.
    pub fn at_target(&self) -> bool {
        self.current == self.target
    }

    /// Ticks needed to reach the target from here.
    pub fn ticks_remaining(&self) -> u64 {
        if self.step <= 0.0 {
            return if self.at_target() { 0 } else { u64::MAX };
        }
        ((self.target - self.current).abs() / self.step).ceil() as u64
    }
}

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampPhase {
    /// Reading the starting speed
    Starting,
    /// Moving toward the target
    RampingUp,
    /// At the target
    Holding,
    /// Soft stop in progress
    RampingDown,
    /// Device stop issued
    Stopped,
}

/// Why the control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop signal was set
    Signal,
    /// The time budget ran out
    TimeBudget,
    /// The stop predicate returned true
    Predicate,
}

/// External condition that ends the session when it returns true.
pub type StopPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Inputs for one ramped spin.
#[derive(Clone)]
pub struct RampParams {
    /// Requested direction
    pub direction: Direction,
    /// Requested speed magnitude in RPM (clamped to `max_rpm`)
    pub rpm: f64,
    /// Tick period
    pub ts: Duration,
    /// Acceleration bound in RPM/s
    pub accel_rpm_s: f64,
    /// Ceiling on |commanded RPM|
    pub max_rpm: f64,
    /// Ramp to zero before the final stop
    pub soft_stop: bool,
    /// End the loop after this long
    pub time_budget: Option<Duration>,
    /// End the loop when this returns true
    pub stop_predicate: Option<StopPredicate>,
    /// PID trim on measured RPM, setpoint follows the ramp
    pub pid: Option<PidConfig>,
    /// Fail with `DeviceUnresponsive` after this many unacknowledged ticks in a row
    pub max_consecutive_ack_failures: Option<u32>,
}

impl RampParams {
    /// Parameters from the `[ramp]` section for one spin request.
    pub fn from_config(config: &RampConfig, direction: Direction, rpm: f64) -> Self {
        Self {
            direction,
            rpm,
            ts: config.ts,
            accel_rpm_s: config.accel_rpm_s,
            max_rpm: config.max_rpm,
            soft_stop: config.soft_stop,
            time_budget: None,
            stop_predicate: None,
            pid: None,
            max_consecutive_ack_failures: config.max_consecutive_ack_failures,
        }
    }

    /// Stop after `budget`.
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    /// Stop when `predicate` returns true.
    pub fn with_stop_predicate(mut self, predicate: StopPredicate) -> Self {
        self.stop_predicate = Some(predicate);
        self
    }

    /// Trim the command with a PID loop on measured RPM.
    pub fn with_pid(mut self, pid: PidConfig) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Signed, clamped target.
    pub fn signed_target(&self) -> f64 {
        self.direction.sign() * self.rpm.abs().min(self.max_rpm)
    }

    fn validate(&self) -> AppResult<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if self.ts.is_zero() || !positive(self.accel_rpm_s) || !positive(self.max_rpm) {
            return Err(MotionError::InvalidParameter(format!(
                "ramp needs ts > 0, accel > 0 and max_rpm > 0 (ts={:?}, accel={}, max={})",
                self.ts, self.accel_rpm_s, self.max_rpm
            )));
        }
        if !self.rpm.is_finite() {
            return Err(MotionError::InvalidParameter(format!(
                "rpm must be finite, got {}",
                self.rpm
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for RampParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RampParams")
            .field("direction", &self.direction)
            .field("rpm", &self.rpm)
            .field("ts", &self.ts)
            .field("accel_rpm_s", &self.accel_rpm_s)
            .field("max_rpm", &self.max_rpm)
            .field("soft_stop", &self.soft_stop)
            .field("time_budget", &self.time_budget)
            .field("stop_predicate", &self.stop_predicate.is_some())
            .field("pid", &self.pid)
            .field("max_consecutive_ack_failures", &self.max_consecutive_ack_failures)
            .finish()
    }
}

/// Result of a completed session.
#[derive(Debug, Clone, PartialEq)]
pub struct RampOutcome {
    /// Why the loop ended
    pub reason: StopReason,
    /// Control ticks sent before the loop ended (ramp-down not included)
    pub ticks: u64,
    /// Unacknowledged commands over the whole session
    pub ack_failures: u64,
    /// Last RPM commanded before the final stop
    pub last_command: f64,
    /// Whether the final stop was acknowledged
    pub stop_acknowledged: bool,
    /// Always `Stopped`
    pub phase: RampPhase,
}

struct AckTracker {
    consecutive: u32,
    total: u64,
    limit: Option<u32>,
}

impl AckTracker {
    fn record(&mut self, acked: bool) -> AppResult<()> {
        if acked {
            self.consecutive = 0;
            return Ok(());
        }
        self.consecutive += 1;
        self.total += 1;
        match self.limit {
            Some(limit) if self.consecutive >= limit => Err(MotionError::DeviceUnresponsive {
                consecutive_failures: self.consecutive,
            }),
            _ => Ok(()),
        }
    }
}

struct RampRun<'a> {
    device: &'a dyn StepperDevice,
    params: &'a RampParams,
    ramp: RampState,
    pid: Option<PidController>,
    phase: RampPhase,
    acks: AckTracker,
    ticks: u64,
    last_command: f64,
}

impl RampRun<'_> {
    fn enter(&mut self, phase: RampPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, rpm = self.ramp.current(), "Ramp phase");
            self.phase = phase;
        }
    }

    /// Ramp value plus PID correction. The result still moves at most one
    /// ramp step away from the last command sent.
    fn trimmed(&mut self, commanded: f64) -> f64 {
        let Some(pid) = self.pid.as_mut() else {
            return commanded;
        };
        pid.set_setpoint(commanded);
        let correction = pid.compute(self.device.status().rpm, None);
        let step = self.ramp.step();
        (commanded + correction)
            .clamp(self.last_command - step, self.last_command + step)
            .clamp(-self.params.max_rpm, self.params.max_rpm)
    }

    async fn send(&mut self, rpm: f64) -> AppResult<()> {
        let acked = self.device.run_rpm(rpm).await?;
        self.last_command = rpm;
        self.acks.record(acked)
    }

    async fn run(&mut self, stop: &StopSignal) -> AppResult<StopReason> {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.params.ts);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => return Ok(StopReason::Signal),
                _ = ticker.tick() => {}
            }
            if let Some(budget) = self.params.time_budget {
                if started.elapsed() >= budget {
                    return Ok(StopReason::TimeBudget);
                }
            }
            if let Some(predicate) = &self.params.stop_predicate {
                if predicate() {
                    return Ok(StopReason::Predicate);
                }
            }

            let commanded = self.ramp.tick();
            self.enter(if self.ramp.at_target() {
                RampPhase::Holding
            } else {
                RampPhase::RampingUp
            });
            let command = self.trimmed(commanded);
            self.send(command).await?;
            self.ticks += 1;
        }
    }

    async fn ramp_down(&mut self) -> AppResult<()> {
        self.enter(RampPhase::RampingDown);
        // The PID trim can leave the last command off the ramp value
        self.ramp = RampState::new(
            self.last_command,
            0.0,
            self.params.accel_rpm_s,
            self.params.ts,
        );
        let mut ticker = tokio::time::interval(self.params.ts);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.ramp.at_target() {
            ticker.tick().await;
            let commanded = self.ramp.tick();
            self.send(commanded).await?;
        }
        Ok(())
    }
}

/// Run one ramped spin until stopped, then bring the device to rest.
///
/// The starting point is the speed the device reports on entry, so a motor that
/// is already turning is not jerked to zero. A transport error or an exhausted
/// ACK budget aborts the session; a device stop is still attempted and the
/// first error is returned.
pub async fn spin_ramped(
    device: &dyn StepperDevice,
    params: &RampParams,
    stop: &StopSignal,
) -> AppResult<RampOutcome> {
    if let Err(e) = params.validate() {
        warn!(error = %e, "Rejected spin request");
        let _ = device.stop().await;
        return Err(e);
    }

    let reported = device.status().rpm;
    let start_rpm = if reported.is_finite() { reported } else { 0.0 };
    let target = params.signed_target();
    info!(
        direction = %params.direction,
        target,
        start_rpm,
        accel = params.accel_rpm_s,
        "Starting ramped spin"
    );

    let mut session = RampRun {
        device,
        params,
        ramp: RampState::new(start_rpm, target, params.accel_rpm_s, params.ts),
        pid: params
            .pid
            .clone()
            .map(|config| PidController::new(config.with_sample_time(params.ts))),
        phase: RampPhase::Starting,
        acks: AckTracker {
            consecutive: 0,
            total: 0,
            limit: params.max_consecutive_ack_failures,
        },
        ticks: 0,
        last_command: start_rpm,
    };

    let mut result = session.run(stop).await;
    if let Ok(reason) = &result {
        debug!(?reason, ticks = session.ticks, "Ramp loop finished");
        if params.soft_stop {
            if let Err(e) = session.ramp_down().await {
                result = Err(e);
            }
        }
    }

    if let Err(e) = &result {
        error!(error = %e, ticks = session.ticks, "Ramped spin aborted");
    }

    let stop_acknowledged = match device.stop().await {
        Ok(acked) => acked,
        Err(e) => {
            warn!(error = %e, "Final stop failed");
            if result.is_ok() {
                result = Err(e);
            }
            false
        }
    };
    session.enter(RampPhase::Stopped);

    let reason = result?;
    info!(?reason, ticks = session.ticks, ack_failures = session.acks.total, "Motor stopped");
    Ok(RampOutcome {
        reason,
        ticks: session.ticks,
        ack_failures: session.acks.total,
        last_command: session.last_command,
        stop_acknowledged,
        phase: session.phase,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCall, MockStepper};

    #[test]
    fn ramp_is_monotonic_and_reaches_target_exactly() {
        for (start, target) in [(0.0, 300.0), (100.0, -250.0), (-40.0, -40.0), (620.0, 10.0)] {
            let mut ramp = RampState::new(start, target, 300.0, Duration::from_millis(50));
            let expected_ticks = ramp.ticks_remaining();
            let mut previous = start;
            let mut ticks = 0;
            while !ramp.at_target() {
                let next = ramp.tick();
                ticks += 1;
                assert!((next - previous).abs() <= ramp.step() + 1e-9);
                assert!((target - next).abs() <= (target - previous).abs());
                previous = next;
            }
            assert_eq!(ramp.current(), target);
            assert_eq!(ticks, expected_ticks);
        }
    }

    #[test]
    fn target_is_clamped_and_signed() {
        let params = RampParams::from_config(&RampConfig::default(), Direction::Ccw, 900.0);
        assert_eq!(params.signed_target(), -700.0);
    }

    #[test]
    fn direction_parsing() {
        assert_eq!("cw".parse::<Direction>().unwrap(), Direction::Cw);
        assert_eq!(" CCW ".parse::<Direction>().unwrap(), Direction::Ccw);
        assert!("left".parse::<Direction>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn time_budget_ends_session_with_soft_stop() {
        let motor = MockStepper::new();
        let params = RampParams::from_config(&RampConfig::default(), Direction::Cw, 60.0)
            .with_time_budget(Duration::from_secs(1));

        let outcome = spin_ramped(&motor, &params, &StopSignal::new()).await.unwrap();

        assert_eq!(outcome.reason, StopReason::TimeBudget);
        assert_eq!(outcome.phase, RampPhase::Stopped);
        let commands = motor.rpm_commands();
        // 15 RPM per tick: 15, 30, 45, 60, then holding
        assert_eq!(&commands[..5], &[15.0, 30.0, 45.0, 60.0, 60.0]);
        assert_eq!(commands.last(), Some(&0.0));
        assert_eq!(motor.calls().last(), Some(&MockCall::Stop));
        assert_eq!(motor.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn starts_from_reported_speed() {
        let motor = MockStepper::spinning_at(200.0);
        let params = RampParams::from_config(&RampConfig::default(), Direction::Cw, 260.0)
            .with_time_budget(Duration::from_millis(120));

        spin_ramped(&motor, &params, &StopSignal::new()).await.unwrap();
        assert_eq!(motor.rpm_commands()[0], 215.0);
    }
}

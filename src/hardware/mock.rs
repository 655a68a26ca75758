//! Mock Hardware Implementations
//!
//! Simulated devices for testing the control loops without a controller on the
//! bench. All mocks are async-safe and record what they were asked to do.
//!
//! # Available Mocks
//!
//! - `MockStepper` - records every command, optionally tracks commanded RPM as
//!   telemetry, can be told to stop acknowledging or to lose its transport
//! - `MockGpioLine` - records ENABLE line writes and releases

use crate::error::{AppResult, MotionError};
use crate::hardware::capabilities::{
    GpioLine, LineValue, MoveRequest, StepperDevice, TelemetrySample,
};
use crate::hardware::protocol::MotorMode;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

// =============================================================================
// MockStepper - Simulated stepper controller
// =============================================================================

/// One call made on [`MockStepper`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// `set_mode`
    SetMode(MotorMode),
    /// `set_value`
    SetValue(f64),
    /// `set_default_velocity`
    SetVelocity(f64),
    /// `move_degrees` (angle)
    Move(f64),
    /// `run_rpm`
    RunRpm(f64),
    /// `run_hz`
    RunHz(f64),
    /// `stop`
    Stop,
}

/// Mock stepper controller.
///
/// By default every command is acknowledged and `run_rpm` is reflected in the
/// telemetry immediately.
///
/// # Example
///
/// ```rust,ignore
/// let motor = Arc::new(MockStepper::new());
/// motor.run_rpm(120.0).await?;
/// assert_eq!(motor.status().rpm, 120.0);
/// ```
pub struct MockStepper {
    calls: Mutex<Vec<MockCall>>,
    telemetry: Mutex<TelemetrySample>,
    acknowledge: AtomicBool,
    transport_broken: AtomicBool,
    track_rpm: AtomicBool,
    stop_count: AtomicU32,
    enabled: AtomicBool,
    enable_history: Mutex<Vec<bool>>,
    last_move: Mutex<Option<MoveRequest>>,
}

impl MockStepper {
    /// Acknowledging mock at rest.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            telemetry: Mutex::new(TelemetrySample::default()),
            acknowledge: AtomicBool::new(true),
            transport_broken: AtomicBool::new(false),
            track_rpm: AtomicBool::new(true),
            stop_count: AtomicU32::new(0),
            enabled: AtomicBool::new(false),
            enable_history: Mutex::new(Vec::new()),
            last_move: Mutex::new(None),
        }
    }

    /// Mock that reports `rpm` as its current speed.
    pub fn spinning_at(rpm: f64) -> Self {
        let mock = Self::new();
        mock.set_rpm(rpm);
        mock
    }

    /// Stop (or resume) acknowledging commands.
    pub fn set_acknowledge(&self, acknowledge: bool) {
        self.acknowledge.store(acknowledge, Ordering::SeqCst);
    }

    /// Make every later command fail with `TransportClosed`.
    pub fn break_transport(&self) {
        self.transport_broken.store(true, Ordering::SeqCst);
    }

    /// Whether `run_rpm` updates the reported speed.
    pub fn set_track_rpm(&self, track: bool) {
        self.track_rpm.store(track, Ordering::SeqCst);
    }

    /// Override the reported speed.
    pub fn set_rpm(&self, rpm: f64) {
        let mut telemetry = self.telemetry.lock();
        telemetry.rpm = rpm;
        telemetry.received_at = Some(chrono::Utc::now());
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// RPM values passed to `run_rpm`, in order.
    pub fn rpm_commands(&self) -> Vec<f64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::RunRpm(rpm) => Some(*rpm),
                _ => None,
            })
            .collect()
    }

    /// Number of `stop` calls.
    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Last value passed to `enable_driver`.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Every value passed to `enable_driver`, in order.
    pub fn enable_history(&self) -> Vec<bool> {
        self.enable_history.lock().clone()
    }

    /// Request of the most recent `move_degrees`.
    pub fn last_move(&self) -> Option<MoveRequest> {
        self.last_move.lock().clone()
    }

    fn record(&self, call: MockCall) -> AppResult<bool> {
        if self.transport_broken.load(Ordering::SeqCst) {
            return Err(MotionError::TransportClosed);
        }
        self.calls.lock().push(call);
        Ok(self.acknowledge.load(Ordering::SeqCst))
    }
}

impl Default for MockStepper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepperDevice for MockStepper {
    async fn set_mode(&self, mode: MotorMode) -> AppResult<bool> {
        self.record(MockCall::SetMode(mode))
    }

    async fn set_value(&self, value: f64) -> AppResult<bool> {
        self.record(MockCall::SetValue(value))
    }

    async fn set_default_velocity(&self, hz: f64) -> AppResult<bool> {
        self.record(MockCall::SetVelocity(hz))
    }

    async fn move_degrees(&self, request: MoveRequest) -> AppResult<bool> {
        let acked = self.record(MockCall::Move(request.angle_deg))?;
        self.telemetry.lock().pos_deg += request.angle_deg;
        *self.last_move.lock() = Some(request);
        Ok(acked)
    }

    async fn run_rpm(&self, rpm: f64) -> AppResult<bool> {
        let acked = self.record(MockCall::RunRpm(rpm))?;
        if self.track_rpm.load(Ordering::SeqCst) {
            self.set_rpm(rpm);
        }
        Ok(acked)
    }

    async fn run_hz(&self, hz: f64) -> AppResult<bool> {
        self.record(MockCall::RunHz(hz))
    }

    async fn stop(&self) -> AppResult<bool> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        let acked = self.record(MockCall::Stop)?;
        if self.track_rpm.load(Ordering::SeqCst) {
            self.set_rpm(0.0);
        }
        Ok(acked)
    }

    fn status(&self) -> TelemetrySample {
        *self.telemetry.lock()
    }

    fn enable_driver(&self, active: bool) -> AppResult<()> {
        self.enabled.store(active, Ordering::SeqCst);
        self.enable_history.lock().push(active);
        Ok(())
    }
}

// =============================================================================
// MockGpioLine - Simulated ENABLE line
// =============================================================================

#[derive(Debug, Default)]
struct GpioState {
    writes: Vec<LineValue>,
    releases: u32,
}

/// Mock GPIO output. Clones share state, so keep one as a probe.
#[derive(Debug, Clone, Default)]
pub struct MockGpioLine {
    state: Arc<Mutex<GpioState>>,
}

impl MockGpioLine {
    /// Unwritten line.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every level written, in order.
    pub fn writes(&self) -> Vec<LineValue> {
        self.state.lock().writes.clone()
    }

    /// Current level, if ever written.
    pub fn level(&self) -> Option<LineValue> {
        self.state.lock().writes.last().copied()
    }

    /// How many times the line was released.
    pub fn release_count(&self) -> u32 {
        self.state.lock().releases
    }
}

impl GpioLine for MockGpioLine {
    fn write(&mut self, value: LineValue) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.releases > 0 {
            return Err(MotionError::Gpio("line already released".into()));
        }
        state.writes.push(value);
        Ok(())
    }

    fn release(&mut self) -> AppResult<()> {
        self.state.lock().releases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_stepper_records_and_tracks() {
        let motor = MockStepper::new();
        assert!(motor.run_rpm(90.0).await.unwrap());
        assert_eq!(motor.status().rpm, 90.0);

        motor.set_acknowledge(false);
        assert!(!motor.stop().await.unwrap());
        assert_eq!(motor.stop_count(), 1);
        assert_eq!(motor.calls(), vec![MockCall::RunRpm(90.0), MockCall::Stop]);
    }

    #[tokio::test]
    async fn broken_transport_fails_commands() {
        let motor = MockStepper::new();
        motor.break_transport();
        assert!(matches!(
            motor.set_mode(MotorMode::Stop).await,
            Err(MotionError::TransportClosed)
        ));
    }

    #[test]
    fn gpio_line_rejects_writes_after_release() {
        let mut line = MockGpioLine::new();
        let probe = line.clone();
        line.write(LineValue::Active).unwrap();
        line.release().unwrap();
        assert!(line.write(LineValue::Inactive).is_err());
        assert_eq!(probe.writes(), vec![LineValue::Active]);
        assert_eq!(probe.release_count(), 1);
    }
}

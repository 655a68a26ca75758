//! Motor session.
//!
//! A `MotorSession` owns the device client, at most one running control task and
//! the stop signal that task observes. Front ends (the CLI, a future UI) hold a
//! session instead of sharing globals.
//!
//! Starting a task while another one is still running is rejected with
//! [`MotionError::SessionBusy`]; nothing is queued.
//!
//! # Example
//!
//! ```rust,ignore
//! let session = MotorSession::new(device, config);
//! session.start_spin(Direction::Cw, 300.0)?;
//! tokio::time::sleep(Duration::from_secs(10)).await;
//! let report = session.stop().await?;
//! ```

use crate::config::AppConfig;
use crate::control::oscillator::{AngleOscillator, OscillationParams, OscillationRun};
use crate::control::pid::PidConfig;
use crate::control::ramp::{spin_ramped, Direction, RampOutcome, RampParams};
use crate::control::stop_signal::StopSignal;
use crate::error::{AppResult, MotionError};
use crate::hardware::capabilities::{MoveRequest, StepperDevice, TelemetrySample};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What a finished control task did.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionReport {
    /// Ramped spin
    Spin(RampOutcome),
    /// Angle oscillation
    Oscillation(OscillationRun),
}

type ControlTask = JoinHandle<AppResult<SessionReport>>;

/// One motor with its control task and stop signal.
pub struct MotorSession {
    device: Arc<dyn StepperDevice>,
    config: AppConfig,
    stop: StopSignal,
    task: Mutex<Option<ControlTask>>,
}

impl MotorSession {
    /// Session over `device`.
    pub fn new(device: Arc<dyn StepperDevice>, config: AppConfig) -> Self {
        Self {
            device,
            config,
            stop: StopSignal::new(),
            task: Mutex::new(None),
        }
    }

    /// Signal observed by the running task. Setting it stops the task.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Whether a control task is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Latest telemetry from the device.
    pub fn status(&self) -> TelemetrySample {
        self.device.status()
    }

    /// Ramped spin until [`stop`](Self::stop).
    pub fn start_spin(&self, direction: Direction, rpm: f64) -> AppResult<()> {
        let params = self.ramp_params(direction, rpm);
        self.spawn_spin(params)
    }

    /// Ramped spin for a fixed duration, then soft stop.
    pub fn spin_for(&self, direction: Direction, rpm: f64, duration: Duration) -> AppResult<()> {
        let params = self.ramp_params(direction, rpm).with_time_budget(duration);
        self.spawn_spin(params)
    }

    /// Ramped spin with caller-built parameters.
    pub fn spawn_spin(&self, params: RampParams) -> AppResult<()> {
        let device = self.device.clone();
        let stop = self.stop.clone();
        self.spawn("spin", async move {
            spin_ramped(device.as_ref(), &params, &stop)
                .await
                .map(SessionReport::Spin)
        })
    }

    /// Oscillate ±`angle_deg` at `speed_percent` of the configured max RPM until stopped.
    pub fn oscillate(&self, angle_deg: f64, speed_percent: f64) -> AppResult<()> {
        let params = self.oscillation_params(angle_deg, speed_percent).continuous();
        self.spawn_oscillation(params)
    }

    /// Oscillate for `cycles` full cycles.
    pub fn oscillate_cycles(
        &self,
        angle_deg: f64,
        speed_percent: f64,
        cycles: u32,
    ) -> AppResult<()> {
        let params = self
            .oscillation_params(angle_deg, speed_percent)
            .with_cycles(cycles);
        self.spawn_oscillation(params)
    }

    fn spawn_oscillation(&self, params: OscillationParams) -> AppResult<()> {
        let oscillator = AngleOscillator::new(self.device.clone());
        let stop = self.stop.clone();
        self.spawn("oscillation", async move {
            oscillator
                .run(&params, &stop)
                .await
                .map(SessionReport::Oscillation)
        })
    }

    /// Relative positional move with the driver enabled for its whole length.
    ///
    /// The ENABLE line is only released once telemetry reports the motion
    /// settled (or the wait timed out or was stopped), so the request always
    /// waits. The session stop signal is attached when the request has none.
    pub async fn move_degrees(&self, mut request: MoveRequest) -> AppResult<bool> {
        if self.is_running() {
            warn!("Control task already running, move ignored");
            return Err(MotionError::SessionBusy);
        }
        if !request.wait {
            let timeout = request.timeout;
            request = request.wait_settled(timeout);
        }
        if request.stop.is_none() {
            self.stop.clear();
            request = request.with_stop(self.stop.clone());
        }

        self.device.enable_driver(true)?;
        let result = self.device.move_degrees(request).await;
        if let Err(e) = self.device.enable_driver(false) {
            warn!(error = %e, "Failed to disable driver after move");
        }
        result
    }

    /// Set the stop signal and wait for the task to wind down.
    ///
    /// Returns the task's report, or `None` if nothing was running.
    pub async fn stop(&self) -> AppResult<Option<SessionReport>> {
        self.stop.set();
        self.join().await
    }

    /// Wait for the current task to finish on its own.
    pub async fn join(&self) -> AppResult<Option<SessionReport>> {
        let task = self.task.lock().take();
        match task {
            Some(task) => Ok(Some(task.await??)),
            None => Ok(None),
        }
    }

    fn ramp_params(&self, direction: Direction, rpm: f64) -> RampParams {
        let params = RampParams::from_config(&self.config.ramp, direction, rpm);
        match &self.config.pid {
            Some(settings) => params.with_pid(PidConfig::from_settings(settings)),
            None => params,
        }
    }

    fn oscillation_params(&self, angle_deg: f64, speed_percent: f64) -> OscillationParams {
        let rpm = self.config.ramp.max_rpm * speed_percent.clamp(0.0, 100.0) / 100.0;
        OscillationParams::from_config(&self.config, angle_deg, rpm)
    }

    fn spawn<F>(&self, kind: &'static str, body: F) -> AppResult<()>
    where
        F: std::future::Future<Output = AppResult<SessionReport>> + Send + 'static,
    {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            warn!(kind, "Control task already running, request ignored");
            return Err(MotionError::SessionBusy);
        }

        self.device.enable_driver(true)?;
        self.stop.clear();

        let device = self.device.clone();
        *slot = Some(tokio::spawn(async move {
            let result = body.await;
            if let Err(e) = device.enable_driver(false) {
                warn!(error = %e, "Failed to disable driver after {kind}");
            }
            result
        }));
        info!(kind, "Control task started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCall, MockStepper};
    use tracing_test::traced_test;

    fn session(motor: Arc<MockStepper>) -> MotorSession {
        MotorSession::new(motor, AppConfig::default())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn second_start_is_rejected_while_running() {
        let motor = Arc::new(MockStepper::new());
        let session = session(motor.clone());

        session.start_spin(Direction::Cw, 100.0).unwrap();
        assert!(session.is_running());
        assert!(matches!(
            session.start_spin(Direction::Ccw, 50.0),
            Err(MotionError::SessionBusy)
        ));
        assert!(logs_contain("already running"));

        let report = session.stop().await.unwrap();
        assert!(matches!(report, Some(SessionReport::Spin(_))));
        assert_eq!(motor.stop_count(), 1);
        assert!(!motor.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn new_task_allowed_after_previous_finished() {
        let motor = Arc::new(MockStepper::new());
        let session = session(motor.clone());

        session
            .spin_for(Direction::Cw, 60.0, Duration::from_millis(200))
            .unwrap();
        session.join().await.unwrap();

        session.start_spin(Direction::Ccw, 60.0).unwrap();
        session.stop().await.unwrap();
        assert_eq!(motor.stop_count(), 2);
    }

    #[tokio::test]
    async fn move_waits_for_settle_before_disabling() {
        let motor = Arc::new(MockStepper::new());
        let session = session(motor.clone());

        assert!(session.move_degrees(MoveRequest::new(90.0)).await.unwrap());

        let request = motor.last_move().unwrap();
        assert!(request.wait);
        assert!(request.stop.is_some());
        assert_eq!(motor.enable_history(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn move_is_rejected_while_task_runs() {
        let motor = Arc::new(MockStepper::new());
        let session = session(motor.clone());

        session.start_spin(Direction::Cw, 60.0).unwrap();
        assert!(matches!(
            session.move_degrees(MoveRequest::new(10.0)).await,
            Err(MotionError::SessionBusy)
        ));
        session.stop().await.unwrap();
        assert!(!motor.calls().contains(&MockCall::Move(10.0)));
    }

    #[tokio::test]
    async fn stop_without_task_is_none() {
        let session = session(Arc::new(MockStepper::new()));
        assert!(session.stop().await.unwrap().is_none());
    }

    #[test]
    fn speed_percent_maps_to_max_rpm() {
        let session = session(Arc::new(MockStepper::new()));
        let params = session.oscillation_params(30.0, 50.0);
        assert_eq!(params.rpm, 350.0);
        let params = session.oscillation_params(30.0, 150.0);
        assert_eq!(params.rpm, 700.0);
    }
}

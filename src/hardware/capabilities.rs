//! Hardware Capabilities
//!
//! Small capability traits at the seams between the control loops and the
//! hardware:
//!
//! - [`LineTransport`]: newline-framed text link (serial port, in-memory duplex)
//! - [`GpioLine`]: one output line driving the stepper driver ENABLE input
//! - [`StepperDevice`]: the command/status API the control loops drive
//!
//! Control code is written against these traits so it runs unchanged against
//! the real controller, an in-memory link in tests, or [`crate::hardware::mock`].
//!
//! # Design
//!
//! Each async capability trait:
//! - Uses `#[async_trait]`
//! - Is thread-safe (requires `Send + Sync`)
//! - Takes `&self`; implementations use interior mutability
//! - Returns [`AppResult`]
//!
//! A command that the device did not acknowledge in time is `Ok(false)`, not an
//! error. Only transport failures come back as `Err`.

use crate::error::AppResult;
use crate::hardware::protocol::MotorMode;
use crate::control::stop_signal::StopSignal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Capability: line-oriented text transport.
///
/// # Contract
/// - `send_line` appends `\n` if missing and fails with a transport error once
///   the link is closed. Writes are never retried here.
/// - `read_line` returns `Ok(None)` when the timeout elapses without a full line.
///   Invalid UTF-8 is replaced, never reported.
/// - One task may read while others write.
#[async_trait]
pub trait LineTransport: Send + Sync {
    /// Write one line.
    async fn send_line(&self, text: &str) -> AppResult<()>;

    /// Read one line (terminator stripped), or `None` on timeout.
    async fn read_line(&self, timeout: Duration) -> AppResult<Option<String>>;

    /// Discard any unread input.
    async fn reset_input_buffer(&self) -> AppResult<()>;

    /// Close the link. Later sends fail and reads report the link as closed.
    async fn close(&self) -> AppResult<()>;
}

/// Physical level of a GPIO output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineValue {
    /// Logical active (high on an active-high line)
    Active,
    /// Logical inactive
    Inactive,
}

/// Capability: a single GPIO output line.
///
/// Implemented once per backend ([`crate::hardware::gpio`]), selected at build time.
pub trait GpioLine: Send {
    /// Drive the line.
    fn write(&mut self, value: LineValue) -> AppResult<()>;

    /// Give the line back to the system. Called exactly once by the owner.
    fn release(&mut self) -> AppResult<()>;
}

/// Latest telemetry snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetrySample {
    /// Estimated position in degrees
    pub pos_deg: f64,
    /// Estimated speed in RPM (signed)
    pub rpm: f64,
    /// Receipt time, `None` until the first `STAT` line arrives
    pub received_at: Option<DateTime<Utc>>,
}

/// Parameters of a relative positional move.
#[derive(Debug, Clone, Default)]
pub struct MoveRequest {
    /// Relative angle in degrees
    pub angle_deg: f64,
    /// Velocity for this move; the device default is used when `None`
    pub velocity_hz: Option<f64>,
    /// Block until telemetry reports the motion settled
    pub wait: bool,
    /// Give up waiting after this long; `None` waits until settled or stopped
    pub timeout: Option<Duration>,
    /// Stop signal observed while waiting
    pub stop: Option<StopSignal>,
}

impl MoveRequest {
    /// Fire-and-forget move by `angle_deg`.
    pub fn new(angle_deg: f64) -> Self {
        Self {
            angle_deg,
            ..Default::default()
        }
    }

    /// Use an explicit velocity for this move.
    pub fn with_velocity(mut self, hz: f64) -> Self {
        self.velocity_hz = Some(hz);
        self
    }

    /// Wait for the move to settle, for at most `timeout` if given.
    pub fn wait_settled(mut self, timeout: Option<Duration>) -> Self {
        self.wait = true;
        self.timeout = timeout;
        self
    }

    /// Abort the settle wait when `stop` is set.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }
}

/// Capability: stepper motor controller.
///
/// Methods returning `AppResult<bool>` report whether every command involved
/// was acknowledged.
#[async_trait]
pub trait StepperDevice: Send + Sync {
    /// Send `MODO:<n>`.
    async fn set_mode(&self, mode: MotorMode) -> AppResult<bool>;

    /// Send `SET:<value>` for the current mode.
    async fn set_value(&self, value: f64) -> AppResult<bool>;

    /// Send `VEL:<hz>` (default velocity for positional moves).
    async fn set_default_velocity(&self, hz: f64) -> AppResult<bool>;

    /// Relative positional move, optionally waiting for it to settle.
    async fn move_degrees(&self, request: MoveRequest) -> AppResult<bool>;

    /// Continuous rotation at a signed RPM.
    async fn run_rpm(&self, rpm: f64) -> AppResult<bool>;

    /// Continuous rotation at a signed step rate.
    async fn run_hz(&self, hz: f64) -> AppResult<bool>;

    /// Stop motion. Retried a bounded number of times.
    async fn stop(&self) -> AppResult<bool>;

    /// Latest telemetry. Never blocks on I/O.
    fn status(&self) -> TelemetrySample;

    /// Drive the ENABLE line (polarity handled by the implementation).
    fn enable_driver(&self, active: bool) -> AppResult<()>;
}

//! # Disc Motion
//!
//! Closed-loop control of the disc motor on the microfluidic bench. The crate
//! drives a stepper controller over a line-oriented serial protocol, ramps the
//! commanded speed under an acceleration bound, optionally trims it with a PID
//! loop on measured RPM, and runs open-loop angle oscillations.
//!
//! ## Crate Structure
//!
//! - **`config`**: typed configuration loaded from TOML and the environment.
//! - **`error`**: the `MotionError` enum shared by every module.
//! - **`logging`**: tracing subscriber setup.
//! - **`hardware`**: serial transport, wire protocol, the stepper protocol
//!   client, the encoder-counter reader, the GPIO ENABLE line and mocks.
//! - **`control`**: PID, ramp controller, angle oscillator and the stop signal.
//! - **`session`**: one motor session owning its device, control task and
//!   cancellation signal.

pub mod config;
pub mod control;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod session;

pub use error::{AppResult, MotionError};

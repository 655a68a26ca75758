//! Motion control loops.
//!
//! - [`pid`]: discrete PID with back-calculation anti-windup
//! - [`ramp`]: bounded-acceleration velocity controller
//! - [`oscillator`]: open-loop back-and-forth angle motion
//! - [`settle`]: "motion finished" detector for positional moves
//! - [`stop_signal`]: cooperative cancellation shared by all loops

pub mod oscillator;
pub mod pid;
pub mod ramp;
pub mod settle;
pub mod stop_signal;

pub use oscillator::{AngleOscillator, OscillationLength, OscillationParams, OscillationRun};
pub use pid::{PidConfig, PidController};
pub use ramp::{
    spin_ramped, Direction, RampOutcome, RampParams, RampPhase, RampState, StopPredicate, StopReason,
};
pub use stop_signal::StopSignal;

//! Hardware Layer
//!
//! Serial link, wire protocol and device clients for the disc stepper
//! controller, plus the GPIO ENABLE line.

pub mod capabilities;
pub mod encoder;
pub mod gpio;
pub mod mock;
pub mod protocol;
pub mod serial_transport;
pub mod stepper_driver;

pub use capabilities::{
    GpioLine, LineTransport, LineValue, MoveRequest, StepperDevice, TelemetrySample,
};
pub use protocol::{Ack, Command, MotorMode};
pub use serial_transport::SerialTransport;
pub use stepper_driver::StepperDriver;

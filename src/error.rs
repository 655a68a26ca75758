//! Custom error types for the application.
//!
//! This module defines the primary error type, `MotionError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure that occur while driving the disc motor, from
//! configuration problems to serial link faults.
//!
//! ## Error Hierarchy
//!
//! - **Transport errors** (`Io`, `SerialOpen`, `TransportClosed`, `WriteTimeout`,
//!   `SerialUnexpectedEof`): the serial link is unusable for the current operation.
//!   They abort the operation; callers still attempt a device stop.
//! - **Protocol errors** (`Protocol`, `DeviceUnresponsive`): a missing ACK is *not* an
//!   error at all (commands report `Ok(false)`); only malformed lines and an exhausted
//!   failure budget surface here.
//! - **Configuration errors** (`Config`, `Configuration`, `InvalidParameter`,
//!   `FeatureNotEnabled`): rejected before any motion command is sent.
//! - **Runtime errors** (`SessionBusy`, `TaskJoin`, `Gpio`).
//!
//! Cancellation is never an error. A stopped session returns `Ok` with its stop reason.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MotionError>;

/// Primary error type for disc motion control.
#[derive(Error, Debug)]
pub enum MotionError {
    /// Configuration file parsing or extraction failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration values parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A command argument was rejected before anything was sent to the device.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Standard I/O failure on the serial link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened.
    #[error("Failed to open serial port {port}: {message}")]
    SerialOpen {
        /// Port path that failed to open
        port: String,
        /// Underlying driver message
        message: String,
    },

    /// The transport was closed, intentionally or by the peer.
    #[error("Serial transport is closed")]
    TransportClosed,

    /// A write did not complete within the configured write timeout.
    #[error("Serial write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    /// The serial stream reported end-of-file.
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    /// A line could not be parsed as a protocol message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device stopped acknowledging commands.
    #[error("Device unresponsive after {consecutive_failures} consecutive unacknowledged commands")]
    DeviceUnresponsive {
        /// Number of ACK failures in a row when the session gave up
        consecutive_failures: u32,
    },

    /// The GPIO enable line could not be driven or released.
    #[error("GPIO error: {0}")]
    Gpio(String),

    /// A control task is already running on this motor.
    #[error("A motor control task is already running")]
    SessionBusy,

    /// The control task panicked or was aborted.
    #[error("Control task failed to join: {0}")]
    TaskJoin(String),

    /// Functionality was requested that was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl MotionError {
    /// Whether the background reader may retry after a short back-off.
    ///
    /// Only plain I/O hiccups qualify. A closed transport or EOF ends the reader.
    pub fn is_transient(&self) -> bool {
        match self {
            MotionError::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::BrokenPipe
            ),
            MotionError::Protocol(_) => true,
            _ => false,
        }
    }
}

impl From<figment::Error> for MotionError {
    fn from(value: figment::Error) -> Self {
        MotionError::Config(Box::new(value))
    }
}

impl From<tokio::task::JoinError> for MotionError {
    fn from(value: tokio::task::JoinError) -> Self {
        MotionError::TaskJoin(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_are_transient() {
        let err = MotionError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(err.is_transient());
    }

    #[test]
    fn closed_transport_is_not_transient() {
        assert!(!MotionError::TransportClosed.is_transient());
        assert!(!MotionError::SerialUnexpectedEof.is_transient());
        let broken = MotionError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!broken.is_transient());
    }

    #[test]
    fn unresponsive_message_names_failure_count() {
        let err = MotionError::DeviceUnresponsive {
            consecutive_failures: 7,
        };
        assert!(err.to_string().contains('7'));
    }
}

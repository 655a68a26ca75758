//! Stepper driver ENABLE line.
//!
//! The polarity mapping lives here and nowhere else: callers ask for "driver
//! enabled" and [`enable_line_level`] turns that into the physical level for the
//! board's wiring. DRV8825/A4988 boards are active low.
//!
//! Backends implement [`GpioLine`]. The Raspberry Pi backend (`rppal`) is only
//! compiled with the `rpi_gpio` feature.

use crate::error::{AppResult, MotionError};
use crate::hardware::capabilities::{GpioLine, LineValue};

/// Line level that puts the driver in the requested state.
///
/// | active | active_high | level    |
/// |--------|-------------|----------|
/// | true   | true        | Active   |
/// | false  | true        | Inactive |
/// | true   | false       | Inactive |
/// | false  | false       | Active   |
pub fn enable_line_level(active: bool, active_high: bool) -> LineValue {
    if active == active_high {
        LineValue::Active
    } else {
        LineValue::Inactive
    }
}

/// Request the ENABLE line on BCM pin `pin` from the compiled-in backend.
#[cfg(feature = "rpi_gpio")]
pub fn open_enable_line(pin: u8) -> AppResult<Box<dyn GpioLine>> {
    Ok(Box::new(rpi::RpiGpioLine::new(pin)?))
}

/// Request the ENABLE line on BCM pin `pin` from the compiled-in backend.
#[cfg(not(feature = "rpi_gpio"))]
pub fn open_enable_line(pin: u8) -> AppResult<Box<dyn GpioLine>> {
    tracing::warn!(pin, "ENABLE pin configured but no GPIO backend compiled in");
    Err(MotionError::FeatureNotEnabled("rpi_gpio".to_string()))
}

#[cfg(feature = "rpi_gpio")]
mod rpi {
    use super::*;
    use rppal::gpio::{Gpio, OutputPin};
    use tracing::debug;

    /// Output line on the Raspberry Pi header.
    pub struct RpiGpioLine {
        pin: u8,
        output: Option<OutputPin>,
    }

    impl RpiGpioLine {
        /// Request `pin` as an output, initially high (driver disabled on active-low boards).
        pub fn new(pin: u8) -> AppResult<Self> {
            let gpio = Gpio::new().map_err(|e| MotionError::Gpio(e.to_string()))?;
            let output = gpio
                .get(pin)
                .map_err(|e| MotionError::Gpio(format!("pin {pin}: {e}")))?
                .into_output_high();
            debug!(pin, "ENABLE line requested");
            Ok(Self {
                pin,
                output: Some(output),
            })
        }
    }

    impl GpioLine for RpiGpioLine {
        fn write(&mut self, value: LineValue) -> AppResult<()> {
            let output = self
                .output
                .as_mut()
                .ok_or_else(|| MotionError::Gpio(format!("pin {} already released", self.pin)))?;
            match value {
                LineValue::Active => output.set_high(),
                LineValue::Inactive => output.set_low(),
            }
            Ok(())
        }

        fn release(&mut self) -> AppResult<()> {
            if self.output.take().is_some() {
                debug!(pin = self.pin, "ENABLE line released");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polarity_table() {
        assert_eq!(enable_line_level(true, true), LineValue::Active);
        assert_eq!(enable_line_level(false, true), LineValue::Inactive);
        assert_eq!(enable_line_level(true, false), LineValue::Inactive);
        assert_eq!(enable_line_level(false, false), LineValue::Active);
    }

    #[cfg(not(feature = "rpi_gpio"))]
    #[test]
    fn missing_backend_is_reported() {
        assert!(matches!(
            open_enable_line(17),
            Err(MotionError::FeatureNotEnabled(_))
        ));
    }
}

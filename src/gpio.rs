//! Boot-mode control over the target's BOOT0 and NRST lines.

use core::fmt::Debug;

use log::debug;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PinMode {
    Input,
    Output,
}

/// Host GPIO backend. All calls are synchronous.
pub trait Gpio {
    type Error: Debug;

    fn pin_mode(&mut self, pin: u64, mode: PinMode) -> Result<(), Self::Error>;
    fn digital_write(&mut self, pin: u64, level: bool) -> Result<(), Self::Error>;
}

/// The two control lines wired to the target.
///
/// BOOT0 polarity is fixed by the part: low boots main flash, high boots
/// system memory. NRST is active-low and driven asymmetrically: while
/// asserted the pin is left as an input so a shared reset net (pull-up,
/// debugger) keeps the line; deasserted it is actively driven high.
pub struct BootControl<G> {
    pub(crate) gpio: G,
    reset_pin: u64,
    boot0_pin: u64,
}

impl<G: Gpio> BootControl<G> {
    pub fn new(gpio: G, reset_pin: u64, boot0_pin: u64) -> Self {
        Self {
            gpio,
            reset_pin,
            boot0_pin,
        }
    }

    /// One-time pin setup: BOOT0 as output in main-flash position, reset
    /// released so the target runs user code.
    pub fn setup(&mut self) -> Result<(), G::Error> {
        debug!(
            "configuring control pins (reset: {}, boot0: {})",
            self.reset_pin, self.boot0_pin
        );
        self.gpio.pin_mode(self.boot0_pin, PinMode::Output)?;
        self.select_main_flash()?;
        self.deassert_reset()
    }

    pub fn select_main_flash(&mut self) -> Result<(), G::Error> {
        self.gpio.digital_write(self.boot0_pin, false)
    }

    pub fn select_system_memory(&mut self) -> Result<(), G::Error> {
        self.gpio.digital_write(self.boot0_pin, true)
    }

    pub fn assert_reset(&mut self) -> Result<(), G::Error> {
        self.gpio.digital_write(self.reset_pin, false)?;
        self.gpio.pin_mode(self.reset_pin, PinMode::Input)
    }

    pub fn deassert_reset(&mut self) -> Result<(), G::Error> {
        self.gpio.pin_mode(self.reset_pin, PinMode::Output)?;
        self.gpio.digital_write(self.reset_pin, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockGpio, PinOp};

    #[test]
    fn setup_leaves_the_target_in_main_flash_idle() {
        let mut pins = BootControl::new(MockGpio::default(), 17, 27);
        pins.setup().unwrap();

        assert_eq!(
            pins.gpio.ops,
            vec![
                PinOp::Mode(27, PinMode::Output),
                PinOp::Write(27, false),
                PinOp::Mode(17, PinMode::Output),
                PinOp::Write(17, true),
            ]
        );
    }

    #[test]
    fn reset_is_driven_asymmetrically() {
        let mut pins = BootControl::new(MockGpio::default(), 17, 27);

        pins.assert_reset().unwrap();
        pins.deassert_reset().unwrap();

        assert_eq!(
            pins.gpio.ops,
            vec![
                PinOp::Write(17, false),
                PinOp::Mode(17, PinMode::Input),
                PinOp::Mode(17, PinMode::Output),
                PinOp::Write(17, true),
            ]
        );
    }
}

//! Linux backends: serial port over `serial-core`, pins over sysfs GPIO.

use std::collections::HashMap;
use std::io::{ErrorKind as IoErrorKind, Read as _, Write as _};
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl, Parity,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::sysfs_gpio::{self, Direction, Pin};
use linux_embedded_hal::{Delay, Serial};
use log::debug;

use crate::gpio::{Gpio, PinMode};
use crate::{Flasher, Options, SerialPort};

/// Poll granularity of the blocking reads; `read_chunk` reports
/// `WouldBlock` after one quiet interval.
const READ_TIMEOUT_MS: u64 = 5;

fn not_open() -> SerialError {
    SerialError::new(SerialErrorKind::NoDevice, "Port is not open")
}

/// Serial device bound to the target USART, opened once per flash
/// session with the fixed 8E1 framing.
pub struct LinuxPort {
    path: String,
    baud: u32,
    port: Option<Serial>,
}

impl LinuxPort {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            port: None,
        }
    }
}

impl SerialPort for LinuxPort {
    type Error = SerialError;

    fn open(&mut self) -> Result<(), Self::Error> {
        debug!("opening {} at {} 8E1", self.path, self.baud);
        let mut port = Serial::open(Path::new(&self.path))?;

        let mut settings = port.0.read_settings()?;
        settings.set_baud_rate(BaudRate::from_speed(self.baud as usize))?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_parity(Parity::ParityEven);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_flow_control(FlowControl::FlowNone);
        port.0.write_settings(&settings)?;
        port.0.set_timeout(Duration::from_millis(READ_TIMEOUT_MS))?;

        self.port.replace(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        // Dropping the TTY handle closes it; a second close is a no-op.
        if self.port.take().is_some() {
            debug!("closed {}", self.path);
        }
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        let port = self.port.as_mut().ok_or_else(not_open)?;
        port.0.write_all(bytes)?;
        port.0.flush()?;
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error> {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return Err(nb::Error::Other(not_open())),
        };

        match port.0.read(buf) {
            Ok(0) => Err(nb::Error::WouldBlock),
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == IoErrorKind::TimedOut || e.kind() == IoErrorKind::WouldBlock =>
            {
                Err(nb::Error::WouldBlock)
            }
            Err(e) => Err(nb::Error::Other(e.into())),
        }
    }
}

/// GPIO backend over the kernel sysfs interface. Pins are exported on
/// first use and stay exported.
pub struct SysfsGpio {
    pins: HashMap<u64, Pin>,
}

impl SysfsGpio {
    pub fn new() -> Self {
        Self {
            pins: HashMap::new(),
        }
    }

    fn pin(&mut self, number: u64) -> Result<Pin, sysfs_gpio::Error> {
        if let Some(pin) = self.pins.get(&number) {
            return Ok(pin.clone());
        }

        let pin = Pin::new(number);
        pin.export()?;
        self.pins.insert(number, pin.clone());
        Ok(pin)
    }
}

impl Default for SysfsGpio {
    fn default() -> Self {
        Self::new()
    }
}

impl Gpio for SysfsGpio {
    type Error = sysfs_gpio::Error;

    fn pin_mode(&mut self, pin: u64, mode: PinMode) -> Result<(), Self::Error> {
        let direction = match mode {
            PinMode::Input => Direction::In,
            PinMode::Output => Direction::Out,
        };
        self.pin(pin)?.set_direction(direction)
    }

    fn digital_write(&mut self, pin: u64, level: bool) -> Result<(), Self::Error> {
        self.pin(pin)?.set_value(level as u8)
    }
}

impl Flasher<LinuxPort, SysfsGpio, Delay> {
    /// Create a flasher for a target wired to this machine's serial
    /// device and GPIO header.
    pub fn linux(options: Options) -> Self {
        let port = LinuxPort::new(
            options.serial_port_path.clone(),
            options.serial_port_baud_rate,
        );
        Flasher::new(port, SysfsGpio::new(), Delay {}, options)
    }
}

//! Scripted collaborator mocks for the protocol-level tests.

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;

use crate::gpio::{Gpio, PinMode};
use crate::SerialPort;

/// Serial endpoint standing in for the target bootloader.
///
/// Replies are scripted per host write: the n-th `write_all` queues the
/// n-th script entry's chunks for reading back. A missing or empty entry
/// means the target stays silent and the driver runs into its deadline.
pub(crate) struct ScriptPort {
    script: VecDeque<Vec<Vec<u8>>>,
    /// Chunks waiting to be read by the driver.
    pub rx: VecDeque<Vec<u8>>,
    /// Every frame the host wrote, in order.
    pub writes: Vec<Vec<u8>>,
    pub opened: u32,
    pub closed: u32,
    /// Error message `close` should fail with, if any.
    pub close_error: Option<String>,
}

impl ScriptPort {
    pub fn new(script: Vec<Vec<Vec<u8>>>) -> Self {
        Self {
            script: script.into(),
            rx: VecDeque::new(),
            writes: Vec::new(),
            opened: 0,
            closed: 0,
            close_error: None,
        }
    }
}

impl SerialPort for ScriptPort {
    type Error = String;

    fn open(&mut self) -> Result<(), Self::Error> {
        self.opened += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.closed += 1;
        match &self.close_error {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.writes.push(bytes.to_vec());
        if let Some(replies) = self.script.pop_front() {
            self.rx.extend(replies);
        }
        Ok(())
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error> {
        match self.rx.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.rx.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            }
            None => Err(nb::Error::WouldBlock),
        }
    }
}

/// Delay that only keeps the books.
#[derive(Default)]
pub(crate) struct MockDelay {
    pub sleeps: Vec<u32>,
}

impl MockDelay {
    pub fn total_ms(&self) -> u32 {
        self.sleeps.iter().sum()
    }
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.sleeps.push(ms);
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub(crate) enum PinOp {
    Mode(u64, PinMode),
    Write(u64, bool),
}

#[derive(Default)]
pub(crate) struct MockGpio {
    pub ops: Vec<PinOp>,
}

impl Gpio for MockGpio {
    type Error = String;

    fn pin_mode(&mut self, pin: u64, mode: PinMode) -> Result<(), Self::Error> {
        self.ops.push(PinOp::Mode(pin, mode));
        Ok(())
    }

    fn digital_write(&mut self, pin: u64, level: bool) -> Result<(), Self::Error> {
        self.ops.push(PinOp::Write(pin, level));
        Ok(())
    }
}

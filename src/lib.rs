//! STM32 USART bootloader flasher.
//!
//! Drives a target into system-memory boot over two host GPIO lines
//! (BOOT0 and NRST), speaks the factory bootloader command set over a
//! UART, and restores main-flash boot on every exit path.
//!
//! Based on AN3155.

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use log::{debug, info, warn};
use thiserror::Error;

mod exchange;
pub mod gpio;
pub mod protocol;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::gpio::{BootControl, Gpio, PinMode};
pub use crate::protocol::Command;

use crate::protocol::{
    Autobaud, BlockWrite, FramedReply, MassErase, ProtocolError, AUTOBAUD_TIMEOUT_MS,
    COMMAND_TIMEOUT_MS, ERASE_TIMEOUT_MS, MAX_CHUNK, PAD_BYTE, WRITE_TIMEOUT_MS,
};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Hold time between selecting system memory and releasing reset.
pub const RESET_SETTLE_MS: u32 = 10;
/// Time the ROM bootloader needs after reset before it listens for the
/// autobaud byte. Part of the entry contract, not tunable.
pub const BOOTLOADER_STARTUP_MS: u32 = 500;

/// UART transport owned by the driver and opened once per flash session.
///
/// Inbound bytes arrive as chunks of one or more bytes in order; chunk
/// boundaries carry no meaning. Closing an already closed port must
/// succeed.
pub trait SerialPort {
    type Error: Debug;

    fn open(&mut self) -> Result<(), Self::Error>;
    fn close(&mut self) -> Result<(), Self::Error>;
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Fetch whatever bytes have arrived, or `WouldBlock` if none have.
    fn read_chunk(&mut self, buf: &mut [u8]) -> nb::Result<usize, Self::Error>;
}

#[derive(Error, Debug)]
pub enum Error<SE: Debug, GE: Debug> {
    #[error("driver initialisation failed: {0:?}")]
    Init(GE),
    #[error("failed to open serial port: {0:?}")]
    SerialOpen(SE),
    #[error("failed to close serial port: {0:?}")]
    SerialClose(SE),
    #[error("serial write failed: {0:?}")]
    SerialWrite(SE),
    #[error("serial read failed: {0:?}")]
    SerialRead(SE),
    #[error("gpio error: {0:?}")]
    Gpio(GE),
    #[error("timed out waiting for bootloader response")]
    Timeout,
    #[error("unexpected byte at {phase}: expected 0x{expected:02x}, got 0x{got:02x}")]
    UnexpectedByte {
        phase: &'static str,
        expected: u8,
        got: u8,
    },
    #[error("unexpected reply length: expected {expected}, got {got}")]
    UnexpectedLength { expected: usize, got: usize },
    #[error("bootloader does not support command 0x{opcode:02x}")]
    UnsupportedCommand { opcode: u8 },
    #[error("teardown failed: {0:?}")]
    Teardown(Box<Error<SE, GE>>),
}

impl<SE: Debug, GE: Debug> From<ProtocolError> for Error<SE, GE> {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnexpectedByte {
                phase,
                expected,
                got,
            } => Error::UnexpectedByte {
                phase,
                expected,
                got,
            },
            ProtocolError::UnexpectedLength { expected, got } => {
                Error::UnexpectedLength { expected, got }
            }
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// GPIO pin wired to the target NRST line
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub reset_pin: u64,

    /// GPIO pin wired to the target BOOT0 line
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub boot0_pin: u64,

    /// Serial device connected to the target USART
    #[cfg_attr(
        feature = "structopt",
        structopt(long, default_value = "/dev/ttyAMA0")
    )]
    pub serial_port_path: String,

    /// Baud rate for the bootloader session
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "115200"))]
    pub serial_port_baud_rate: u32,
}

impl Options {
    /// Options for a target on `serial_port_path` with the given control
    /// pins, at the default baud rate.
    pub fn new(reset_pin: u64, boot0_pin: u64, serial_port_path: impl Into<String>) -> Self {
        Self {
            reset_pin,
            boot0_pin,
            serial_port_path: serial_port_path.into(),
            serial_port_baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// One packet's worth of flashing done, reported after each 256-byte
/// write.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Progress {
    /// Target address the packet was written to.
    pub address: u32,
    /// Offset of the packet within the image.
    pub offset: usize,
    /// Total bytes this flash run puts on the wire.
    pub total: usize,
}

fn word_padded_len(len: usize) -> usize {
    len + (4 - len % 4)
}

/// Total bytes written to the target for an image of `len` bytes: the
/// word-padded image rounded up to whole 256-byte packets. Useful for
/// sizing progress displays before calling [`Flasher::flash_with_progress`].
pub fn image_write_len(len: usize) -> usize {
    (word_padded_len(len) + MAX_CHUNK - 1) / MAX_CHUNK * MAX_CHUNK
}

/// Driver for one target: a serial port, the two control pins, and a
/// delay source.
///
/// The driver is long-lived; all per-session state lives inside
/// [`Flasher::flash`]. `&mut self` receivers keep sessions serialised.
pub struct Flasher<P, G, D> {
    port: P,
    pins: BootControl<G>,
    delay: D,
    init_done: bool,
}

impl<P, G, D> Flasher<P, G, D>
where
    P: SerialPort,
    G: Gpio,
    D: DelayMs<u32>,
{
    pub fn new(port: P, gpio: G, delay: D, options: Options) -> Self {
        Self {
            port,
            pins: BootControl::new(gpio, options.reset_pin, options.boot0_pin),
            delay,
            init_done: false,
        }
    }

    /// One-shot GPIO setup leaving the target running user firmware.
    /// Subsequent calls are no-ops.
    pub fn init(&mut self) -> Result<(), Error<P::Error, G::Error>> {
        if self.init_done {
            return Ok(());
        }

        self.pins.setup().map_err(Error::Init)?;
        self.init_done = true;
        Ok(())
    }

    /// Flash `data` at `address` through the factory bootloader.
    ///
    /// Runs a full session: system-memory entry, command negotiation,
    /// mass erase, chunked write. The target is put back into main-flash
    /// boot and restarted on every exit path, success or failure.
    pub fn flash(&mut self, address: u32, data: &[u8]) -> Result<(), Error<P::Error, G::Error>> {
        self.flash_with_progress(address, data, |_| ())
    }

    /// Like [`Flasher::flash`], reporting a [`Progress`] per packet.
    pub fn flash_with_progress<F>(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: F,
    ) -> Result<(), Error<P::Error, G::Error>>
    where
        F: FnMut(Progress),
    {
        self.init()?;

        info!(
            "flashing {} bytes at 0x{:08x}",
            data.len(),
            address
        );

        let inner = self.run_session(address, data, &mut progress);
        let teardown = self.teardown();

        match (inner, teardown) {
            (Ok(()), Ok(())) => {
                info!("flash complete, target restarted");
                Ok(())
            }
            (Ok(()), Err(e)) => Err(Error::Teardown(Box::new(e))),
            (Err(inner), Err(teardown)) => {
                warn!("teardown failed after session error: {:?}", teardown);
                Err(inner)
            }
            (Err(inner), Ok(())) => Err(inner),
        }
    }

    /// Steps 1-10: open the port, reset into system memory, negotiate,
    /// erase, write.
    fn run_session<F>(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut F,
    ) -> Result<(), Error<P::Error, G::Error>>
    where
        F: FnMut(Progress),
    {
        self.port.open().map_err(Error::SerialOpen)?;

        self.pins.assert_reset().map_err(Error::Gpio)?;
        self.pins.select_system_memory().map_err(Error::Gpio)?;
        self.delay.delay_ms(RESET_SETTLE_MS);
        self.pins.deassert_reset().map_err(Error::Gpio)?;
        self.delay.delay_ms(BOOTLOADER_STARTUP_MS);

        let mut session = Session::new(&mut self.port, &mut self.delay);
        session.enter_bootloader()?;
        session.get()?;
        session.get_id()?;
        session.erase_all()?;
        session.write_firmware(address, data, progress)?;
        Ok(())
    }

    /// Steps 11-14, run on every exit path. Later steps still run when an
    /// earlier one fails; the first failure is reported.
    fn teardown(&mut self) -> Result<(), Error<P::Error, G::Error>> {
        debug!("restoring main-flash boot");
        let mut first_err = None;

        if let Err(e) = self.pins.assert_reset() {
            first_err.get_or_insert(Error::Gpio(e));
        }
        if let Err(e) = self.pins.select_main_flash() {
            first_err.get_or_insert(Error::Gpio(e));
        }
        if let Err(e) = self.port.close() {
            // Backends report a double close as "Port is not open"; the
            // enter path may fail before the port ever opened.
            if format!("{:?}", e).contains("Port is not open") {
                debug!("close on a port that was not open");
            } else {
                first_err.get_or_insert(Error::SerialClose(e));
            }
        }
        if let Err(e) = self.pins.deassert_reset() {
            first_err.get_or_insert(Error::Gpio(e));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// State negotiated with one bootloader instance. Created after the
/// target enters system memory, gone before `flash` returns.
struct Session<'a, P, D, GE> {
    port: &'a mut P,
    delay: &'a mut D,
    bootloader_version: u8,
    available_commands: Vec<u8>,
    product_id: u16,
    _gpio_err: PhantomData<GE>,
}

impl<'a, P, D, GE> Session<'a, P, D, GE>
where
    P: SerialPort,
    D: DelayMs<u32>,
    GE: Debug,
{
    fn new(port: &'a mut P, delay: &'a mut D) -> Self {
        Self {
            port,
            delay,
            bootloader_version: 0,
            available_commands: Vec::new(),
            product_id: 0,
            _gpio_err: PhantomData,
        }
    }

    /// A command may only be issued once the target advertised it.
    fn require(&self, command: Command) -> Result<(), Error<P::Error, GE>> {
        let opcode = command as u8;
        if self.available_commands.contains(&opcode) {
            Ok(())
        } else {
            warn!("bootloader does not advertise {:?} (0x{:02x})", command, opcode);
            Err(Error::UnsupportedCommand { opcode })
        }
    }

    fn enter_bootloader(&mut self) -> Result<(), Error<P::Error, GE>> {
        debug!("sending autobaud byte");
        exchange::run(self.port, self.delay, &mut Autobaud, AUTOBAUD_TIMEOUT_MS)
    }

    fn get(&mut self) -> Result<(), Error<P::Error, GE>> {
        let frame = exchange::run(
            self.port,
            self.delay,
            &mut FramedReply::new(Command::Get),
            COMMAND_TIMEOUT_MS,
        )?;

        self.bootloader_version = frame[2];
        self.available_commands = frame[3..frame.len() - 1].to_vec();

        info!(
            "bootloader v{}.{}, {} commands: {:02x?}",
            self.bootloader_version >> 4,
            self.bootloader_version & 0x0F,
            self.available_commands.len(),
            self.available_commands
        );
        Ok(())
    }

    fn get_id(&mut self) -> Result<(), Error<P::Error, GE>> {
        self.require(Command::GetId)?;

        let frame = exchange::run(
            self.port,
            self.delay,
            &mut FramedReply::new(Command::GetId),
            COMMAND_TIMEOUT_MS,
        )?;
        if frame.len() < 5 {
            return Err(Error::UnexpectedLength {
                expected: 5,
                got: frame.len(),
            });
        }

        self.product_id = u16::from_be_bytes([frame[2], frame[3]]);
        info!("product id: 0x{:04x}", self.product_id);
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), Error<P::Error, GE>> {
        self.require(Command::Erase)?;

        info!("mass erasing flash");
        exchange::run(
            self.port,
            self.delay,
            &mut MassErase::new(),
            ERASE_TIMEOUT_MS,
        )
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<P::Error, GE>> {
        self.require(Command::WriteMemory)?;

        debug!("writing {} bytes at 0x{:08x}", data.len(), address);
        exchange::run(
            self.port,
            self.delay,
            &mut BlockWrite::new(address, data),
            WRITE_TIMEOUT_MS,
        )
    }

    /// Segment the image into 256-byte packets, padding the tail with
    /// 0xFF, and write each in turn.
    fn write_firmware<F>(
        &mut self,
        start_address: u32,
        data: &[u8],
        progress: &mut F,
    ) -> Result<(), Error<P::Error, GE>>
    where
        F: FnMut(Progress),
    {
        let padded_len = word_padded_len(data.len());
        let total = image_write_len(data.len());

        let mut address = start_address;
        let mut offset = 0usize;
        while offset < padded_len {
            let mut packet = [PAD_BYTE; MAX_CHUNK];
            let take = data.len().saturating_sub(offset).min(MAX_CHUNK);
            packet[..take].copy_from_slice(&data[offset..offset + take]);

            self.write_memory(address, &packet)?;
            progress(Progress {
                address,
                offset,
                total,
            });

            address += MAX_CHUNK as u32;
            offset += MAX_CHUNK;
        }

        Ok(())
    }
}

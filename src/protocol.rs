//! AN3155 wire protocol: opcodes, framing, checksums and the per-command
//! reply machines fed by the exchange loop.

use crate::exchange::{Step, Wire};

use thiserror::Error;

/// Autobaud byte; the only frame sent without a complement.
pub const AUTOBAUD: u8 = 0x7F;

pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1F;

/// Largest payload a single Write Memory command accepts.
pub const MAX_CHUNK: usize = 256;

/// Filler byte for the unused tail of a write packet.
pub const PAD_BYTE: u8 = 0xFF;

/// Selector sent after the Erase opcode is acknowledged: erase everything.
pub const MASS_ERASE_SELECTOR: [u8; 2] = [0xFF, 0x00];

/// The target must answer the autobaud byte within this window.
pub const AUTOBAUD_TIMEOUT_MS: u32 = 1_000;
/// Deadline for the short informational commands (Get, Get ID).
pub const COMMAND_TIMEOUT_MS: u32 = 1_000;
/// Mass erase can take a while on large parts.
pub const ERASE_TIMEOUT_MS: u32 = 30_000;
/// Deadline covering all three phases of a Write Memory exchange.
pub const WRITE_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

/// Reply violations detected by the machines, independent of the transport.
#[derive(Error, Clone, PartialEq, Debug)]
pub enum ProtocolError {
    #[error("unexpected byte at {phase}: expected 0x{expected:02x}, got 0x{got:02x}")]
    UnexpectedByte {
        phase: &'static str,
        expected: u8,
        got: u8,
    },
    #[error("unexpected reply length: expected {expected}, got {got}")]
    UnexpectedLength { expected: usize, got: usize },
}

fn unexpected(phase: &'static str, got: u8) -> ProtocolError {
    ProtocolError::UnexpectedByte {
        phase,
        expected: ACK,
        got,
    }
}

/// XOR of all bytes in `data`.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ *b)
}

/// Two-byte opcode frame: the opcode and its complement.
pub fn command_frame(op: u8) -> [u8; 2] {
    [op, !op]
}

/// Big-endian address followed by its XOR checksum.
pub fn address_frame(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], xor_checksum(&a)]
}

/// `[N, d0.., N ^ XOR(d0..)]` with N = length - 1.
pub fn data_frame(data: &[u8]) -> Vec<u8> {
    assert!(
        !data.is_empty() && data.len() <= MAX_CHUNK,
        "data frame payload must be 1..=256 bytes"
    );

    let n = (data.len() - 1) as u8;
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push(n);
    frame.extend_from_slice(data);
    frame.push(n ^ xor_checksum(data));
    frame
}

/// Autobaud handshake: one byte out, exactly one ACK back.
pub(crate) struct Autobaud;

impl Wire for Autobaud {
    type Output = ();

    fn begin(&mut self) -> Vec<u8> {
        vec![AUTOBAUD]
    }

    fn on_data(&mut self, chunk: &[u8]) -> Result<Step<()>, ProtocolError> {
        if chunk.len() != 1 {
            return Err(ProtocolError::UnexpectedLength {
                expected: 1,
                got: chunk.len(),
            });
        }
        if chunk[0] != ACK {
            return Err(unexpected("autobaud", chunk[0]));
        }
        Ok(Step::Done(()))
    }
}

/// ACK-framed variable-length reply, shared by Get and Get ID.
///
/// Accumulates `ACK, N, payload.., ACK` where the total length is
/// `N + 4`, and yields the whole frame.
pub(crate) struct FramedReply {
    op: u8,
    buffer: Vec<u8>,
}

impl FramedReply {
    pub fn new(command: Command) -> Self {
        Self {
            op: command as u8,
            buffer: Vec::new(),
        }
    }
}

impl Wire for FramedReply {
    type Output = Vec<u8>;

    fn begin(&mut self) -> Vec<u8> {
        command_frame(self.op).to_vec()
    }

    fn on_data(&mut self, chunk: &[u8]) -> Result<Step<Vec<u8>>, ProtocolError> {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.is_empty() {
            return Ok(Step::Wait);
        }
        if self.buffer[0] != ACK {
            return Err(unexpected("start-ack", self.buffer[0]));
        }
        if self.buffer.len() < 2 {
            return Ok(Step::Wait);
        }

        let total = self.buffer[1] as usize + 4;
        if self.buffer.len() < total {
            return Ok(Step::Wait);
        }

        let tail = self.buffer[total - 1];
        if tail != ACK {
            return Err(unexpected("end-ack", tail));
        }

        let mut frame = core::mem::take(&mut self.buffer);
        frame.truncate(total);
        Ok(Step::Done(frame))
    }
}

/// Mass erase: opcode frame, ACK, `0xFF 0x00` selector, ACK.
pub(crate) struct MassErase {
    acks: u8,
}

impl MassErase {
    pub fn new() -> Self {
        Self { acks: 0 }
    }
}

impl Wire for MassErase {
    type Output = ();

    fn begin(&mut self) -> Vec<u8> {
        command_frame(Command::Erase as u8).to_vec()
    }

    fn on_data(&mut self, chunk: &[u8]) -> Result<Step<()>, ProtocolError> {
        let mut out = Vec::new();
        for &byte in chunk {
            if byte != ACK {
                let phase = if self.acks == 0 {
                    "start-ack"
                } else {
                    "erase-ack"
                };
                return Err(unexpected(phase, byte));
            }

            self.acks += 1;
            if self.acks == 1 {
                out.extend_from_slice(&MASS_ERASE_SELECTOR);
            } else {
                return Ok(Step::Done(()));
            }
        }

        if out.is_empty() {
            Ok(Step::Wait)
        } else {
            Ok(Step::Send(out))
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum WritePhase {
    StartAck,
    AddressAck,
    DataAck,
}

impl WritePhase {
    fn name(self) -> &'static str {
        match self {
            WritePhase::StartAck => "start-ack",
            WritePhase::AddressAck => "address-ack",
            WritePhase::DataAck => "data-ack",
        }
    }
}

/// Write Memory: opcode frame, then address frame, then data frame, each
/// gated on an ACK from the target.
pub(crate) struct BlockWrite {
    address_frame: [u8; 5],
    data_frame: Vec<u8>,
    phase: WritePhase,
}

impl BlockWrite {
    pub fn new(address: u32, data: &[u8]) -> Self {
        Self {
            address_frame: address_frame(address),
            data_frame: data_frame(data),
            phase: WritePhase::StartAck,
        }
    }
}

impl Wire for BlockWrite {
    type Output = ();

    fn begin(&mut self) -> Vec<u8> {
        command_frame(Command::WriteMemory as u8).to_vec()
    }

    fn on_data(&mut self, chunk: &[u8]) -> Result<Step<()>, ProtocolError> {
        let mut out = Vec::new();
        for &byte in chunk {
            if byte != ACK {
                return Err(unexpected(self.phase.name(), byte));
            }

            self.phase = match self.phase {
                WritePhase::StartAck => {
                    out.extend_from_slice(&self.address_frame);
                    WritePhase::AddressAck
                }
                WritePhase::AddressAck => {
                    out.extend_from_slice(&self.data_frame);
                    WritePhase::DataAck
                }
                WritePhase::DataAck => return Ok(Step::Done(())),
            };
        }

        if out.is_empty() {
            Ok(Step::Wait)
        } else {
            Ok(Step::Send(out))
        }
    }
}

//! The framed exchange primitive: one request/response round against the
//! target, driven by a reply machine under a deadline.

use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use log::trace;

use crate::protocol::ProtocolError;
use crate::{Error, SerialPort};

/// Nap length while waiting for reply bytes.
pub(crate) const POLL_DELAY_MS: u32 = 5;

const READ_BUF_LEN: usize = 64;

/// Next action decided by a reply machine after consuming a chunk.
#[derive(Debug, PartialEq)]
pub(crate) enum Step<T> {
    /// More reply bytes are needed.
    Wait,
    /// Put these bytes on the line, then keep listening.
    Send(Vec<u8>),
    /// The exchange finished with this value.
    Done(T),
}

/// One command's view of the wire: an opening frame plus a parser that
/// steps a state machine chunk by chunk.
///
/// Inbound bytes are a stream; chunk boundaries carry no meaning and a
/// machine must accept any split of the reply.
pub(crate) trait Wire {
    type Output;

    /// Frame transmitted to start the exchange.
    fn begin(&mut self) -> Vec<u8>;

    /// Consume a chunk of reply bytes and decide the next step.
    fn on_data(&mut self, chunk: &[u8]) -> Result<Step<Self::Output>, ProtocolError>;
}

/// Run `wire` to completion against `port`.
///
/// Resolves exactly once: with the machine's value, the machine's protocol
/// error, a transport error, or [`Error::Timeout`] once `timeout_ms` of
/// waiting has accumulated. The deadline spans the whole exchange,
/// including any mid-exchange frames the machine emits.
pub(crate) fn run<P, D, W, GE>(
    port: &mut P,
    delay: &mut D,
    wire: &mut W,
    timeout_ms: u32,
) -> Result<W::Output, Error<P::Error, GE>>
where
    P: SerialPort,
    D: DelayMs<u32>,
    W: Wire,
    GE: Debug,
{
    let opening = wire.begin();
    trace!("tx {:02x?}", opening);
    port.write_all(&opening).map_err(Error::SerialWrite)?;

    let mut waited = 0u32;
    let mut buf = [0u8; READ_BUF_LEN];

    loop {
        match port.read_chunk(&mut buf) {
            Ok(n) => {
                trace!("rx {:02x?}", &buf[..n]);
                match wire.on_data(&buf[..n])? {
                    Step::Wait => {}
                    Step::Send(frame) => {
                        trace!("tx {:02x?}", frame);
                        port.write_all(&frame).map_err(Error::SerialWrite)?;
                    }
                    Step::Done(value) => return Ok(value),
                }
            }
            Err(nb::Error::WouldBlock) => {
                if waited >= timeout_ms {
                    return Err(Error::Timeout);
                }
                delay.delay_ms(POLL_DELAY_MS);
                waited += POLL_DELAY_MS;
            }
            Err(nb::Error::Other(e)) => return Err(Error::SerialRead(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MassErase, ACK, NACK};
    use crate::testutil::{MockDelay, ScriptPort};

    type TestError = Error<String, String>;

    /// Minimal machine: one probe byte out, one ACK back.
    struct OneAck;

    impl Wire for OneAck {
        type Output = ();

        fn begin(&mut self) -> Vec<u8> {
            vec![0x55]
        }

        fn on_data(&mut self, chunk: &[u8]) -> Result<Step<()>, ProtocolError> {
            if chunk[0] != ACK {
                return Err(ProtocolError::UnexpectedByte {
                    phase: "probe-ack",
                    expected: ACK,
                    got: chunk[0],
                });
            }
            Ok(Step::Done(()))
        }
    }

    #[test]
    fn resolves_once_with_the_machine_value() {
        let mut port = ScriptPort::new(vec![vec![vec![ACK]]]);
        let mut delay = MockDelay::default();

        let result: Result<(), TestError> = run(&mut port, &mut delay, &mut OneAck, 100);
        assert!(result.is_ok());
        assert_eq!(port.writes, vec![vec![0x55]]);
        // Reply was already queued, so no polling naps were needed.
        assert!(delay.sleeps.is_empty());
    }

    #[test]
    fn resolves_once_with_timeout_after_the_deadline() {
        let mut port = ScriptPort::new(vec![vec![]]);
        let mut delay = MockDelay::default();

        let result: Result<(), TestError> = run(&mut port, &mut delay, &mut OneAck, 100);
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(delay.total_ms(), 100);
    }

    #[test]
    fn resolves_once_with_the_machine_error() {
        let mut port = ScriptPort::new(vec![vec![vec![NACK]]]);
        let mut delay = MockDelay::default();

        let result: Result<(), TestError> = run(&mut port, &mut delay, &mut OneAck, 100);
        assert!(matches!(
            result,
            Err(Error::UnexpectedByte {
                phase: "probe-ack",
                expected: ACK,
                got: NACK,
            })
        ));
    }

    #[test]
    fn transmits_mid_exchange_frames_from_the_machine() {
        // Erase replies with one ACK per host frame.
        let mut port = ScriptPort::new(vec![vec![vec![ACK]], vec![vec![ACK]]]);
        let mut delay = MockDelay::default();

        let result: Result<(), TestError> =
            run(&mut port, &mut delay, &mut MassErase::new(), 100);
        assert!(result.is_ok());
        assert_eq!(port.writes, vec![vec![0x43, 0xBC], vec![0xFF, 0x00]]);
    }

    #[test]
    fn deadline_spans_mid_exchange_waits() {
        // The first ACK arrives, the second never does.
        let mut port = ScriptPort::new(vec![vec![vec![ACK]], vec![]]);
        let mut delay = MockDelay::default();

        let result: Result<(), TestError> =
            run(&mut port, &mut delay, &mut MassErase::new(), 100);
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(port.writes, vec![vec![0x43, 0xBC], vec![0xFF, 0x00]]);
    }
}

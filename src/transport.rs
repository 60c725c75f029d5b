//! The serial link to the tube interface.
//!
//! [`SerialTransport`] owns the port exclusively. Every command is followed
//! by a fixed settle delay that the interface needs before it will accept
//! the next one; queries additionally flush stale input and read up to the
//! next carriage return.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::{info, trace, warn};

use crate::error::{QueryError, TransportError};
use crate::protocol::{parse_reply, Command, CountValue, TERMINATOR};

/// Pause after every command. Required by the interface, not a tuning knob.
pub const SETTLE_DELAY: Duration = Duration::from_millis(50);

pub const DEFAULT_BAUD_RATE: u32 = 9600;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// A byte stream the transport can drive.
///
/// Implemented for real serial ports and for the in-memory
/// [`SimulatedTube`](crate::simulator::SimulatedTube).
pub trait Port: Read + Write {
    /// Drops any received bytes that have not been read yet.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Port for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Blocking wait used for all protocol and sweep timing.
pub trait Delay {
    fn delay(&mut self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

pub struct SerialTransport<P, D = ThreadDelay> {
    port: P,
    delay: D,
}

impl SerialTransport<Box<dyn SerialPort>, ThreadDelay> {
    /// Opens `port` at `baud_rate` with the given per-read timeout.
    pub fn open(
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let link = serialport::new(port, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|source| TransportError::Open {
                port: port.to_string(),
                source,
            })?;
        info!(port, baud_rate, "opened serial link");
        Ok(Self::new(link, ThreadDelay))
    }
}

impl<P: Port, D: Delay> SerialTransport<P, D> {
    pub fn new(port: P, delay: D) -> Self {
        Self { port, delay }
    }

    /// Writes `command` with its terminator, then waits [`SETTLE_DELAY`].
    pub fn send(&mut self, command: &Command) -> Result<(), TransportError> {
        trace!(command = %command, "write");
        self.port.write_all(&command.encode())?;
        self.port.flush()?;
        self.delay.delay(SETTLE_DELAY);
        Ok(())
    }

    /// Sends a monitor query and decodes the reply.
    ///
    /// A reply that does not parse is logged and returned as
    /// [`QueryError::Reply`]; only link failures come back as
    /// [`QueryError::Transport`].
    pub fn query(&mut self, command: &Command) -> Result<CountValue, QueryError> {
        self.port.discard_input().map_err(TransportError::from)?;
        self.send(command)?;

        let raw = self.read_reply()?;
        trace!(command = %command, reply = %raw.escape_ascii(), "read");

        parse_reply(&raw).map_err(|err| {
            warn!(
                command = %command,
                raw = %err.raw.escape_ascii(),
                "unexpected reply: {}",
                err.kind
            );
            QueryError::Reply(err)
        })
    }

    /// Blocks for `duration` on the transport's clock.
    pub fn dwell(&mut self, duration: Duration) {
        self.delay.delay(duration);
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    // Reads byte by byte so nothing past the terminator is consumed. A read
    // timeout ends the reply with whatever has arrived so far.
    fn read_reply(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    reply.push(byte[0]);
                    if byte[0] == TERMINATOR {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    break
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reply)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::ParseErrorKind;
    use std::collections::VecDeque;
    use tracing_test::traced_test;

    /// Records every requested wait instead of sleeping.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingDelay {
        pub waits: Vec<Duration>,
    }

    impl RecordingDelay {
        pub fn total(&self) -> Duration {
            self.waits.iter().sum()
        }
    }

    impl Delay for RecordingDelay {
        fn delay(&mut self, duration: Duration) {
            self.waits.push(duration);
        }
    }

    // A port that replays canned input and captures output.
    #[derive(Debug, Default)]
    struct ScriptedPort {
        input: VecDeque<u8>,
        output: Vec<u8>,
        read_error: Option<io::ErrorKind>,
        discards: usize,
    }

    impl ScriptedPort {
        fn with_input(bytes: &[u8]) -> Self {
            Self {
                input: bytes.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if let Some(kind) = self.read_error {
                return Err(io::Error::from(kind));
            }
            match self.input.pop_front() {
                Some(byte) if !buf.is_empty() => {
                    buf[0] = byte;
                    Ok(1)
                }
                Some(byte) => {
                    self.input.push_front(byte);
                    Ok(0)
                }
                None => Err(io::Error::from(io::ErrorKind::TimedOut)),
            }
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for ScriptedPort {
        fn discard_input(&mut self) -> io::Result<()> {
            self.discards += 1;
            Ok(())
        }
    }

    fn transport(port: ScriptedPort) -> SerialTransport<ScriptedPort, RecordingDelay> {
        SerialTransport::new(port, RecordingDelay::default())
    }

    // --- Tests for sending ---

    #[test]
    fn send_terminates_command_and_settles() {
        let mut link = transport(ScriptedPort::default());
        link.send(&Command::BeamEnable).unwrap();
        link.send(&Command::BeamDisable).unwrap();

        assert_eq!(link.port().output, b"SETPA0\rRESPA0\r".to_vec());
        assert_eq!(link.delay().waits, vec![SETTLE_DELAY, SETTLE_DELAY]);
    }

    // --- Tests for querying ---

    #[test]
    fn query_discards_input_then_reads_one_reply() {
        let mut link = transport(ScriptedPort::with_input(b"2048\r1234\r"));
        let counts = link.query(&Command::ReadVoltage).unwrap();

        assert_eq!(counts.get(), 2048);
        assert_eq!(link.port().discards, 1);
        assert_eq!(link.port().output, b"RD0\r".to_vec());
        // The second reply stays buffered for the next read.
        assert_eq!(link.port().input.len(), 5);
    }

    #[test]
    fn query_on_silent_link_yields_empty_reply() {
        let mut link = transport(ScriptedPort::default());
        let err = link.query(&Command::ReadCurrent).unwrap_err();

        match err {
            QueryError::Reply(parse) => assert_eq!(parse.kind, ParseErrorKind::Empty),
            other => panic!("expected a reply error, got {other:?}"),
        }
    }

    #[test]
    #[traced_test]
    fn query_logs_command_and_raw_reply_on_garbage() {
        let mut link = transport(ScriptedPort::with_input(b"OVR\r"));
        let err = link.query(&Command::ReadCurrent).unwrap_err();

        assert!(matches!(err, QueryError::Reply(_)));
        assert!(logs_contain("unexpected reply"));
        assert!(logs_contain("RD1"));
        assert!(logs_contain("OVR\\r"));
    }

    #[test]
    fn query_surfaces_link_failures() {
        let mut port = ScriptedPort::default();
        port.read_error = Some(io::ErrorKind::BrokenPipe);
        let mut link = transport(port);

        let err = link.query(&Command::ReadVoltage).unwrap_err();
        assert!(matches!(err, QueryError::Transport(TransportError::Io(_))));
    }

    #[test]
    fn open_reports_the_port_it_could_not_open() {
        let err = SerialTransport::open("/dev/does-not-exist-xray", 9600, DEFAULT_READ_TIMEOUT)
            .err()
            .expect("opening a missing device must fail");
        match err {
            TransportError::Open { port, .. } => assert_eq!(port, "/dev/does-not-exist-xray"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dwell_uses_the_transport_clock() {
        let mut link = transport(ScriptedPort::default());
        link.dwell(Duration::from_millis(100));
        assert_eq!(link.delay().total(), Duration::from_millis(100));
    }
}

//! # Simulated DI-RS232A tube interface
//!
//! An in-memory stand-in for the tube's serial interface. It tracks the
//! state of the I/O lines and DACs, answers monitor queries the way the real
//! hardware does, and records every command it receives. Plugged in behind
//! the [`Port`] trait it lets a whole sweep run without hardware.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use tracing::{debug, warn};

use crate::protocol::{Command, CommandError, CountValue, TERMINATOR};
use crate::transport::Port;

// The state of the simulated interface board and tube supplies.
#[derive(Debug, Clone)]
pub struct SimulatedTube {
    // Set by CPA1111100; line commands are ignored until then.
    io_configured: bool,
    // Raw level of the beam-enable line (SETPA0 / RESPA0).
    beam_line: bool,
    // Raw level of the auxiliary line (SETPA1 / RESPA1).
    aux_line: bool,
    // Interlock fault; cleared by pulsing the auxiliary line.
    fault_latched: bool,
    voltage_dac: CountValue,
    current_dac: CountValue,
    // Every framed command in arrival order, without terminator.
    history: Vec<String>,
    // --- Byte-level plumbing for the Port implementation ---
    pending_input: Vec<u8>,
    pending_output: VecDeque<u8>,
    garble_next_reply: bool,
}

impl Default for SimulatedTube {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTube {
    /// Creates an interface in its power-on state: ports unconfigured, all
    /// lines low, DACs at zero and the interlock fault latched.
    pub fn new() -> Self {
        Self {
            io_configured: false,
            beam_line: false,
            aux_line: false,
            fault_latched: true,
            voltage_dac: CountValue::ZERO,
            current_dac: CountValue::ZERO,
            history: Vec::new(),
            pending_input: Vec::new(),
            pending_output: VecDeque::new(),
            garble_next_reply: false,
        }
    }

    /// Processes one command and returns the reply text, if the command has one.
    pub fn process_command(&mut self, command_str: &str) -> Result<Option<String>, CommandError> {
        let text = command_str.trim_end_matches(char::from(TERMINATOR)).trim();
        self.history.push(text.to_string());

        let command = Command::parse(text)?;
        Ok(self.execute_command(command))
    }

    /// Whether the tube is currently emitting.
    pub fn beam_enabled(&self) -> bool {
        self.beam_line && !self.fault_latched
    }

    pub fn fault_latched(&self) -> bool {
        self.fault_latched
    }

    pub fn io_configured(&self) -> bool {
        self.io_configured
    }

    pub fn voltage_dac(&self) -> CountValue {
        self.voltage_dac
    }

    pub fn current_dac(&self) -> CountValue {
        self.current_dac
    }

    /// Commands received so far, oldest first.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Replaces the next monitor reply with non-numeric text.
    pub fn garble_next_reply(&mut self) {
        self.garble_next_reply = true;
    }

    fn execute_command(&mut self, command: Command) -> Option<String> {
        match command {
            Command::ConfigurePorts => {
                self.io_configured = true;
                None
            }
            Command::SetVoltage(counts) => {
                self.voltage_dac = counts;
                None
            }
            Command::SetCurrent(counts) => {
                self.current_dac = counts;
                None
            }
            Command::ReadVoltage => Some(self.monitor(self.voltage_dac).to_string()),
            Command::ReadCurrent => Some(self.monitor(self.current_dac).to_string()),
            line_command => {
                if !self.io_configured {
                    warn!(command = %line_command, "simulator: I/O ports not configured, ignoring");
                    return None;
                }
                self.drive_line(line_command);
                None
            }
        }
    }

    fn drive_line(&mut self, command: Command) {
        match command {
            Command::BeamEnable => {
                if self.fault_latched {
                    warn!("simulator: fault latched, beam stays off");
                }
                self.beam_line = true;
            }
            Command::BeamDisable => self.beam_line = false,
            Command::AuxAssert => self.aux_line = true,
            Command::AuxDeassert => {
                // A falling edge on the auxiliary line resets the interlock.
                if self.aux_line {
                    self.fault_latched = false;
                    debug!("simulator: fault latch cleared");
                }
                self.aux_line = false;
            }
            _ => {}
        }
    }

    // The monitors only read back a live value while the beam is on.
    fn monitor(&self, dac: CountValue) -> u16 {
        if self.beam_enabled() {
            dac.get()
        } else {
            0
        }
    }
}

impl Write for SimulatedTube {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending_input.extend_from_slice(buf);

        while let Some(end) = self.pending_input.iter().position(|&b| b == TERMINATOR) {
            let frame: Vec<u8> = self.pending_input.drain(..=end).collect();
            let text = String::from_utf8_lossy(&frame).into_owned();

            match self.process_command(&text) {
                Ok(Some(reply)) => {
                    let reply = if std::mem::take(&mut self.garble_next_reply) {
                        String::from("E?")
                    } else {
                        reply
                    };
                    self.pending_output.extend(reply.bytes());
                    self.pending_output.push_back(TERMINATOR);
                }
                Ok(None) => {}
                // The real interface stays silent on bad input.
                Err(e) => debug!("simulator: rejected command: {e}"),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedTube {
    /// Behaves like a serial port with a read timeout: an empty receive
    /// buffer is reported as `TimedOut`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending_output.is_empty() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let count = buf.len().min(self.pending_output.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending_output.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl Port for SimulatedTube {
    fn discard_input(&mut self) -> io::Result<()> {
        self.pending_output.clear();
        Ok(())
    }
}

//! Named tube operations on top of the raw transport.

use std::fmt;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info};

use crate::error::{QueryError, TransportError};
use crate::protocol::{counts_to_physical, to_counts, Command, CountValue};
use crate::transport::{Delay, Port, SerialTransport, ThreadDelay};

/// Hold between asserting and releasing the auxiliary line while clearing
/// faults. A hardware settle time.
pub const FAULT_CLEAR_DWELL: Duration = Duration::from_millis(100);

/// A decoded monitor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalReading {
    pub counts: CountValue,
    /// kV or µA depending on the channel.
    pub value: f64,
}

impl fmt::Display for PhysicalReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} (raw {})", self.value, self.counts.get())
    }
}

/// Drives one tube through its exclusively owned serial link.
///
/// Voltage calls take the channel's full scale explicitly; pass
/// [`KV_FULL_SCALE`](crate::protocol::KV_FULL_SCALE) for the standard 80 kV supply.
pub struct TubeController<P, D = ThreadDelay> {
    transport: SerialTransport<P, D>,
}

impl TubeController<Box<dyn SerialPort>, ThreadDelay> {
    /// Opens the serial link. Nothing is sent to the tube yet.
    pub fn open(
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        SerialTransport::open(port, baud_rate, read_timeout).map(Self::new)
    }
}

impl<P: Port, D: Delay> TubeController<P, D> {
    pub fn new(transport: SerialTransport<P, D>) -> Self {
        Self { transport }
    }

    /// Clears latched interface faults.
    ///
    /// The order is fixed by the interface: configure ports, release the
    /// beam line, pulse the auxiliary line with a 100 ms hold.
    pub fn initialize(&mut self) -> Result<(), TransportError> {
        debug!("clearing latched faults");
        self.transport.send(&Command::ConfigurePorts)?;
        self.transport.send(&Command::BeamDisable)?;
        self.transport.send(&Command::AuxAssert)?;
        self.transport.dwell(FAULT_CLEAR_DWELL);
        self.transport.send(&Command::AuxDeassert)?;
        Ok(())
    }

    /// Programs the voltage DAC. Returns the count that was sent.
    pub fn set_kv(&mut self, kv: f64, full_scale: f64) -> Result<CountValue, TransportError> {
        let counts = to_counts(kv, full_scale);
        self.transport.send(&Command::SetVoltage(counts))?;
        info!(kv, counts = counts.get(), "> SET kV (VA{counts})");
        Ok(counts)
    }

    /// Reads the voltage monitor. `Ok(None)` means the reply was unusable.
    pub fn get_kv(&mut self, full_scale: f64) -> Result<Option<PhysicalReading>, TransportError> {
        let reading = self.read_monitor(Command::ReadVoltage, full_scale)?;
        if let Some(reading) = reading {
            info!(
                kv = reading.value,
                counts = reading.counts.get(),
                "< voltage status {:.2} kV",
                reading.value
            );
        }
        Ok(reading)
    }

    /// Programs the current DAC against `full_scale` µA.
    pub fn set_ua(&mut self, ua: f64, full_scale: f64) -> Result<CountValue, TransportError> {
        let counts = to_counts(ua, full_scale);
        self.transport.send(&Command::SetCurrent(counts))?;
        info!(ua, counts = counts.get(), "> SET µA (VB{counts})");
        Ok(counts)
    }

    /// Reads the current monitor. `Ok(None)` means the reply was unusable.
    pub fn get_ua(&mut self, full_scale: f64) -> Result<Option<PhysicalReading>, TransportError> {
        let reading = self.read_monitor(Command::ReadCurrent, full_scale)?;
        if let Some(reading) = reading {
            info!(
                ua = reading.value,
                counts = reading.counts.get(),
                "< current status {:.2} µA",
                reading.value
            );
        }
        Ok(reading)
    }

    pub fn xray_on(&mut self) -> Result<(), TransportError> {
        self.transport.send(&Command::BeamEnable)?;
        info!("X-ray ON");
        Ok(())
    }

    /// Releases the beam-enable line. Safe to repeat.
    pub fn xray_off(&mut self) -> Result<(), TransportError> {
        self.transport.send(&Command::BeamDisable)?;
        info!("X-ray OFF");
        Ok(())
    }

    /// Blocks on the controller's clock.
    pub fn dwell(&mut self, duration: Duration) {
        self.transport.dwell(duration);
    }

    pub fn transport(&self) -> &SerialTransport<P, D> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut SerialTransport<P, D> {
        &mut self.transport
    }

    fn read_monitor(
        &mut self,
        command: Command,
        full_scale: f64,
    ) -> Result<Option<PhysicalReading>, TransportError> {
        match self.transport.query(&command) {
            Ok(counts) => Ok(Some(PhysicalReading {
                counts,
                value: counts_to_physical(counts, full_scale),
            })),
            // Already logged by the transport.
            Err(QueryError::Reply(_)) => Ok(None),
            Err(QueryError::Transport(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KV_FULL_SCALE;
    use crate::simulator::SimulatedTube;
    use crate::transport::tests::RecordingDelay;
    use crate::transport::SETTLE_DELAY;

    fn controller() -> TubeController<SimulatedTube, RecordingDelay> {
        TubeController::new(SerialTransport::new(
            SimulatedTube::new(),
            RecordingDelay::default(),
        ))
    }

    fn history(tube: &TubeController<SimulatedTube, RecordingDelay>) -> Vec<&str> {
        tube.transport().port().history().iter().map(String::as_str).collect()
    }

    // --- Tests for fault clearing ---

    #[test]
    fn initialize_sends_fault_clear_sequence_in_order() {
        let mut tube = controller();
        tube.initialize().unwrap();

        assert_eq!(history(&tube), vec!["CPA1111100", "RESPA0", "SETPA1", "RESPA1"]);
        assert!(!tube.transport().port().fault_latched());
    }

    #[test]
    fn initialize_holds_the_aux_line_for_100ms() {
        let mut tube = controller();
        tube.initialize().unwrap();

        // Three settle delays, the dwell, then the last settle delay.
        assert_eq!(
            tube.transport().delay().waits,
            vec![SETTLE_DELAY, SETTLE_DELAY, SETTLE_DELAY, FAULT_CLEAR_DWELL, SETTLE_DELAY]
        );
    }

    // --- Tests for setpoints and readbacks ---

    #[test]
    fn set_kv_quantizes_against_80kv() {
        let mut tube = controller();
        let counts = tube.set_kv(70.0, KV_FULL_SCALE).unwrap();

        assert_eq!(counts.get(), 3583);
        assert_eq!(history(&tube), vec!["VA3583"]);
    }

    #[test]
    fn set_kv_honours_custom_full_scale() {
        let mut tube = controller();
        tube.set_kv(50.0, 100.0).unwrap();
        assert_eq!(history(&tube), vec!["VA2048"]);
    }

    #[test]
    fn set_ua_pads_counts_to_four_digits() {
        let mut tube = controller();
        tube.set_ua(1.0, 250.0).unwrap();
        tube.set_ua(20.0, 250.0).unwrap();
        assert_eq!(history(&tube), vec!["VB0016", "VB0328"]);
    }

    #[test]
    fn readbacks_decode_monitor_counts() {
        let mut tube = controller();
        tube.initialize().unwrap();
        tube.set_kv(70.0, KV_FULL_SCALE).unwrap();
        tube.set_ua(100.0, 250.0).unwrap();
        tube.xray_on().unwrap();

        let kv = tube.get_kv(KV_FULL_SCALE).unwrap().unwrap();
        assert_eq!(kv.counts.get(), 3583);
        assert!((kv.value - 70.0).abs() <= KV_FULL_SCALE / 4095.0);

        let ua = tube.get_ua(250.0).unwrap().unwrap();
        assert_eq!(ua.counts.get(), 1638);
        assert!((ua.value - 100.0).abs() <= 250.0 / 4095.0);
    }

    #[test]
    fn garbled_reply_becomes_unavailable_reading() {
        let mut tube = controller();
        tube.transport_mut().port_mut().garble_next_reply();

        assert_eq!(tube.get_kv(KV_FULL_SCALE).unwrap(), None);
        // The next query is unaffected.
        assert!(tube.get_kv(KV_FULL_SCALE).unwrap().is_some());
    }

    // --- Tests for beam control ---

    #[test]
    fn xray_on_and_off_are_distinct_commands() {
        let mut tube = controller();
        tube.initialize().unwrap();

        tube.xray_on().unwrap();
        assert!(tube.transport().port().beam_enabled());
        tube.xray_off().unwrap();
        assert!(!tube.transport().port().beam_enabled());
        tube.xray_off().unwrap();

        assert_eq!(&history(&tube)[4..], ["SETPA0", "RESPA0", "RESPA0"]);
    }
}

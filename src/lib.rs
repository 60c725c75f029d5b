//! # X-ray tube current sweeps
//!
//! This library drives the high-voltage and current supplies of an X-ray tube
//! through the ASCII command set of its DI-RS232A serial interface. It sweeps
//! the tube current across a configured range at fixed voltage and makes sure
//! the beam is switched off however the sweep ends.
//!
//! The layers, leaves first:
//! - [`protocol`]: DAC count quantization, the command table, reply parsing.
//! - [`transport`]: the exclusively owned serial link and its timing.
//! - [`tube`]: named tube operations (fault clear, setpoints, readbacks, beam).
//! - [`sequencer`]: the discrete-pulse and continuous-ramp sweep state machine.
//!
//! [`simulator`] provides an in-memory tube interface for dry runs and tests.

pub mod cancel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod sequencer;
pub mod simulator;
pub mod transport;
pub mod tube;

pub use cancel::CancelToken;
pub use config::{SerialSettings, Settings, SweepConfig, SweepMode};
pub use error::{ConfigError, QueryError, SweepError, TransportError};
pub use protocol::{Command, CountValue, ParseError};
pub use sequencer::{
    PulseSequencer, SequenceState, StepRecord, SweepObserver, SweepOutcome, SweepReport,
};
pub use simulator::SimulatedTube;
pub use transport::{Delay, Port, SerialTransport, ThreadDelay};
pub use tube::{PhysicalReading, TubeController};

//! Error types shared across the crate.
//!
//! Reply decoding failures ([`ParseError`](crate::protocol::ParseError)) are
//! deliberately absent from [`SweepError`]: a bad reading never aborts a
//! sweep, it only makes that reading unavailable.

use std::io;

use thiserror::Error;

/// Failures of the serial link itself.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The port could not be opened. Nothing has been sent to the tube.
    #[error("failed to open serial port '{port}': {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Invalid settings, caught before any command reaches the tube.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not load settings: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("step_ua must be greater than zero (got {0})")]
    NonPositiveStep(f64),

    #[error("start_ua ({start}) is greater than end_ua ({end})")]
    StartAboveEnd { start: f64, end: f64 },

    #[error(
        "sweep {start} -> {end} in steps of {step} has more than {} steps",
        crate::config::MAX_STEPS
    )]
    TooManySteps { start: f64, step: f64, end: f64 },

    #[error("settle_time ({settle:?}) is longer than on_time ({on:?})")]
    SettleExceedsOn {
        settle: std::time::Duration,
        on: std::time::Duration,
    },

    #[error("discrete pulse sweeps need an off_time")]
    MissingOffTime,

    #[error("{name} full scale must be greater than zero (got {value})")]
    NonPositiveFullScale { name: &'static str, value: f64 },

    #[error("{name} must not be negative (got {value})")]
    NegativeSetpoint { name: &'static str, value: f64 },

    #[error("{name} ({value}) exceeds its full scale ({full_scale})")]
    SetpointAboveFullScale {
        name: &'static str,
        value: f64,
        full_scale: f64,
    },

    #[error("baud rate must be greater than zero")]
    InvalidBaudRate,
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Reasons a sweep ends with an error instead of a [`SweepReport`](crate::sequencer::SweepReport).
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid sweep configuration: {0}")]
    Config(#[from] ConfigError),

    /// The link failed mid-sweep. The beam-disable command was still sent.
    #[error("sweep aborted: {0}")]
    Transport(#[from] TransportError),

    /// Sending the beam-disable command itself failed. Treat the tube as
    /// possibly still emitting.
    #[error("failed to switch the beam off during shutdown: {0}")]
    Shutdown(#[source] TransportError),
}

/// Outcome of a failed monitor query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The reply arrived but was not a count. The link is still usable.
    #[error(transparent)]
    Reply(#[from] crate::protocol::ParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

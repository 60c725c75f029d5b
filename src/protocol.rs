//! Wire-level pieces of the DI-RS232A command set.
//!
//! Everything in here is pure: quantizing physical values to 12-bit DAC
//! counts and back, the fixed table of ASCII commands, and decoding of the
//! integer replies sent by the monitor channels.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use thiserror::Error;

/// Highest count a 12-bit DAC or ADC channel carries.
pub const MAX_COUNTS: u16 = 4095;

/// Every command and every reply ends with a carriage return.
pub const TERMINATOR: u8 = b'\r';

/// Physical voltage that corresponds to count 4095 on the kV channel.
pub const KV_FULL_SCALE: f64 = 80.0;

/// A quantized channel value, always within `0..=4095`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CountValue(u16);

impl CountValue {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(MAX_COUNTS);

    /// Creates a count, clamping anything above 4095.
    pub fn new(raw: u16) -> Self {
        Self(raw.min(MAX_COUNTS))
    }

    fn saturating(raw: i64) -> Self {
        Self(raw.clamp(0, i64::from(MAX_COUNTS)) as u16)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CountValue {
    /// Counts go over the wire zero-padded to four digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Maps a physical value in `0..=full_scale` onto a count.
///
/// Out-of-range input (including negative values and NaN) is clamped rather
/// than rejected.
pub fn to_counts(value: f64, full_scale: f64) -> CountValue {
    let scaled = (value / full_scale * f64::from(MAX_COUNTS)).round();
    if scaled.is_nan() {
        return CountValue::ZERO;
    }
    CountValue::new(scaled.clamp(0.0, f64::from(MAX_COUNTS)) as u16)
}

/// Inverse of [`to_counts`], up to one count of quantization error.
pub fn counts_to_physical(counts: CountValue, full_scale: f64) -> f64 {
    f64::from(counts.get()) / f64::from(MAX_COUNTS) * full_scale
}

/// A monitor reply that could not be turned into a count.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unparseable reply \"{}\": {kind}", .raw.escape_ascii())]
pub struct ParseError {
    /// The bytes exactly as they came off the link, terminator included.
    pub raw: Vec<u8>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("reply contains non-ASCII bytes")]
    NotAscii,
    #[error("reply is empty")]
    Empty,
    #[error("reply is not a base-10 integer")]
    NotInteger(#[source] ParseIntError),
}

/// Decodes an ASCII integer reply such as `b"2048\r"`.
///
/// Surrounding whitespace (including the terminator) is ignored. Values
/// outside the 12-bit range are clamped.
pub fn parse_reply(bytes: &[u8]) -> Result<CountValue, ParseError> {
    let fail = |kind: ParseErrorKind| ParseError {
        raw: bytes.to_vec(),
        kind,
    };

    if !bytes.is_ascii() {
        return Err(fail(ParseErrorKind::NotAscii));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| fail(ParseErrorKind::NotAscii))?
        .trim();
    if text.is_empty() {
        return Err(fail(ParseErrorKind::Empty));
    }

    let value: i64 = text
        .parse()
        .map_err(|e| fail(ParseErrorKind::NotInteger(e)))?;
    Ok(CountValue::saturating(value))
}

// Errors raised when a command string is not part of the command table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Nothing left once the terminator and whitespace are stripped.
    #[error("empty command")]
    Empty,
    /// A `VA`/`VB` command without exactly four digits in `0000..=4095`.
    #[error("invalid DAC count in {0:?}")]
    InvalidCount(String),
    /// Well-formed text that the interface does not recognize.
    #[error("unknown command {0:?}")]
    Unknown(String),
}

/// One entry of the interface's command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `CPA1111100`: configure the I/O port directions.
    ConfigurePorts,
    /// `RESPA0`: deassert the beam-enable line.
    BeamDisable,
    /// `SETPA1`: assert the auxiliary control line.
    AuxAssert,
    /// `RESPA1`: deassert the auxiliary control line.
    AuxDeassert,
    /// `SETPA0`: assert the beam-enable line.
    BeamEnable,
    /// `VA####`: program the voltage DAC.
    SetVoltage(CountValue),
    /// `VB####`: program the current DAC.
    SetCurrent(CountValue),
    /// `RD0`: read the voltage monitor.
    ReadVoltage,
    /// `RD1`: read the current monitor.
    ReadCurrent,
}

impl Command {
    /// The command text without its terminator.
    pub fn body(&self) -> String {
        match self {
            Command::ConfigurePorts => String::from("CPA1111100"),
            Command::BeamDisable => String::from("RESPA0"),
            Command::AuxAssert => String::from("SETPA1"),
            Command::AuxDeassert => String::from("RESPA1"),
            Command::BeamEnable => String::from("SETPA0"),
            Command::SetVoltage(counts) => format!("VA{counts}"),
            Command::SetCurrent(counts) => format!("VB{counts}"),
            Command::ReadVoltage => String::from("RD0"),
            Command::ReadCurrent => String::from("RD1"),
        }
    }

    /// The bytes put on the wire, terminator included.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.body().into_bytes();
        bytes.push(TERMINATOR);
        bytes
    }

    /// Parses command text as received by the interface, with or without
    /// its terminator.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let text = text.trim_end_matches(char::from(TERMINATOR)).trim();
        if text.is_empty() {
            return Err(CommandError::Empty);
        }

        match text {
            "CPA1111100" => return Ok(Command::ConfigurePorts),
            "RESPA0" => return Ok(Command::BeamDisable),
            "SETPA1" => return Ok(Command::AuxAssert),
            "RESPA1" => return Ok(Command::AuxDeassert),
            "SETPA0" => return Ok(Command::BeamEnable),
            "RD0" => return Ok(Command::ReadVoltage),
            "RD1" => return Ok(Command::ReadCurrent),
            _ => {}
        }

        let (prefix, digits) = match (text.get(..2), text.get(2..)) {
            (Some(prefix), Some(digits)) => (prefix, digits),
            _ => return Err(CommandError::Unknown(text.to_string())),
        };
        let build: fn(CountValue) -> Command = match prefix {
            "VA" => Command::SetVoltage,
            "VB" => Command::SetCurrent,
            _ => return Err(CommandError::Unknown(text.to_string())),
        };

        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CommandError::InvalidCount(text.to_string()));
        }
        let raw: u16 = digits
            .parse()
            .map_err(|_| CommandError::InvalidCount(text.to_string()))?;
        if raw > MAX_COUNTS {
            return Err(CommandError::InvalidCount(text.to_string()));
        }
        Ok(build(CountValue(raw)))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body())
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse(s)
    }
}

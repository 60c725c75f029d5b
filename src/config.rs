//! Sweep and link settings.
//!
//! Settings are layered with figment, lowest precedence first:
//! 1. built-in defaults (the bench's usual 70 kV, 20-200 µA sweep)
//! 2. an optional TOML file
//! 3. environment variables prefixed with `XRAY_`, sections split on `__`
//!    (for example `XRAY_SWEEP__KV_SET=60`)
//!
//! The CLI applies its own flags on top of the result.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::KV_FULL_SCALE;
use crate::transport::{DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT};

/// Upper bound on the number of steps in one sweep.
pub const MAX_STEPS: usize = 100_000;

// Relative slack for float rounding in `start + k * step`, so 0.1 -> 0.3 in
// steps of 0.1 still ends on 0.3. A few ulps, nothing more.
const ROUNDING_SLACK: f64 = 8.0 * f64::EPSILON;

/// How the beam behaves between current steps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// Every step is a full ON/OFF pulse.
    #[default]
    Discrete,
    /// The beam stays on while the current is stepped.
    #[value(alias = "continuous")]
    #[serde(alias = "continuous")]
    ContinuousRamp,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub serial: SerialSettings,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port name, e.g. `COM1` or `/dev/ttyUSB0`.
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Timeout for a single monitor reply.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

/// One current sweep at fixed voltage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default)]
    pub mode: SweepMode,
    /// Tube voltage held for the whole sweep, kV.
    pub kv_set: f64,
    #[serde(default = "default_kv_full_scale")]
    pub kv_full_scale: f64,
    /// Full-scale tube current, µA.
    pub max_ua: f64,
    pub start_ua: f64,
    pub step_ua: f64,
    pub end_ua: f64,
    /// Nominal time at each current, settle time included.
    #[serde(with = "humantime_serde")]
    pub on_time: Duration,
    /// Beam-off gap between pulses. Discrete mode only.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub off_time: Option<Duration>,
    /// Wait after a change before the monitors are read.
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    /// Countdown before the sweep starts.
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

fn default_kv_full_scale() -> f64 {
    KV_FULL_SCALE
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::from("COM1"),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            mode: SweepMode::Discrete,
            kv_set: 70.0,
            kv_full_scale: KV_FULL_SCALE,
            max_ua: 250.0,
            start_ua: 20.0,
            step_ua: 20.0,
            end_ua: 200.0,
            on_time: Duration::from_secs(10),
            off_time: Some(Duration::from_secs(10)),
            settle_time: Duration::from_secs(2),
            wait_time: Duration::from_secs(20),
        }
    }
}

impl Settings {
    /// Loads defaults, then `path` (if given), then `XRAY_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("XRAY_").split("__"))
            .extract()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.serial.validate()?;
        self.sweep.validate()
    }
}

impl SerialSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::InvalidBaudRate);
        }
        Ok(())
    }
}

impl SweepConfig {
    /// Checks every invariant the sequencer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("kV", self.kv_full_scale), ("µA", self.max_ua)] {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::NonPositiveFullScale { name, value });
            }
        }
        if self.step_ua.is_nan() || self.step_ua <= 0.0 {
            return Err(ConfigError::NonPositiveStep(self.step_ua));
        }
        for (name, value) in [
            ("kv_set", self.kv_set),
            ("start_ua", self.start_ua),
            ("end_ua", self.end_ua),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(ConfigError::NegativeSetpoint { name, value });
            }
        }
        if self.start_ua > self.end_ua {
            return Err(ConfigError::StartAboveEnd {
                start: self.start_ua,
                end: self.end_ua,
            });
        }
        let span = (self.end_ua - self.start_ua) / self.step_ua;
        if !span.is_finite() || self.step_count() > MAX_STEPS {
            return Err(ConfigError::TooManySteps {
                start: self.start_ua,
                step: self.step_ua,
                end: self.end_ua,
            });
        }
        if self.kv_set > self.kv_full_scale {
            return Err(ConfigError::SetpointAboveFullScale {
                name: "kv_set",
                value: self.kv_set,
                full_scale: self.kv_full_scale,
            });
        }
        if self.end_ua > self.max_ua {
            return Err(ConfigError::SetpointAboveFullScale {
                name: "end_ua",
                value: self.end_ua,
                full_scale: self.max_ua,
            });
        }
        if self.settle_time > self.on_time {
            return Err(ConfigError::SettleExceedsOn {
                settle: self.settle_time,
                on: self.on_time,
            });
        }
        if self.mode == SweepMode::Discrete && self.off_time.is_none() {
            return Err(ConfigError::MissingOffTime);
        }
        Ok(())
    }

    /// Number of steps, `floor((end - start) / step) + 1`.
    ///
    /// A point that lands on `end_ua` up to float rounding counts as on it.
    /// Saturates a little above [`MAX_STEPS`], which
    /// [`validate`](Self::validate) rejects.
    pub fn step_count(&self) -> usize {
        let span = (self.end_ua - self.start_ua) / self.step_ua;
        let whole = span.max(0.0).floor().min(MAX_STEPS as f64) as usize;
        if self.reaches_end(whole + 1) {
            whole + 2
        } else {
            whole + 1
        }
    }

    /// The current setpoints in sweep order, `start_ua + k * step_ua`.
    /// Never exceeds `end_ua`.
    pub fn setpoints(&self) -> Vec<f64> {
        (0..self.step_count())
            .map(|k| self.point(k).min(self.end_ua))
            .collect()
    }

    fn point(&self, k: usize) -> f64 {
        self.start_ua + k as f64 * self.step_ua
    }

    // Whether point `k` is at or below `end_ua` once rounding is allowed for.
    fn reaches_end(&self, k: usize) -> bool {
        let value = self.point(k);
        let slack = ROUNDING_SLACK * self.end_ua.abs().max(self.step_ua);
        value <= self.end_ua + slack
    }

    /// Time left of the ON interval once the readback settle has elapsed.
    pub fn hold_time(&self) -> Duration {
        self.on_time.saturating_sub(self.settle_time)
    }
}

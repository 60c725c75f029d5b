//! Current sweeps at fixed tube voltage.
//!
//! A [`PulseSequencer`] borrows a [`TubeController`] for the length of one
//! sweep and walks it through the [`SequenceState`] machine:
//!
//! ```text
//! Idle -> Initializing -> CountingDown -> SettingVoltage
//!      -> (StepActive -> Settling -> Holding [-> StepOff -> InterStepWait])*
//!      -> ShuttingDown -> Done | Aborted
//! ```
//!
//! Whatever ends the sweep (completion, a link failure, or the operator's
//! cancel), the beam-disable command is the last thing sent before
//! [`PulseSequencer::run`] returns. If the sequencer is dropped mid-sweep,
//! for example while unwinding a panic, its `Drop` impl sends it instead.

use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::cancel::CancelToken;
use crate::config::SweepConfig;
use crate::error::{SweepError, TransportError};
use crate::protocol::CountValue;
use crate::transport::{Delay, Port};
use crate::tube::{PhysicalReading, TubeController};

pub use crate::config::SweepMode;

/// Longest stretch of waiting between two cancellation checks.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    Initializing,
    CountingDown,
    SettingVoltage,
    StepActive,
    Settling,
    Holding,
    StepOff,
    InterStepWait,
    ShuttingDown,
    Done,
    Aborted,
}

impl SequenceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SequenceState::Done | SequenceState::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed,
    /// Stopped by the operator. The beam was switched off first.
    Cancelled,
}

/// Setpoint and readbacks of one sweep step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub index: usize,
    pub setpoint_ua: f64,
    pub counts: CountValue,
    /// `None` when the monitor reply was unusable.
    pub kv: Option<PhysicalReading>,
    pub ua: Option<PhysicalReading>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub mode: SweepMode,
    pub outcome: SweepOutcome,
    pub steps: Vec<StepRecord>,
    /// Every state entered, in order, ending with `Done` or `Aborted`.
    pub states: Vec<SequenceState>,
}

/// Progress hooks for a live display. All methods default to no-ops.
pub trait SweepObserver {
    fn on_state(&mut self, _state: SequenceState) {}

    /// Called once per second of the countdown, then with 0.
    fn on_countdown(&mut self, _remaining_secs: u64) {}

    fn on_step(&mut self, _step: &StepRecord) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SweepObserver for NoopObserver {}

// Why the sweep body stopped early.
enum Interrupt {
    Cancelled,
    Transport(TransportError),
}

impl From<TransportError> for Interrupt {
    fn from(err: TransportError) -> Self {
        Interrupt::Transport(err)
    }
}

pub struct PulseSequencer<'a, P, D>
where
    P: Port,
    D: Delay,
{
    tube: &'a mut TubeController<P, D>,
    config: SweepConfig,
    cancel: CancelToken,
    observer: Box<dyn SweepObserver + 'a>,
    state: SequenceState,
    states: Vec<SequenceState>,
    steps: Vec<StepRecord>,
}

impl<'a, P, D> PulseSequencer<'a, P, D>
where
    P: Port,
    D: Delay,
{
    pub fn new(
        tube: &'a mut TubeController<P, D>,
        config: SweepConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            tube,
            config,
            cancel,
            observer: Box::new(NoopObserver),
            state: SequenceState::Idle,
            states: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn SweepObserver + 'a>) -> Self {
        self.observer = observer;
        self
    }

    /// Runs the sweep to completion or cancellation.
    ///
    /// The configuration is validated before anything is sent. A cancelled
    /// sweep is not an error: it returns a report with
    /// [`SweepOutcome::Cancelled`].
    pub fn run(mut self) -> Result<SweepReport, SweepError> {
        let span = info_span!("sweep", mode = ?self.config.mode);
        let _enter = span.enter();

        self.config.validate()?;
        info!(
            kv = self.config.kv_set,
            start_ua = self.config.start_ua,
            step_ua = self.config.step_ua,
            end_ua = self.config.end_ua,
            steps = self.config.step_count(),
            "starting sweep"
        );

        let body = self.execute();
        let shutdown = self.shutdown();

        let outcome = match (body, shutdown) {
            (body, Err(err)) => {
                self.enter(SequenceState::Aborted);
                if let Err(Interrupt::Transport(cause)) = body {
                    error!(%cause, "sweep failed before shutdown");
                }
                error!(%err, "could not switch the X-ray off; check the tube");
                return Err(SweepError::Shutdown(err));
            }
            (Ok(()), Ok(())) => {
                self.enter(SequenceState::Done);
                info!("pulse sequence complete, X-ray is OFF");
                SweepOutcome::Completed
            }
            (Err(Interrupt::Cancelled), Ok(())) => {
                self.enter(SequenceState::Aborted);
                warn!("interrupted by operator, X-ray turned OFF for safety");
                SweepOutcome::Cancelled
            }
            (Err(Interrupt::Transport(err)), Ok(())) => {
                self.enter(SequenceState::Aborted);
                error!(%err, "sweep aborted, X-ray turned OFF for safety");
                return Err(SweepError::Transport(err));
            }
        };

        Ok(SweepReport {
            mode: self.config.mode,
            outcome,
            steps: std::mem::take(&mut self.steps),
            states: std::mem::take(&mut self.states),
        })
    }

    fn execute(&mut self) -> Result<(), Interrupt> {
        self.prologue()?;
        match self.config.mode {
            SweepMode::Discrete => self.run_pulses(),
            SweepMode::ContinuousRamp => self.run_ramp(),
        }
    }

    fn prologue(&mut self) -> Result<(), Interrupt> {
        self.enter(SequenceState::Initializing);
        self.checkpoint()?;
        self.tube.initialize()?;

        // Only the pulsed variant forces the beam off and settles here.
        if self.config.mode == SweepMode::Discrete {
            self.checkpoint()?;
            self.tube.xray_off()?;
            self.wait(self.config.settle_time)?;
        }

        self.enter(SequenceState::CountingDown);
        self.countdown()?;

        self.enter(SequenceState::SettingVoltage);
        self.checkpoint()?;
        self.tube.set_kv(self.config.kv_set, self.config.kv_full_scale)?;
        Ok(())
    }

    fn countdown(&mut self) -> Result<(), Interrupt> {
        let total = self.config.wait_time;
        let whole_secs = total.as_secs();
        info!(seconds = whole_secs, "X-ray pulse measurement is about to start");

        for remaining in (1..=whole_secs).rev() {
            self.observer.on_countdown(remaining);
            debug!(remaining, "starting in {remaining} seconds");
            self.wait(Duration::from_secs(1))?;
        }
        self.wait(total - Duration::from_secs(whole_secs))?;

        self.observer.on_countdown(0);
        info!("starting now");
        Ok(())
    }

    // Each step is a full ON/OFF pulse.
    fn run_pulses(&mut self) -> Result<(), Interrupt> {
        let off_time = self.config.off_time.unwrap_or_default();

        for (index, ua) in self.config.setpoints().into_iter().enumerate() {
            self.enter(SequenceState::StepActive);
            self.checkpoint()?;
            let counts = self.tube.set_ua(ua, self.config.max_ua)?;
            self.checkpoint()?;
            self.tube.xray_on()?;

            self.settle_and_read(index, ua, counts)?;

            self.enter(SequenceState::StepOff);
            self.checkpoint()?;
            self.tube.xray_off()?;

            self.enter(SequenceState::InterStepWait);
            self.wait(off_time)?;
        }
        Ok(())
    }

    // The beam goes on once with the first setpoint and off once after the last.
    fn run_ramp(&mut self) -> Result<(), Interrupt> {
        for (index, ua) in self.config.setpoints().into_iter().enumerate() {
            self.enter(SequenceState::StepActive);
            self.checkpoint()?;
            let counts = self.tube.set_ua(ua, self.config.max_ua)?;
            if index == 0 {
                self.checkpoint()?;
                self.tube.xray_on()?;
            }

            self.settle_and_read(index, ua, counts)?;
        }

        self.enter(SequenceState::StepOff);
        self.checkpoint()?;
        self.tube.xray_off()?;
        Ok(())
    }

    fn settle_and_read(
        &mut self,
        index: usize,
        ua: f64,
        counts: CountValue,
    ) -> Result<(), Interrupt> {
        self.enter(SequenceState::Settling);
        self.wait(self.config.settle_time)?;

        // Readbacks are telemetry only; they never adjust a setpoint.
        self.checkpoint()?;
        let kv = self.tube.get_kv(self.config.kv_full_scale)?;
        self.checkpoint()?;
        let ua_reading = self.tube.get_ua(self.config.max_ua)?;
        if kv.is_none() || ua_reading.is_none() {
            warn!(step = index, "readback unavailable, continuing");
        }

        let record = StepRecord {
            index,
            setpoint_ua: ua,
            counts,
            kv,
            ua: ua_reading,
        };
        self.observer.on_step(&record);
        self.steps.push(record);

        self.enter(SequenceState::Holding);
        self.wait(self.config.hold_time())
    }

    // Never interruptible: this is where every exit path converges.
    fn shutdown(&mut self) -> Result<(), TransportError> {
        self.enter(SequenceState::ShuttingDown);
        self.tube.xray_off()
    }

    /// Waits `duration` in slices, checking for cancellation between them.
    fn wait(&mut self, duration: Duration) -> Result<(), Interrupt> {
        let mut remaining = duration;
        loop {
            self.checkpoint()?;
            if remaining.is_zero() {
                return Ok(());
            }
            let slice = remaining.min(CANCEL_POLL_INTERVAL);
            self.tube.dwell(slice);
            remaining -= slice;
        }
    }

    fn checkpoint(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            debug!(state = ?self.state, "cancellation observed");
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn enter(&mut self, state: SequenceState) {
        debug!(from = ?self.state, to = ?state, "state transition");
        self.state = state;
        self.states.push(state);
        self.observer.on_state(state);
    }
}

impl<'a, P, D> Drop for PulseSequencer<'a, P, D>
where
    P: Port,
    D: Delay,
{
    fn drop(&mut self) {
        if self.state == SequenceState::Idle || self.state.is_terminal() {
            return;
        }
        error!(state = ?self.state, "sweep dropped mid-sequence, forcing X-ray OFF");
        if let Err(err) = self.tube.xray_off() {
            error!(%err, "could not switch the X-ray off; check the tube");
        }
    }
}

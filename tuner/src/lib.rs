//! Step-response identification and IMC tuning for the oven
//!
//! The firmware holds a fixed power step while the host records the
//! temperature rise; stopping the recording fits an FOPDT model and the
//! model plus a lambda turn into PID gains for upload.

mod fopdt;
mod imc;

pub use fopdt::{identify, FopdtModel};
pub use imc::{imc_gains, Gains};

use std::time::Instant;

use log::{info, warn};

/// Identification session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerState {
    Idle,
    Recording,
    Identified,
}

/// Records a step-response session and fits a model when it ends.
///
/// Live values update on every ingest no matter the state, so displays
/// always have something current to show; the sample buffer only grows
/// while a session is recording, and every new session starts empty.
pub struct StepAnalyzer {
    state: TunerState,
    samples: Vec<(f32, f32)>,
    started: Option<Instant>,
    base_temp_c: f32,
    step_pwr_pct: f32,
    latest_temp_c: f32,
    latest_out_pct: u8,
    model: Option<FopdtModel>,
}

impl StepAnalyzer {
    pub fn new() -> Self {
        Self {
            state: TunerState::Idle,
            samples: Vec::new(),
            started: None,
            base_temp_c: 0.0,
            step_pwr_pct: 0.0,
            latest_temp_c: 0.0,
            latest_out_pct: 0,
            model: None,
        }
    }

    /// Begin a session. Clears the previous buffer and model.
    pub fn start(&mut self, base_temp_c: f32, step_pwr_pct: f32) {
        self.samples.clear();
        self.base_temp_c = base_temp_c;
        self.step_pwr_pct = step_pwr_pct;
        self.model = None;
        self.started = Some(Instant::now());
        self.state = TunerState::Recording;

        info!(
            "step test started at {:.1}C base, {:.0}% power",
            base_temp_c, step_pwr_pct
        );
    }

    /// Feed the latest telemetry. Always refreshes the live values;
    /// additionally appends to the session buffer while recording.
    pub fn ingest(&mut self, temp_c: f32, out_pct: u8) {
        self.latest_temp_c = temp_c;
        self.latest_out_pct = out_pct;

        if self.state == TunerState::Recording {
            let elapsed_s = match self.started {
                Some(started) => started.elapsed().as_secs_f32(),
                None => 0.0,
            };

            self.push_sample(elapsed_s, temp_c);
        }
    }

    /// Append one `(elapsed, temp)` point. Elapsed time never runs
    /// backwards within a session; a stale point is dropped.
    pub fn push_sample(&mut self, elapsed_s: f32, temp_c: f32) {
        if self.state != TunerState::Recording {
            return;
        }

        if let Some(&(last, _)) = self.samples.last() {
            if elapsed_s < last {
                warn!("out of order sample at {}s dropped", elapsed_s);
                return;
            }
        }

        self.samples.push((elapsed_s, temp_c));
    }

    /// End the session and run the fit. Returns the model, or `None`
    /// when the recording couldn't be identified.
    pub fn stop(&mut self) -> Option<FopdtModel> {
        self.model = identify(&self.samples, self.base_temp_c, self.step_pwr_pct);

        self.state = match self.model {
            Some(model) => {
                info!(
                    "identified: gain={} tau={}s theta={}s delta={}C",
                    model.gain, model.tau_s, model.dead_time_s, model.delta_temp_c
                );
                TunerState::Identified
            }
            None => {
                info!("recording could not be identified");
                TunerState::Idle
            }
        };

        self.model
    }

    /// Kill the session without producing anything. A safety abort must
    /// never yield a usable model, even from sufficient data.
    pub fn abort(&mut self) {
        self.samples.clear();
        self.model = None;
        self.state = TunerState::Idle;
    }

    #[inline]
    pub fn state(&self) -> TunerState {
        self.state
    }

    #[inline]
    pub fn model(&self) -> Option<FopdtModel> {
        self.model
    }

    #[inline]
    pub fn latest_temp_c(&self) -> f32 {
        self.latest_temp_c
    }

    #[inline]
    pub fn latest_out_pct(&self) -> u8 {
        self.latest_out_pct
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Default for StepAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

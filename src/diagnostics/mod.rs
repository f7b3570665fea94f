//! Serialisable per-step diagnostics.
//!
//! [`StepReport`] is returned with every actor step: stage timings, the loss
//! strategy that ran and, when the composition objective was evaluated, the
//! coverage of the training mask at each level.

pub mod masks;

pub use masks::{LevelMaskReport, MaskStage};

use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    pub label: String,
    pub elapsed_ms: f64,
}

/// Wall-clock trace of the stages of one run, in execution order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingBreakdown {
    pub total_ms: f64,
    pub stages: Vec<StageTiming>,
}

impl TimingBreakdown {
    pub fn push(&mut self, label: impl Into<String>, elapsed_ms: f64) {
        self.stages.push(StageTiming {
            label: label.into(),
            elapsed_ms,
        });
    }
}

/// Stopwatch that records consecutive stages into a [`TimingBreakdown`].
#[derive(Debug)]
pub struct StageClock {
    started: Instant,
    lap: Instant,
}

impl StageClock {
    pub fn start() -> Self {
        let now = Instant::now();
        Self { started: now, lap: now }
    }

    /// Record the time since the previous lap under `label`.
    pub fn lap(&mut self, timing: &mut TimingBreakdown, label: &str) {
        let now = Instant::now();
        timing.push(label, ms(now - self.lap));
        self.lap = now;
    }

    /// Restart the current lap without recording it.
    pub fn skip(&mut self) {
        self.lap = Instant::now();
    }

    pub fn total_ms(&self) -> f64 {
        ms(self.started.elapsed())
    }
}

fn ms(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub epoch: usize,
    pub iteration: usize,
    pub training: bool,
    pub loss_name: String,
    pub batch_size: usize,
    /// Flow resolution `(height, width)` of the supervised triplet.
    pub flow_size: (usize, usize),
    /// Number of backbone forward passes run by the step.
    pub forward_passes: usize,
    pub used_shared_pyramids: bool,
    pub masks: Option<MaskStage>,
    pub timing: TimingBreakdown,
}

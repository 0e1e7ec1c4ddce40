//! Per-frame orchestration of the online fit.
//!
//! Bootstrapping → Fitting once enough neurons are observed; Terminal after
//! shutdown. Every tick is self-contained: errors are logged and the tick is
//! dropped, never propagated to the driver.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ndarray::{s, Array1, Array2, ArrayView2, Axis};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::boundary::{
    ActivityFrame, AnalysisBundle, AnalysisSink, Footprint, FrameNotice, FrameSource, TickOutcome,
};
use crate::error::{FitError, FitResult};
use crate::model::{EncodingModel, HistoryGradient};
use crate::stimulus::{StimulusConfig, StimulusEvent, StimulusEventTracker, Transition};
use crate::tuning::{TuningEstimator, TuningMatrix, TuningSummary, TuningWindows};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FitConfig {
    /// Neurons modeled before any data arrives.
    pub initial_neurons: usize,
    pub history_dim: usize,
    pub stimulus_dim: usize,
    /// Observed neurons required before fitting starts.
    pub min_neurons: usize,
    /// Trailing samples used per gradient step.
    pub fit_window: usize,
    pub learning_rate: f64,
    pub history_gradient: HistoryGradient,
    /// Trailing frames covered by the published frame axis.
    pub display_window: usize,
    /// Frames at which an extra snapshot is due.
    pub milestones: Vec<usize>,
    pub stimulus: StimulusConfig,
    pub tuning: TuningWindows,
    /// Tuning categories shown as display channels, in order.
    pub polar_layout: Vec<usize>,
    /// Leading display channels averaged into the global tuning curve.
    pub directional_channels: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            initial_neurons: 20,
            history_dim: 4,
            stimulus_dim: 8,
            min_neurons: 20,
            fit_window: 50,
            learning_rate: 1e-5,
            history_gradient: HistoryGradient::PerLag,
            display_window: 500,
            milestones: vec![200, 500, 1000, 2000, 2875],
            stimulus: StimulusConfig::default(),
            tuning: TuningWindows::default(),
            polar_layout: vec![3, 10, 9, 16, 4, 14, 13, 12, 5, 6, 7, 8],
            directional_channels: 8,
        }
    }
}

impl FitConfig {
    pub fn with_neurons(mut self, initial: usize, min: usize) -> Self {
        self.initial_neurons = initial;
        self.min_neurons = min;
        self
    }

    pub fn with_learning_rate(mut self, rate: f64) -> Self {
        self.learning_rate = rate;
        self
    }

    pub fn with_history_gradient(mut self, mode: HistoryGradient) -> Self {
        self.history_gradient = mode;
        self
    }

    pub fn with_horizon(mut self, frames: usize) -> Self {
        self.stimulus.horizon = frames;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.history_dim == 0 {
            return Err("history_dim must be > 0");
        }
        if self.stimulus_dim == 0 {
            return Err("stimulus_dim must be > 0");
        }
        if self.fit_window == 0 {
            return Err("fit_window must be > 0");
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err("learning_rate must be finite and > 0");
        }
        if self.stimulus.horizon == 0 {
            return Err("stimulus horizon must be > 0");
        }
        if self.stimulus.drive_map.iter().any(|&(_, ch)| ch >= self.stimulus_dim) {
            return Err("drive channel must be < stimulus_dim");
        }
        if self
            .stimulus
            .drive_map
            .iter()
            .any(|&(cat, _)| cat >= self.stimulus.tuning_categories)
        {
            return Err("drive category must be < tuning_categories");
        }
        if self.directional_channels > self.polar_layout.len() {
            return Err("directional_channels exceeds polar_layout");
        }
        self.tuning.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FitState {
    Bootstrapping,
    Fitting,
    Terminal,
}

/// Data persisted at milestone frames.
#[derive(Debug, Clone, PartialEq)]
pub struct MilestoneSnapshot {
    pub frame: usize,
    pub weights: Array2<f64>,
    pub activity: Array2<f64>,
    pub tuning: Array2<f64>,
}

/// Data persisted on shutdown.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalSnapshot {
    pub frame: usize,
    pub weights: Array2<f64>,
    pub activity: Array2<f64>,
    pub likelihood: Vec<f64>,
    pub tuning: Array2<f64>,
    /// Stimulus indicator columns `0..=frame` (clipped to the horizon).
    pub stimulus: Array2<f64>,
    /// Seconds spent per published or missing tick.
    pub frame_times: Vec<f64>,
    /// `[unix seconds, frame]` per published tick.
    pub timestamps: Vec<[f64; 2]>,
}

/// Result of the fallible part of a step, committed only on success.
struct FitUpdate {
    model: EncodingModel,
    likelihood: Option<f64>,
}

pub struct OnlineFitController {
    cfg: FitConfig,
    state: FitState,
    model: EncodingModel,
    tracker: StimulusEventTracker,
    estimator: TuningEstimator,

    frame: usize,
    activity: Array2<f64>,
    coords: Vec<Footprint>,
    tuning: TuningMatrix,
    summary: TuningSummary,
    likelihood: Vec<f64>,

    frame_times: Vec<f64>,
    timestamps: Vec<[f64; 2]>,
}

impl OnlineFitController {
    pub fn new(cfg: FitConfig) -> FitResult<Self> {
        let model = EncodingModel::new(
            cfg.initial_neurons,
            cfg.history_dim,
            cfg.stimulus_dim,
            cfg.history_gradient,
        );
        Self::with_model(cfg, model)
    }

    /// Resume from a previously fitted model. Its dimensions must match `cfg`.
    pub fn with_model(cfg: FitConfig, model: EncodingModel) -> FitResult<Self> {
        cfg.validate().map_err(FitError::InvalidConfig)?;
        if model.history_dim() != cfg.history_dim || model.stimulus_dim() != cfg.stimulus_dim {
            return Err(FitError::InvalidConfig(
                "model history/stimulus dimensions differ from configuration",
            ));
        }

        let tracker = StimulusEventTracker::new(cfg.stimulus.clone(), cfg.stimulus_dim);
        let estimator = TuningEstimator::new(cfg.tuning, cfg.stimulus.tuning_categories);
        let tuning = TuningMatrix::zeros(cfg.stimulus.tuning_categories, 0);
        let summary = TuningSummary::project(&tuning, &cfg.polar_layout, cfg.directional_channels);

        Ok(Self {
            cfg,
            state: FitState::Bootstrapping,
            model,
            tracker,
            estimator,
            frame: 0,
            activity: Array2::zeros((0, 0)),
            coords: Vec::new(),
            tuning,
            summary,
            likelihood: Vec::new(),
            frame_times: Vec::new(),
            timestamps: Vec::new(),
        })
    }

    pub fn config(&self) -> &FitConfig {
        &self.cfg
    }

    pub fn state(&self) -> FitState {
        self.state
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn model(&self) -> &EncodingModel {
        &self.model
    }

    pub fn tracker(&self) -> &StimulusEventTracker {
        &self.tracker
    }

    pub fn activity(&self) -> &Array2<f64> {
        &self.activity
    }

    pub fn tuning(&self) -> &TuningMatrix {
        &self.tuning
    }

    pub fn tuning_summary(&self) -> &TuningSummary {
        &self.summary
    }

    pub fn likelihood(&self) -> &[f64] {
        &self.likelihood
    }

    pub fn frame_times(&self) -> &[f64] {
        &self.frame_times
    }

    pub fn timestamps(&self) -> &[[f64; 2]] {
        &self.timestamps
    }

    /// Mean seconds per timed tick, if any were timed.
    pub fn mean_frame_time(&self) -> Option<f64> {
        (!self.frame_times.is_empty())
            .then(|| self.frame_times.iter().sum::<f64>() / self.frame_times.len() as f64)
    }

    pub fn is_milestone(&self, frame: usize) -> bool {
        self.cfg.milestones.contains(&frame)
    }

    /// Feed one stimulus event. Ignored once terminal; capacity errors are logged.
    pub fn apply_stimulus(&mut self, event: StimulusEvent) -> Option<Transition> {
        if self.state == FitState::Terminal {
            return None;
        }
        match self.tracker.on_event(event) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::error!(frame = event.frame, raw_id = event.raw_id, "dropping stimulus event: {e}");
                None
            }
        }
    }

    /// Stop processing. No state is mutated afterwards.
    pub fn shutdown(&mut self) {
        if self.state != FitState::Terminal {
            tracing::info!(
                frame = self.frame,
                steps = self.likelihood.len(),
                avg_frame_secs = self.mean_frame_time().unwrap_or(0.0),
                "fit controller terminal"
            );
        }
        self.state = FitState::Terminal;
    }

    /// Run one tick against the boundary.
    pub fn tick<S>(&mut self, notice: FrameNotice, io: &mut S) -> TickOutcome
    where
        S: FrameSource + AnalysisSink,
    {
        if self.state == FitState::Terminal {
            return TickOutcome::Halted;
        }

        let started = Instant::now();
        let (handle, frame) = match notice {
            FrameNotice::Missing { frame } => {
                tracing::warn!(frame, "missing frame");
                io.mark_missing(frame);
                self.frame_times.push(started.elapsed().as_secs_f64());
                return TickOutcome::Missing { frame };
            }
            FrameNotice::Ready { handle, frame } => (handle, frame),
        };

        let payload = match io.fetch(&handle) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(frame, "activity unavailable, dropping: {e}");
                return TickOutcome::Dropped {
                    frame,
                    reason: e.to_string(),
                };
            }
        };

        match self.step(frame, payload) {
            Ok(bundle) => {
                let milestone = bundle.milestone;
                io.publish(bundle);
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                self.timestamps.push([now, frame as f64]);
                self.frame_times.push(started.elapsed().as_secs_f64());
                TickOutcome::Published { frame, milestone }
            }
            Err(e) => {
                tracing::error!(frame, "analysis step failed: {e}");
                TickOutcome::Dropped {
                    frame,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Tuning, growth and one gradient step for a resolved frame.
    ///
    /// Nothing is committed unless the whole step succeeds; a failed step
    /// leaves the controller exactly as the last completed tick left it.
    pub fn step(&mut self, frame: usize, payload: ActivityFrame) -> FitResult<AnalysisBundle> {
        if self.state == FitState::Terminal {
            return Err(FitError::InvalidConfig("controller is terminal"));
        }

        let ActivityFrame { activity, coords } = payload;
        let observed = activity.nrows();
        let fitting = self.state == FitState::Fitting || observed >= self.cfg.min_neurons;

        let update = if fitting {
            Some(self.fit(frame, activity.view())?)
        } else {
            None
        };

        let tuning = self
            .estimator
            .recompute(activity.view(), self.tracker.onsets());
        let summary = TuningSummary::project(
            &tuning,
            &self.cfg.polar_layout,
            self.cfg.directional_channels,
        );

        if self.state == FitState::Bootstrapping && fitting {
            tracing::info!(frame, observed, "enough neurons observed, fitting");
            self.state = FitState::Fitting;
        }
        if let Some(update) = update {
            if update.model.neurons() > self.model.neurons() {
                tracing::info!(
                    frame,
                    from = self.model.neurons(),
                    to = update.model.neurons(),
                    "model grown"
                );
            }
            self.model = update.model;
            self.likelihood.extend(update.likelihood);
        }
        self.frame = frame;
        self.activity = activity;
        self.coords = coords;
        self.tuning = tuning;
        self.summary = summary;

        Ok(self.bundle())
    }

    /// Grow and take one gradient step on a copy of the model.
    fn fit(&self, frame: usize, activity: ArrayView2<f64>) -> FitResult<FitUpdate> {
        let mut model = self.model.clone();
        let observed = activity.nrows();
        if observed > model.neurons() {
            model.grow_to(observed)?;
        }

        let end = frame.min(activity.ncols());
        let start = end - end.min(self.cfg.fit_window);
        if start == end {
            return Ok(FitUpdate {
                model,
                likelihood: None,
            });
        }

        let n = model.neurons();
        let mut y = Array2::zeros((n, end - start));
        let rows = observed.min(n);
        y.slice_mut(s![..rows, ..])
            .assign(&activity.slice(s![..rows, start..end]));
        y.mapv_inplace(|v: f64| if v.is_finite() { v } else { 0.0 });

        let indicator = self.tracker.indicator();
        let stim = indicator
            .window(start, end)
            .map_err(|_| FitError::CapacityExceeded {
                frame,
                horizon: indicator.horizon(),
            })?;
        let grad = model.gradient(y.view(), stim)?;
        model.apply_gradient_step(&grad, self.cfg.learning_rate)?;
        let ll = model.objective(y.view(), stim)?;
        Ok(FitUpdate {
            model,
            likelihood: Some(ll),
        })
    }

    fn frame_axis(&self) -> Vec<usize> {
        let span = self.frame.min(self.cfg.display_window);
        (self.frame - span..self.frame).collect()
    }

    fn population_mean(&self) -> Array1<f64> {
        self.activity
            .axis_iter(Axis(1))
            .map(|col| {
                let (sum, count) = col
                    .iter()
                    .filter(|v| !v.is_nan())
                    .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
                if count == 0 {
                    0.0
                } else {
                    sum / count as f64
                }
            })
            .collect()
    }

    fn bundle(&self) -> AnalysisBundle {
        AnalysisBundle {
            frame: self.frame,
            frame_axis: self.frame_axis(),
            activity: self.activity.clone(),
            population_mean: self.population_mean(),
            tuning: self.summary.clone(),
            coords: self.coords.clone(),
            onsets: self.tracker.onsets().to_map(),
            weights: self.model.coupling().clone(),
            likelihood: self.likelihood.clone(),
            milestone: self.is_milestone(self.frame),
        }
    }

    pub fn milestone_snapshot(&self) -> MilestoneSnapshot {
        MilestoneSnapshot {
            frame: self.frame,
            weights: self.model.coupling().clone(),
            activity: self.activity.clone(),
            tuning: self.summary.polar.clone(),
        }
    }

    pub fn final_snapshot(&self) -> FinalSnapshot {
        let indicator = self.tracker.indicator();
        let end = (self.frame + 1).min(indicator.horizon());
        let stimulus = indicator
            .window(0, end)
            .map(|w| w.to_owned())
            .unwrap_or_else(|_| Array2::zeros((indicator.channels(), 0)));

        FinalSnapshot {
            frame: self.frame,
            weights: self.model.coupling().clone(),
            activity: self.activity.clone(),
            likelihood: self.likelihood.clone(),
            tuning: self.summary.polar.clone(),
            stimulus,
            frame_times: self.frame_times.clone(),
            timestamps: self.timestamps.clone(),
        }
    }
}

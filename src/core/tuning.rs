//! Stimulus-triggered tuning estimates.
//!
//! For each tuned category the estimate is the mean activity in a post-onset
//! window minus the mean activity in a wider peri-onset (baseline) window,
//! pooled over every recorded onset. Recomputed in full on each call.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use ndarray::{Array1, Array2, ArrayView2, Axis};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::stimulus::{OnsetHistory, RawStimulusId};

/// Inclusive frame offsets around each onset.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TuningWindows {
    pub on: (i64, i64),
    pub baseline: (i64, i64),
}

impl Default for TuningWindows {
    fn default() -> Self {
        Self {
            on: (4, 17),
            baseline: (-10, 24),
        }
    }
}

impl TuningWindows {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.on.0 > self.on.1 {
            return Err("on window start must not exceed its end");
        }
        if self.baseline.0 > self.baseline.1 {
            return Err("baseline window start must not exceed its end");
        }
        Ok(())
    }
}

/// Categories × neurons.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TuningMatrix {
    pub values: Array2<f64>,
}

impl TuningMatrix {
    pub fn zeros(categories: usize, neurons: usize) -> Self {
        Self {
            values: Array2::zeros((categories, neurons)),
        }
    }

    pub fn categories(&self) -> usize {
        self.values.nrows()
    }

    pub fn neurons(&self) -> usize {
        self.values.ncols()
    }
}

/// Display projection of a [`TuningMatrix`]: neurons × layout channels (absolute
/// values) and the population average of the directional channels.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TuningSummary {
    pub polar: Array2<f64>,
    pub global_average: Array1<f64>,
}

impl TuningSummary {
    pub fn project(tuning: &TuningMatrix, layout: &[usize], directional: usize) -> Self {
        let neurons = tuning.neurons();
        let mut polar = Array2::zeros((neurons, layout.len()));
        for (col, &category) in layout.iter().enumerate() {
            if category < tuning.categories() {
                polar
                    .column_mut(col)
                    .assign(&tuning.values.row(category).mapv(f64::abs));
            }
        }
        polar.mapv_inplace(|x| if x.is_finite() { x } else { 0.0 });

        let directional = directional.min(layout.len());
        let global_average = if neurons == 0 {
            Array1::zeros(directional)
        } else {
            polar
                .slice(ndarray::s![.., ..directional])
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(directional))
        };

        Self {
            polar,
            global_average,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TuningEstimator {
    windows: TuningWindows,
    categories: usize,
}

impl TuningEstimator {
    pub fn new(windows: TuningWindows, categories: usize) -> Self {
        Self {
            windows,
            categories,
        }
    }

    pub fn windows(&self) -> TuningWindows {
        self.windows
    }

    /// Rebuild the tuning matrix from scratch.
    ///
    /// Raw ids outside `0..categories` and ids without onsets keep a zero row.
    /// Non-finite results are zeroed.
    pub fn recompute(&self, activity: ArrayView2<f64>, onsets: &OnsetHistory) -> TuningMatrix {
        let neurons = activity.nrows();
        let jobs: Vec<(usize, &[usize])> = onsets
            .iter()
            .filter_map(|(raw, frames)| {
                let c = category_index(raw, self.categories)?;
                (!frames.is_empty()).then_some((c, frames))
            })
            .collect();

        #[cfg(feature = "parallel")]
        let rows: Vec<(usize, Array1<f64>)> = jobs
            .par_iter()
            .map(|&(c, frames)| (c, self.category_estimate(activity, frames)))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let rows: Vec<(usize, Array1<f64>)> = jobs
            .iter()
            .map(|&(c, frames)| (c, self.category_estimate(activity, frames)))
            .collect();

        let mut tuning = TuningMatrix::zeros(self.categories, neurons);
        for (c, row) in rows {
            tuning.values.row_mut(c).assign(&row);
        }
        tuning
    }

    fn category_estimate(&self, activity: ArrayView2<f64>, onsets: &[usize]) -> Array1<f64> {
        let on = window_mean(activity, onsets, self.windows.on);
        let baseline = window_mean(activity, onsets, self.windows.baseline);
        (on - baseline).mapv(|x| if x.is_finite() { x } else { 0.0 })
    }
}

fn category_index(raw: RawStimulusId, categories: usize) -> Option<usize> {
    usize::try_from(raw).ok().filter(|&c| c < categories)
}

/// Per-neuron mean over every in-range frame `onset + offset` for `offset` in
/// `lo..=hi`, pooled across onsets. Zero when nothing is in range.
fn window_mean(activity: ArrayView2<f64>, onsets: &[usize], (lo, hi): (i64, i64)) -> Array1<f64> {
    let (neurons, frames) = activity.dim();
    let mut sum = Array1::zeros(neurons);
    let mut count = 0usize;
    for &onset in onsets {
        for offset in lo..=hi {
            let idx = onset as i64 + offset;
            if idx < 0 || idx >= frames as i64 {
                continue;
            }
            sum += &activity.column(idx as usize);
            count += 1;
        }
    }
    if count > 0 {
        sum / count as f64
    } else {
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::{StimulusConfig, StimulusEvent, StimulusEventTracker};

    fn history(events: &[(usize, i64, f64)]) -> OnsetHistory {
        let mut t = StimulusEventTracker::new(StimulusConfig::default(), 8);
        t.on_event(StimulusEvent::new(0, 0, 0.0)).unwrap();
        for &(frame, id, intensity) in events {
            t.on_event(StimulusEvent::new(frame, id, intensity)).unwrap();
        }
        t.onsets().clone()
    }

    #[test]
    fn constant_activity_has_zero_tuning() {
        let onsets = history(&[(100, 3, 5.0)]);
        let activity = Array2::from_elem((6, 300), 1.5);
        let est = TuningEstimator::new(TuningWindows::default(), 21);

        let tuning = est.recompute(activity.view(), &onsets);
        assert_eq!(tuning.values.dim(), (21, 6));
        assert!(tuning.values.row(3).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn response_in_on_window_is_positive() {
        let onsets = history(&[(50, 10, 5.0)]);
        let mut activity = Array2::zeros((2, 200));
        // Neuron 0 responds on frames 54..=67.
        for f in 54..=67 {
            activity[[0, f]] = 1.0;
        }
        let est = TuningEstimator::new(TuningWindows::default(), 21);
        let tuning = est.recompute(activity.view(), &onsets);

        // on mean 1, baseline mean 14/35.
        let expect = 1.0 - 14.0 / 35.0;
        assert!((tuning.values[[10, 0]] - expect).abs() < 1e-12);
        assert_eq!(tuning.values[[10, 1]], 0.0);
    }

    #[test]
    fn windows_are_clipped_to_recorded_frames() {
        let onsets = history(&[(5, 4, 2.0)]);
        let activity = Array2::from_shape_fn((1, 12), |(_, f)| f as f64);
        let est = TuningEstimator::new(TuningWindows::default(), 21);
        let tuning = est.recompute(activity.view(), &onsets);

        // on: frames 9..=11 (mean 10); baseline: frames 0..=11 (mean 5.5).
        assert!((tuning.values[[4, 0]] - 4.5).abs() < 1e-12);
    }

    #[test]
    fn overlapping_windows_pool_shared_frames_twice() {
        // Onsets at 10 and 15: on windows 14..=27 and 19..=32, baselines
        // 0..=34 and 5..=39. Frame 20 sits in all four.
        let onsets = history(&[(10, 3, 5.0), (12, 3, 0.0), (15, 3, 5.0)]);
        assert_eq!(onsets.get(3), &[10, 15]);
        let activity = Array2::from_shape_fn((1, 60), |(_, f)| if f == 20 { 1.0 } else { 0.0 });
        let est = TuningEstimator::new(TuningWindows::default(), 21);
        let tuning = est.recompute(activity.view(), &onsets);

        let expect = 2.0 / 28.0 - 2.0 / 70.0;
        assert!((tuning.values[[3, 0]] - expect).abs() < 1e-12);
    }

    #[test]
    fn onset_past_the_data_gives_zero() {
        let onsets = history(&[(500, 9, 2.0)]);
        let activity = Array2::from_elem((3, 100), 2.0);
        let est = TuningEstimator::new(TuningWindows::default(), 21);
        let tuning = est.recompute(activity.view(), &onsets);
        assert!(tuning.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn unknown_ids_and_nan_are_zeroed() {
        let onsets = history(&[(20, 40, 2.0), (30, 40, 0.0), (60, 12, 2.0)]);
        let mut activity = Array2::from_elem((2, 120), 1.0);
        activity[[1, 70]] = f64::NAN;
        let est = TuningEstimator::new(TuningWindows::default(), 21);
        let tuning = est.recompute(activity.view(), &onsets);

        assert_eq!(tuning.categories(), 21);
        assert_eq!(tuning.values[[12, 1]], 0.0);
        assert!(tuning.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn configurable_windows() {
        let onsets = history(&[(10, 3, 2.0)]);
        let activity = Array2::from_shape_fn((1, 40), |(_, f)| if f == 11 { 4.0 } else { 0.0 });
        let windows = TuningWindows {
            on: (1, 1),
            baseline: (0, 3),
        };
        let est = TuningEstimator::new(windows, 21);
        let tuning = est.recompute(activity.view(), &onsets);
        assert!((tuning.values[[3, 0]] - 3.0).abs() < 1e-12);
        assert!(TuningWindows {
            on: (5, 1),
            baseline: (0, 3)
        }
        .validate()
        .is_err());
    }

    #[test]
    fn summary_projects_absolute_values() {
        let mut tuning = TuningMatrix::zeros(21, 2);
        tuning.values[[3, 0]] = -2.0;
        tuning.values[[10, 1]] = 4.0;
        tuning.values[[8, 0]] = 1.0;
        let layout = [3, 10, 9, 16, 4, 14, 13, 12, 5, 6, 7, 8];

        let summary = TuningSummary::project(&tuning, &layout, 8);
        assert_eq!(summary.polar.dim(), (2, 12));
        assert_eq!(summary.polar[[0, 0]], 2.0);
        assert_eq!(summary.polar[[1, 1]], 4.0);
        assert_eq!(summary.polar[[0, 11]], 1.0);
        assert_eq!(summary.global_average.len(), 8);
        assert_eq!(summary.global_average[0], 1.0);
        assert_eq!(summary.global_average[1], 2.0);
    }
}

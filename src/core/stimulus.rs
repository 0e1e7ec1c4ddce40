//! Stimulus on/off bookkeeping.
//!
//! Raw stimulus ids arrive with a signed intensity. The tracker keeps one
//! on/off state for the whole stream, records off→on edges per raw id, and
//! marks the drive channel of each edge in a pre-allocated indicator matrix
//! (channels × frame horizon) that the encoding model reads as its stimulus input.

use std::collections::BTreeMap;

use ndarray::{s, Array2, ArrayView2};
use serde_json::Value;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, FitResult};

pub type RawStimulusId = i64;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StimulusConfig {
    /// Raw ids in `0..tuning_categories` are tuned; everything else is unknown.
    pub tuning_categories: usize,
    /// (category, drive channel) pairs.
    pub drive_map: Vec<(usize, usize)>,
    /// Frames pre-allocated in the indicator matrix.
    pub horizon: usize,
    /// `|intensity| > on_threshold` means on.
    pub on_threshold: f64,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            tuning_categories: 21,
            drive_map: vec![
                (3, 0),
                (10, 1),
                (9, 2),
                (16, 3),
                (4, 4),
                (14, 5),
                (13, 6),
                (12, 7),
            ],
            horizon: 100_000,
            on_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimulusCategory {
    Known(usize),
    Unknown,
}

/// One stimulus change: `{ "<frame>": [raw_id, signed_intensity] }` on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StimulusEvent {
    pub frame: usize,
    pub raw_id: RawStimulusId,
    pub intensity: f64,
}

impl StimulusEvent {
    pub fn new(frame: usize, raw_id: RawStimulusId, intensity: f64) -> Self {
        Self {
            frame,
            raw_id,
            intensity,
        }
    }

    /// Parse the wire shape. Malformed or empty messages yield `None`.
    pub fn from_message(msg: &Value) -> Option<Self> {
        let (frame, body) = msg.as_object()?.iter().next()?;
        let frame = frame.trim().parse::<usize>().ok()?;
        let body = body.as_array()?;
        if body.len() < 2 {
            return None;
        }
        let raw_id = match &body[0] {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
            Value::String(s) => s.trim().parse::<i64>().ok()?,
            _ => return None,
        };
        let intensity = body[1].as_f64()?;
        Some(Self::new(frame, raw_id, intensity))
    }
}

/// What an event did to the tracker's on/off state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First event seen; only establishes the state.
    Initial,
    Onset,
    Offset,
    SustainedOn,
    SustainedOff,
}

/// Off→on frames per raw stimulus id, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnsetHistory {
    onsets: BTreeMap<RawStimulusId, Vec<usize>>,
}

impl OnsetHistory {
    fn touch(&mut self, raw_id: RawStimulusId) {
        self.onsets.entry(raw_id).or_default();
    }

    fn push(&mut self, raw_id: RawStimulusId, frame: usize) {
        self.onsets.entry(raw_id).or_default().push(frame);
    }

    pub fn get(&self, raw_id: RawStimulusId) -> &[usize] {
        self.onsets.get(&raw_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawStimulusId, &[usize])> {
        self.onsets.iter().map(|(id, frames)| (*id, frames.as_slice()))
    }

    /// Number of raw ids ever seen (with or without onsets).
    pub fn ids(&self) -> usize {
        self.onsets.len()
    }

    pub fn total_onsets(&self) -> usize {
        self.onsets.values().map(Vec::len).sum()
    }

    pub fn to_map(&self) -> BTreeMap<RawStimulusId, Vec<usize>> {
        self.onsets.clone()
    }
}

/// Binary drive-channel × frame matrix with a fixed horizon.
#[derive(Debug, Clone)]
pub struct IndicatorMatrix {
    data: Array2<f64>,
}

impl IndicatorMatrix {
    pub fn new(channels: usize, horizon: usize) -> Self {
        Self {
            data: Array2::zeros((channels, horizon)),
        }
    }

    pub fn channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn horizon(&self) -> usize {
        self.data.ncols()
    }

    fn check(&self, frame: usize) -> FitResult<()> {
        if frame >= self.horizon() {
            return Err(FitError::CapacityExceeded {
                frame,
                horizon: self.horizon(),
            });
        }
        Ok(())
    }

    pub fn is_active(&self, channel: usize, frame: usize) -> bool {
        self.data.get((channel, frame)).is_some_and(|&v| v != 0.0)
    }

    fn set(&mut self, channel: usize, frame: usize) {
        self.data[[channel, frame]] = 1.0;
    }

    fn clear_frame(&mut self, frame: usize) {
        self.data.column_mut(frame).fill(0.0);
    }

    /// Columns `start..end`.
    pub fn window(&self, start: usize, end: usize) -> FitResult<ArrayView2<'_, f64>> {
        if end > self.horizon() {
            return Err(FitError::CapacityExceeded {
                frame: end.saturating_sub(1),
                horizon: self.horizon(),
            });
        }
        Ok(self.data.slice(s![.., start..end.max(start)]))
    }
}

#[derive(Debug, Clone)]
pub struct StimulusEventTracker {
    cfg: StimulusConfig,
    last_on: Option<bool>,
    current_channel: Option<usize>,
    onsets: OnsetHistory,
    indicator: IndicatorMatrix,
}

impl StimulusEventTracker {
    pub fn new(cfg: StimulusConfig, drive_channels: usize) -> Self {
        let indicator = IndicatorMatrix::new(drive_channels, cfg.horizon);
        Self {
            cfg,
            last_on: None,
            current_channel: None,
            onsets: OnsetHistory::default(),
            indicator,
        }
    }

    pub fn category(&self, raw_id: RawStimulusId) -> StimulusCategory {
        match usize::try_from(raw_id) {
            Ok(c) if c < self.cfg.tuning_categories => StimulusCategory::Known(c),
            _ => StimulusCategory::Unknown,
        }
    }

    pub fn drive_channel(&self, category: StimulusCategory) -> Option<usize> {
        let StimulusCategory::Known(c) = category else {
            return None;
        };
        self.cfg
            .drive_map
            .iter()
            .find(|(cat, _)| *cat == c)
            .map(|(_, ch)| *ch)
            .filter(|&ch| ch < self.indicator.channels())
    }

    pub fn on_event(&mut self, event: StimulusEvent) -> FitResult<Transition> {
        self.indicator.check(event.frame)?;

        let on = event.intensity.abs() > self.cfg.on_threshold;
        self.onsets.touch(event.raw_id);

        let transition = match (self.last_on, on) {
            (None, _) => Transition::Initial,
            (Some(false), true) => {
                self.onsets.push(event.raw_id, event.frame);
                let channel = self.drive_channel(self.category(event.raw_id));
                if let Some(ch) = channel {
                    self.indicator.set(ch, event.frame);
                }
                self.current_channel = channel;
                tracing::debug!(
                    raw_id = event.raw_id,
                    frame = event.frame,
                    channel = ?channel,
                    "stimulus onset"
                );
                Transition::Onset
            }
            // The onset frame's mark stays set. The legacy pipeline cleared
            // that column on every sustained-on event instead.
            (Some(true), true) => Transition::SustainedOn,
            (Some(true), false) => {
                self.indicator.clear_frame(event.frame);
                Transition::Offset
            }
            (Some(false), false) => {
                self.indicator.clear_frame(event.frame);
                Transition::SustainedOff
            }
        };

        self.last_on = Some(on);
        Ok(transition)
    }

    pub fn is_on(&self) -> Option<bool> {
        self.last_on
    }

    /// Drive channel of the most recent onset, if it mapped to one.
    pub fn current_channel(&self) -> Option<usize> {
        self.current_channel
    }

    pub fn onsets(&self) -> &OnsetHistory {
        &self.onsets
    }

    pub fn indicator(&self) -> &IndicatorMatrix {
        &self.indicator
    }

    pub fn config(&self) -> &StimulusConfig {
        &self.cfg
    }
}

//! What crosses the engine's edge: frames coming in by handle, analysis bundles
//! and missing-frame markers going out.

#[cfg(feature = "serde")]
pub mod protocol;

use std::collections::{BTreeMap, VecDeque};

use hashbrown::HashMap;
use ndarray::{Array1, Array2};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, FitResult};
use crate::stimulus::RawStimulusId;
use crate::tuning::TuningSummary;

/// Polygon outline of one neuron's footprint in image coordinates.
pub type Footprint = Vec<[f64; 2]>;

/// One resolved upstream frame: activity so far (neurons × frames) plus footprints.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActivityFrame {
    pub activity: Array2<f64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub coords: Vec<Footprint>,
}

impl ActivityFrame {
    pub fn new(activity: Array2<f64>) -> Self {
        Self {
            activity,
            coords: Vec::new(),
        }
    }

    pub fn with_coords(mut self, coords: Vec<Footprint>) -> Self {
        self.coords = coords;
        self
    }
}

/// Per-tick notification from the upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FrameNotice {
    Missing { frame: usize },
    Ready { handle: String, frame: usize },
}

/// Everything published downstream after one fitting step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnalysisBundle {
    pub frame: usize,
    pub frame_axis: Vec<usize>,
    pub activity: Array2<f64>,
    pub population_mean: Array1<f64>,
    pub tuning: TuningSummary,
    pub coords: Vec<Footprint>,
    pub onsets: BTreeMap<RawStimulusId, Vec<usize>>,
    pub weights: Array2<f64>,
    pub likelihood: Vec<f64>,
    pub milestone: bool,
}

/// Result of one tick at the engine boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Controller is terminal; nothing was touched.
    Halted,
    Missing { frame: usize },
    Dropped { frame: usize, reason: String },
    Published { frame: usize, milestone: bool },
}

pub trait FrameSource {
    /// Resolve a frame handle. Unresolvable handles are [`FitError::Unavailable`].
    fn fetch(&mut self, handle: &str) -> FitResult<ActivityFrame>;
}

pub trait AnalysisSink {
    fn publish(&mut self, bundle: AnalysisBundle);
    fn mark_missing(&mut self, frame: usize);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    Analysis(Box<AnalysisBundle>),
    Missing { frame: usize },
}

impl Publication {
    pub fn frame(&self) -> usize {
        match self {
            Publication::Analysis(b) => b.frame,
            Publication::Missing { frame } => *frame,
        }
    }
}

/// In-process keyed store: frames are consumed on fetch, publications are kept
/// in a bounded ring (oldest evicted first).
#[derive(Debug)]
pub struct MemoryStore {
    frames: HashMap<String, ActivityFrame>,
    published: VecDeque<Publication>,
    retain: usize,
}

impl MemoryStore {
    pub const DEFAULT_RETAIN: usize = 64;

    pub fn new(retain: usize) -> Self {
        Self {
            frames: HashMap::new(),
            published: VecDeque::with_capacity(retain.min(1024)),
            retain: retain.max(1),
        }
    }

    pub fn put_frame(&mut self, handle: impl Into<String>, frame: ActivityFrame) {
        self.frames.insert(handle.into(), frame);
    }

    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    /// Latest publication for `frame`, if still retained.
    pub fn publication(&self, frame: usize) -> Option<&Publication> {
        self.published.iter().rev().find(|p| p.frame() == frame)
    }

    pub fn latest(&self) -> Option<&Publication> {
        self.published.back()
    }

    pub fn publications(&self) -> impl Iterator<Item = &Publication> {
        self.published.iter()
    }

    fn push(&mut self, p: Publication) {
        while self.published.len() >= self.retain {
            self.published.pop_front();
        }
        self.published.push_back(p);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RETAIN)
    }
}

impl FrameSource for MemoryStore {
    fn fetch(&mut self, handle: &str) -> FitResult<ActivityFrame> {
        self.frames
            .remove(handle)
            .ok_or_else(|| FitError::Unavailable(handle.to_string()))
    }
}

impl AnalysisSink for MemoryStore {
    fn publish(&mut self, bundle: AnalysisBundle) {
        self.push(Publication::Analysis(Box::new(bundle)));
    }

    fn mark_missing(&mut self, frame: usize) {
        self.push(Publication::Missing { frame });
    }
}

use crate::controller::{FitState, OnlineFitController};
use crate::stimulus::RawStimulusId;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A read-only view of where the fit currently stands.
///
/// Design intent:
/// - Observers cannot mutate or steer the controller.
/// - Snapshotting is *on-demand*; the per-frame step stays unchanged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FitStatus {
    pub state: FitState,
    pub frame: usize,
    pub modeled_neurons: usize,
    pub observed_neurons: usize,
    pub parameter_count: usize,
    pub fitted_steps: u64,
    pub last_likelihood: Option<f64>,
    pub stimulus_ids: Vec<RawStimulusId>,
    pub total_onsets: usize,
}

pub struct ControllerAdapter<'a> {
    controller: &'a OnlineFitController,
}

impl<'a> ControllerAdapter<'a> {
    pub fn new(controller: &'a OnlineFitController) -> Self {
        Self { controller }
    }

    pub fn status(&self) -> FitStatus {
        let c = self.controller;
        let onsets = c.tracker().onsets();
        FitStatus {
            state: c.state(),
            frame: c.frame(),
            modeled_neurons: c.model().neurons(),
            observed_neurons: c.activity().nrows(),
            parameter_count: c.model().parameter_count(),
            fitted_steps: c.model().steps(),
            last_likelihood: c.likelihood().last().copied(),
            stimulus_ids: onsets.iter().map(|(id, _)| id).collect(),
            total_onsets: onsets.total_onsets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{ActivityFrame, FrameNotice, MemoryStore};
    use crate::controller::FitConfig;
    use crate::stimulus::StimulusEvent;
    use ndarray::Array2;

    #[test]
    fn status_reflects_controller() {
        let cfg = FitConfig::default().with_neurons(2, 2);
        let mut c = OnlineFitController::new(cfg).unwrap();

        let s = ControllerAdapter::new(&c).status();
        assert_eq!(s.state, FitState::Bootstrapping);
        assert_eq!(s.modeled_neurons, 2);
        assert_eq!(s.parameter_count, 4 + 2 * 4 + 2 + 2 * 8);
        assert_eq!(s.last_likelihood, None);

        c.apply_stimulus(StimulusEvent::new(0, 10, 0.0));
        c.apply_stimulus(StimulusEvent::new(3, 10, 2.0));
        let mut store = MemoryStore::default();
        store.put_frame("a", ActivityFrame::new(Array2::ones((3, 10))));
        c.tick(
            FrameNotice::Ready {
                handle: "a".into(),
                frame: 9,
            },
            &mut store,
        );

        let s = ControllerAdapter::new(&c).status();
        assert_eq!(s.state, FitState::Fitting);
        assert_eq!(s.frame, 9);
        assert_eq!(s.modeled_neurons, 3);
        assert_eq!(s.observed_neurons, 3);
        assert_eq!(s.fitted_steps, 1);
        assert!(s.last_likelihood.is_some());
        assert_eq!(s.stimulus_ids, vec![10]);
        assert_eq!(s.total_onsets, 1);
    }
}

//! Point-process encoding model.
//!
//! Each neuron's rate is `exp(b + history + coupling + stimulus)`:
//! - `W` (N×N) couples the population's previous sample into each neuron (diagonal is zero),
//! - `H` (N×Dh) weights the neuron's own last `Dh` samples (lag ℓ uses `H[i, ℓ-1]`),
//! - `B` (N) is the baseline,
//! - `K` (N×Ds) weights the stimulus-drive channels.
//!
//! Parameters live in block form ([`ParamBlocks`]) and are only flattened (W, H, B, K order)
//! at the persistence/transfer boundary.

use std::io::{self, Read, Write};

use ndarray::{s, Array, Array1, Array2, ArrayView2, Axis, Dimension, Zip};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{FitError, FitResult};
use crate::storage;

/// How the self-history gradient is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HistoryGradient {
    /// Exact gradient: every lag gets its own correlation with the residual.
    #[default]
    PerLag,
    /// One value per neuron (time-reversed activity against the residual),
    /// copied into every lag. Reproduces models fitted by the legacy pipeline.
    Aggregate,
}

impl HistoryGradient {
    fn code(self) -> u32 {
        match self {
            HistoryGradient::PerLag => 0,
            HistoryGradient::Aggregate => 1,
        }
    }

    fn from_code(code: u32) -> io::Result<Self> {
        match code {
            0 => Ok(HistoryGradient::PerLag),
            1 => Ok(HistoryGradient::Aggregate),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown history gradient mode",
            )),
        }
    }
}

/// The four parameter blocks for a population of `N` neurons.
///
/// Also used for gradients, which share the layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamBlocks {
    pub w: Array2<f64>,
    pub h: Array2<f64>,
    pub b: Array1<f64>,
    pub k: Array2<f64>,
}

impl ParamBlocks {
    pub fn zeros(neurons: usize, history_dim: usize, stimulus_dim: usize) -> Self {
        Self {
            w: Array2::zeros((neurons, neurons)),
            h: Array2::zeros((neurons, history_dim)),
            b: Array1::zeros(neurons),
            k: Array2::zeros((neurons, stimulus_dim)),
        }
    }

    pub fn neurons(&self) -> usize {
        self.b.len()
    }

    pub fn history_dim(&self) -> usize {
        self.h.ncols()
    }

    pub fn stimulus_dim(&self) -> usize {
        self.k.ncols()
    }

    /// Flat length: `N² + N·Dh + N + N·Ds`.
    pub fn len(&self) -> usize {
        flat_len(self.neurons(), self.history_dim(), self.stimulus_dim())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_consistent(&self) -> bool {
        let n = self.neurons();
        self.w.dim() == (n, n) && self.h.nrows() == n && self.k.nrows() == n
    }

    fn same_shape(&self, other: &ParamBlocks) -> bool {
        self.w.dim() == other.w.dim()
            && self.h.dim() == other.h.dim()
            && self.b.dim() == other.b.dim()
            && self.k.dim() == other.k.dim()
    }

    /// Concatenate in the fixed W, H, B, K order (row-major within each block).
    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.len());
        flat.extend(self.w.iter());
        flat.extend(self.h.iter());
        flat.extend(self.b.iter());
        flat.extend(self.k.iter());
        flat
    }

    pub fn from_flat(
        neurons: usize,
        history_dim: usize,
        stimulus_dim: usize,
        flat: &[f64],
    ) -> FitResult<Self> {
        let expected = flat_len(neurons, history_dim, stimulus_dim);
        if flat.len() != expected {
            return Err(FitError::LayoutMismatch {
                expected,
                actual: flat.len(),
            });
        }

        let n = neurons;
        let (w, rest) = flat.split_at(n * n);
        let (h, rest) = rest.split_at(n * history_dim);
        let (b, k) = rest.split_at(n);

        let shape_err = |_| FitError::LayoutMismatch {
            expected,
            actual: flat.len(),
        };
        Ok(Self {
            w: Array2::from_shape_vec((n, n), w.to_vec()).map_err(shape_err)?,
            h: Array2::from_shape_vec((n, history_dim), h.to_vec()).map_err(shape_err)?,
            b: Array1::from_vec(b.to_vec()),
            k: Array2::from_shape_vec((n, stimulus_dim), k.to_vec()).map_err(shape_err)?,
        })
    }

    fn scale(&mut self, factor: f64) {
        self.w.mapv_inplace(|x| x * factor);
        self.h.mapv_inplace(|x| x * factor);
        self.b.mapv_inplace(|x| x * factor);
        self.k.mapv_inplace(|x| x * factor);
    }

    fn zero_non_finite(&mut self) {
        self.w.mapv_inplace(finite_or_zero);
        self.h.mapv_inplace(finite_or_zero);
        self.b.mapv_inplace(finite_or_zero);
        self.k.mapv_inplace(finite_or_zero);
    }
}

pub fn flat_len(neurons: usize, history_dim: usize, stimulus_dim: usize) -> usize {
    neurons * neurons + neurons * history_dim + neurons + neurons * stimulus_dim
}

#[inline]
fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

/// Activity delayed by `lag` samples; the first `lag` columns are zero.
fn lagged(activity: ArrayView2<f64>, lag: usize) -> Array2<f64> {
    let (n, t) = activity.dim();
    let mut out = Array2::zeros((n, t));
    if lag < t {
        out.slice_mut(s![.., lag..])
            .assign(&activity.slice(s![.., ..t - lag]));
    }
    out
}

fn descend<D: Dimension>(theta: &mut Array<f64, D>, grad: &Array<f64, D>, learning_rate: f64) {
    Zip::from(theta).and(grad).for_each(|p, &g| {
        if g.is_finite() {
            *p -= learning_rate * g;
        }
    });
}

#[derive(Debug, Clone)]
pub struct EncodingModel {
    params: ParamBlocks,
    history_gradient: HistoryGradient,
    steps: u64,
}

impl EncodingModel {
    /// All-zero model (every rate is `exp(0) = 1`).
    pub fn new(
        neurons: usize,
        history_dim: usize,
        stimulus_dim: usize,
        history_gradient: HistoryGradient,
    ) -> Self {
        Self {
            params: ParamBlocks::zeros(neurons, history_dim, stimulus_dim),
            history_gradient,
            steps: 0,
        }
    }

    /// Adopt existing parameters. The coupling diagonal is cleared.
    pub fn with_params(mut params: ParamBlocks, history_gradient: HistoryGradient) -> FitResult<Self> {
        if !params.is_consistent() {
            return Err(FitError::LayoutMismatch {
                expected: params.len(),
                actual: params.w.len() + params.h.len() + params.b.len() + params.k.len(),
            });
        }
        params.w.diag_mut().fill(0.0);
        Ok(Self {
            params,
            history_gradient,
            steps: 0,
        })
    }

    pub fn neurons(&self) -> usize {
        self.params.neurons()
    }

    pub fn history_dim(&self) -> usize {
        self.params.history_dim()
    }

    pub fn stimulus_dim(&self) -> usize {
        self.params.stimulus_dim()
    }

    pub fn parameter_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &ParamBlocks {
        &self.params
    }

    /// Coupling matrix `W`.
    pub fn coupling(&self) -> &Array2<f64> {
        &self.params.w
    }

    pub fn history_gradient(&self) -> HistoryGradient {
        self.history_gradient
    }

    /// Number of gradient steps applied since construction/load.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn check_window(&self, activity: &ArrayView2<f64>, stimulus: &ArrayView2<f64>) -> FitResult<()> {
        let n = self.neurons();
        let ds = self.stimulus_dim();
        let t = activity.ncols();
        if activity.nrows() != n || stimulus.nrows() != ds || stimulus.ncols() != t {
            return Err(FitError::WindowShape {
                expected: format!("activity {n}x{t}, stimulus {ds}x{t}"),
                actual: format!(
                    "activity {}x{}, stimulus {}x{}",
                    activity.nrows(),
                    activity.ncols(),
                    stimulus.nrows(),
                    stimulus.ncols()
                ),
            });
        }
        Ok(())
    }

    fn linear_predictor(&self, activity: ArrayView2<f64>, stimulus: ArrayView2<f64>) -> Array2<f64> {
        let p = &self.params;
        let (n, t) = activity.dim();
        if t == 0 {
            return Array2::zeros((n, 0));
        }

        let mut eta = p.k.dot(&stimulus);
        eta += &p.b.view().insert_axis(Axis(1));

        let mut w = p.w.clone();
        w.diag_mut().fill(0.0);
        eta += &w.dot(&lagged(activity, 1));

        for lag in 1..=self.history_dim() {
            if lag >= t {
                break;
            }
            let mut term = lagged(activity, lag);
            term *= &p.h.column(lag - 1).insert_axis(Axis(1));
            eta += &term;
        }
        eta
    }

    /// Predicted rate for every neuron and sample of the window (neurons × T).
    ///
    /// Sample `t` only depends on activity strictly before `t` and on the
    /// stimulus column at `t`. Non-finite rates (exp overflow) are reported as 0.
    pub fn forward(&self, activity: ArrayView2<f64>, stimulus: ArrayView2<f64>) -> FitResult<Array2<f64>> {
        self.check_window(&activity, &stimulus)?;
        Ok(self
            .linear_predictor(activity, stimulus)
            .mapv(|x| finite_or_zero(x.exp())))
    }

    /// Negative Poisson log-likelihood normalized by `T·N²`.
    pub fn objective(&self, activity: ArrayView2<f64>, stimulus: ArrayView2<f64>) -> FitResult<f64> {
        let rate = self.forward(activity, stimulus)?;
        let (n, t) = activity.dim();
        if n == 0 || t == 0 {
            return Ok(0.0);
        }

        let total_rate = rate.sum();
        let weighted: f64 = activity
            .iter()
            .zip(rate.iter())
            .map(|(&y, &r)| y * (r + f64::EPSILON).ln())
            .sum();

        Ok((total_rate - weighted) / (t as f64 * (n * n) as f64))
    }

    /// Analytic gradient built from the residual `rate - activity`, every block divided by `N`.
    pub fn gradient(&self, activity: ArrayView2<f64>, stimulus: ArrayView2<f64>) -> FitResult<ParamBlocks> {
        let rate = self.forward(activity, stimulus)?;
        let n = self.neurons();
        let t = activity.ncols();
        let mut grad = ParamBlocks::zeros(n, self.history_dim(), self.stimulus_dim());
        if n == 0 || t == 0 {
            return Ok(grad);
        }

        let inv_t = 1.0 / t as f64;
        let delta = &rate - &activity;

        grad.b = delta.sum_axis(Axis(1)) * inv_t;
        grad.k = delta.dot(&stimulus.t()) * inv_t;
        grad.w = delta.dot(&lagged(activity, 1).t()) * inv_t;
        grad.w.diag_mut().fill(0.0);

        match self.history_gradient {
            HistoryGradient::PerLag => {
                for lag in 1..=self.history_dim() {
                    if lag >= t {
                        break;
                    }
                    let col = (&delta * &lagged(activity, lag)).sum_axis(Axis(1)) * inv_t;
                    grad.h.column_mut(lag - 1).assign(&col);
                }
            }
            HistoryGradient::Aggregate => {
                let reversed = activity.slice(s![.., ..;-1]);
                let per_neuron = (&delta * &reversed).sum_axis(Axis(1)) * inv_t;
                for i in 0..n {
                    grad.h.row_mut(i).fill(per_neuron[i]);
                }
            }
        }

        grad.scale(1.0 / n as f64);
        grad.zero_non_finite();
        Ok(grad)
    }

    /// Extend the population to `new_neurons`, keeping every fitted value at its
    /// (row, col) position and zero-filling the rest. Returns whether anything grew.
    pub fn grow_to(&mut self, new_neurons: usize) -> FitResult<bool> {
        let n = self.neurons();
        if new_neurons < n {
            return Err(FitError::InvalidGrowth {
                current: n,
                requested: new_neurons,
            });
        }
        if new_neurons == n {
            return Ok(false);
        }

        let mut grown = ParamBlocks::zeros(new_neurons, self.history_dim(), self.stimulus_dim());
        grown.w.slice_mut(s![..n, ..n]).assign(&self.params.w);
        grown.h.slice_mut(s![..n, ..]).assign(&self.params.h);
        grown.b.slice_mut(s![..n]).assign(&self.params.b);
        grown.k.slice_mut(s![..n, ..]).assign(&self.params.k);
        self.params = grown;
        Ok(true)
    }

    /// `theta -= learning_rate * grad`, skipping non-finite gradient entries.
    pub fn apply_gradient_step(&mut self, grad: &ParamBlocks, learning_rate: f64) -> FitResult<()> {
        if !self.params.same_shape(grad) {
            return Err(FitError::LayoutMismatch {
                expected: self.params.len(),
                actual: grad.w.len() + grad.h.len() + grad.b.len() + grad.k.len(),
            });
        }
        descend(&mut self.params.w, &grad.w, learning_rate);
        descend(&mut self.params.h, &grad.h, learning_rate);
        descend(&mut self.params.b, &grad.b, learning_rate);
        descend(&mut self.params.k, &grad.k, learning_rate);
        self.steps += 1;
        Ok(())
    }

    /// Serialize a versioned, chunked model image.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        let mut dims = Vec::with_capacity(16);
        for v in [
            self.neurons(),
            self.history_dim(),
            self.stimulus_dim(),
        ] {
            let v = u32::try_from(v)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "dimension too large"))?;
            storage::write_u32_le(&mut dims, v)?;
        }
        storage::write_u32_le(&mut dims, self.history_gradient.code())?;
        storage::write_chunk(w, *b"DIMS", &dims)?;

        let mut step = Vec::with_capacity(8);
        storage::write_u64_le(&mut step, self.steps)?;
        storage::write_chunk(w, *b"STEP", &step)?;

        let flat = self.params.to_flat();
        let mut payload = Vec::with_capacity(flat.len() * 8);
        for v in flat {
            storage::write_f64_le(&mut payload, v)?;
        }
        storage::write_chunk_lz4(w, *b"PARM", &payload)
    }

    /// Load a model image. Unknown chunks are skipped.
    pub fn load_image_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let magic = storage::read_exact::<8, _>(r)?;
        if &magic != storage::MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad model image magic",
            ));
        }
        let version = storage::read_u32_le(r)?;
        if version != storage::VERSION_V1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported model image version",
            ));
        }

        let mut dims: Option<(usize, usize, usize, HistoryGradient)> = None;
        let mut steps: u64 = 0;
        let mut flat: Option<Vec<f64>> = None;

        loop {
            let (tag, len) = match storage::read_chunk_header(r) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };

            let mut take = r.take(len as u64);
            match &tag {
                b"DIMS" => {
                    let n = storage::read_u32_le(&mut take)? as usize;
                    let dh = storage::read_u32_le(&mut take)? as usize;
                    let ds = storage::read_u32_le(&mut take)? as usize;
                    let mode = HistoryGradient::from_code(storage::read_u32_le(&mut take)?)?;
                    dims = Some((n, dh, ds, mode));
                }
                b"STEP" => {
                    steps = storage::read_u64_le(&mut take)?;
                }
                b"PARM" => {
                    let bytes = storage::read_chunk_lz4_payload(&mut take, len)?;
                    if bytes.len() % 8 != 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "PARM payload not a whole number of f64",
                        ));
                    }
                    let mut cursor = io::Cursor::new(bytes);
                    let count = cursor.get_ref().len() / 8;
                    let mut values = Vec::with_capacity(count);
                    for _ in 0..count {
                        values.push(storage::read_f64_le(&mut cursor)?);
                    }
                    flat = Some(values);
                }
                _ => {
                    // Unknown chunk: skip.
                }
            }

            // Drain any remaining payload bytes for unknown or partially-read chunks.
            io::copy(&mut take, &mut io::sink())?;
        }

        let (n, dh, ds, mode) =
            dims.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing DIMS"))?;
        let flat = flat.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing PARM"))?;
        let params = ParamBlocks::from_flat(n, dh, ds, &flat)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let mut model = Self::with_params(params, mode)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        model.steps = steps;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng::Prng;

    fn random_blocks(rng: &mut Prng, n: usize, dh: usize, ds: usize, scale: f64) -> ParamBlocks {
        let flat: Vec<f64> = (0..flat_len(n, dh, ds))
            .map(|_| rng.gen_range_f64(-scale, scale))
            .collect();
        let mut p = ParamBlocks::from_flat(n, dh, ds, &flat).unwrap();
        p.w.diag_mut().fill(0.0);
        p
    }

    fn random_counts(rng: &mut Prng, n: usize, t: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, t), |_| rng.poisson(0.7) as f64)
    }

    fn random_stimulus(rng: &mut Prng, ds: usize, t: usize) -> Array2<f64> {
        Array2::from_shape_fn((ds, t), |_| if rng.next_f64_01() < 0.2 { 1.0 } else { 0.0 })
    }

    #[test]
    fn flat_layout_is_w_h_b_k() {
        let mut p = ParamBlocks::zeros(2, 1, 1);
        p.w[[0, 1]] = 1.0;
        p.h[[1, 0]] = 2.0;
        p.b[0] = 3.0;
        p.k[[1, 0]] = 4.0;

        let flat = p.to_flat();
        assert_eq!(flat.len(), 4 + 2 + 2 + 2);
        assert_eq!(flat, vec![0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 4.0]);

        let back = ParamBlocks::from_flat(2, 1, 1, &flat).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn from_flat_rejects_wrong_length() {
        let err = ParamBlocks::from_flat(3, 4, 8, &[0.0; 10]).unwrap_err();
        assert!(matches!(
            err,
            FitError::LayoutMismatch {
                expected: 48,
                actual: 10
            }
        ));
    }

    #[test]
    fn growth_preserves_fitted_values_and_zero_fills() {
        let mut rng = Prng::new(11);
        for &(n, dh, ds, n2) in &[(3usize, 4usize, 8usize, 5usize), (1, 2, 2, 4), (6, 1, 3, 7)] {
            let old = random_blocks(&mut rng, n, dh, ds, 1.0);
            let mut model = EncodingModel::with_params(old.clone(), HistoryGradient::PerLag).unwrap();
            assert!(model.grow_to(n2).unwrap());

            let p = model.params();
            assert_eq!(model.parameter_count(), flat_len(n2, dh, ds));
            for i in 0..n2 {
                for j in 0..n2 {
                    let expect = if i < n && j < n { old.w[[i, j]] } else { 0.0 };
                    assert_eq!(p.w[[i, j]], expect);
                }
                for j in 0..dh {
                    let expect = if i < n { old.h[[i, j]] } else { 0.0 };
                    assert_eq!(p.h[[i, j]], expect);
                }
                for j in 0..ds {
                    let expect = if i < n { old.k[[i, j]] } else { 0.0 };
                    assert_eq!(p.k[[i, j]], expect);
                }
                let expect = if i < n { old.b[i] } else { 0.0 };
                assert_eq!(p.b[i], expect);
            }
        }
    }

    #[test]
    fn growth_to_same_size_is_a_no_op() {
        let mut model = EncodingModel::new(4, 2, 2, HistoryGradient::PerLag);
        assert!(!model.grow_to(4).unwrap());
        assert_eq!(model.neurons(), 4);
    }

    #[test]
    fn shrinking_fails_without_mutation() {
        let mut rng = Prng::new(5);
        let old = random_blocks(&mut rng, 5, 4, 8, 1.0);
        let mut model = EncodingModel::with_params(old.clone(), HistoryGradient::PerLag).unwrap();

        let err = model.grow_to(3).unwrap_err();
        assert!(matches!(
            err,
            FitError::InvalidGrowth {
                current: 5,
                requested: 3
            }
        ));
        assert_eq!(model.params(), &old);
    }

    #[test]
    fn zero_model_predicts_unit_rate() {
        let model = EncodingModel::new(4, 4, 8, HistoryGradient::PerLag);
        let mut rng = Prng::new(3);
        let activity = random_counts(&mut rng, 4, 12);
        let stimulus = Array2::zeros((8, 12));

        let rate = model.forward(activity.view(), stimulus.view()).unwrap();
        assert_eq!(rate.dim(), (4, 12));
        assert!(rate.iter().all(|&r| r == 1.0));
    }

    #[test]
    fn forward_uses_only_past_activity() {
        let mut params = ParamBlocks::zeros(2, 2, 1);
        params.w[[0, 1]] = 0.5;
        params.h[[0, 0]] = 0.25; // lag 1
        params.h[[0, 1]] = 0.125; // lag 2
        params.k[[0, 0]] = 1.0;
        let model = EncodingModel::with_params(params, HistoryGradient::PerLag).unwrap();

        let activity = ndarray::arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let stimulus = ndarray::arr2(&[[0.0, 1.0, 0.0]]);
        let rate = model.forward(activity.view(), stimulus.view()).unwrap();

        // t=0: nothing in the past, no stimulus.
        assert!((rate[[0, 0]].ln() - 0.0).abs() < 1e-12);
        // t=1: coupling 0.5*4, lag1 0.25*1, stimulus 1.
        assert!((rate[[0, 1]].ln() - (2.0 + 0.25 + 1.0)).abs() < 1e-12);
        // t=2: coupling 0.5*5, lag1 0.25*2, lag2 0.125*1.
        assert!((rate[[0, 2]].ln() - (2.5 + 0.5 + 0.125)).abs() < 1e-12);
        // Neuron 1 has no parameters at all.
        assert!(rate.row(1).iter().all(|&r| r == 1.0));
    }

    #[test]
    fn forward_ignores_a_nonzero_coupling_diagonal() {
        let mut params = ParamBlocks::zeros(2, 1, 1);
        params.w[[0, 0]] = 3.0;
        let model = EncodingModel {
            params,
            history_gradient: HistoryGradient::PerLag,
            steps: 0,
        };
        let activity = Array2::from_elem((2, 3), 1.0);
        let stimulus = Array2::zeros((1, 3));
        let rate = model.forward(activity.view(), stimulus.view()).unwrap();
        assert!(rate.iter().all(|&r| r == 1.0));
    }

    #[test]
    fn zero_window_objective_matches_derivation() {
        // N=3, T=5, every rate is 1: (15 - 0) / (5 * 9).
        let model = EncodingModel::new(3, 2, 2, HistoryGradient::PerLag);
        let activity = Array2::zeros((3, 5));
        let stimulus = Array2::zeros((2, 5));
        let ll = model.objective(activity.view(), stimulus.view()).unwrap();
        assert!((ll - 15.0 / 45.0).abs() < 1e-15, "ll = {ll}");
    }

    #[test]
    fn empty_window_is_harmless() {
        let model = EncodingModel::new(3, 2, 2, HistoryGradient::PerLag);
        let activity = Array2::zeros((3, 0));
        let stimulus = Array2::zeros((2, 0));
        assert_eq!(model.objective(activity.view(), stimulus.view()).unwrap(), 0.0);
        let grad = model.gradient(activity.view(), stimulus.view()).unwrap();
        assert!(grad.to_flat().iter().all(|&g| g == 0.0));
    }

    #[test]
    fn window_shape_is_checked() {
        let model = EncodingModel::new(3, 2, 2, HistoryGradient::PerLag);
        let activity = Array2::zeros((4, 5));
        let stimulus = Array2::zeros((2, 5));
        assert!(matches!(
            model.forward(activity.view(), stimulus.view()),
            Err(FitError::WindowShape { .. })
        ));
        let activity = Array2::zeros((3, 5));
        let stimulus = Array2::zeros((2, 4));
        assert!(matches!(
            model.objective(activity.view(), stimulus.view()),
            Err(FitError::WindowShape { .. })
        ));
    }

    #[test]
    fn coupling_gradient_diagonal_is_zero() {
        let mut rng = Prng::new(21);
        for mode in [HistoryGradient::PerLag, HistoryGradient::Aggregate] {
            let params = random_blocks(&mut rng, 6, 4, 8, 0.3);
            let model = EncodingModel::with_params(params, mode).unwrap();
            let activity = random_counts(&mut rng, 6, 30);
            let stimulus = random_stimulus(&mut rng, 8, 30);
            let grad = model.gradient(activity.view(), stimulus.view()).unwrap();
            assert!(grad.w.diag().iter().all(|&g| g == 0.0));
            assert!(grad.w.iter().any(|&g| g != 0.0));
        }
    }

    #[test]
    fn objective_is_invariant_to_neuron_permutation() {
        let mut rng = Prng::new(8);
        let (n, dh, ds, t) = (5, 3, 4, 20);
        let params = random_blocks(&mut rng, n, dh, ds, 0.4);
        let activity = random_counts(&mut rng, n, t);
        let stimulus = random_stimulus(&mut rng, ds, t);
        let perm = [3usize, 0, 4, 1, 2];

        let mut permuted = ParamBlocks::zeros(n, dh, ds);
        let mut permuted_activity = Array2::zeros((n, t));
        for (new_i, &old_i) in perm.iter().enumerate() {
            for (new_j, &old_j) in perm.iter().enumerate() {
                permuted.w[[new_i, new_j]] = params.w[[old_i, old_j]];
            }
            permuted.h.row_mut(new_i).assign(&params.h.row(old_i));
            permuted.k.row_mut(new_i).assign(&params.k.row(old_i));
            permuted.b[new_i] = params.b[old_i];
            permuted_activity.row_mut(new_i).assign(&activity.row(old_i));
        }

        let a = EncodingModel::with_params(params, HistoryGradient::PerLag).unwrap();
        let b = EncodingModel::with_params(permuted, HistoryGradient::PerLag).unwrap();
        let la = a.objective(activity.view(), stimulus.view()).unwrap();
        let lb = b.objective(permuted_activity.view(), stimulus.view()).unwrap();
        assert!((la - lb).abs() < 1e-12, "{la} vs {lb}");
    }

    #[test]
    fn per_lag_gradient_matches_finite_differences() {
        let mut rng = Prng::new(42);
        let (n, dh, ds, t) = (4, 3, 2, 16);
        let params = random_blocks(&mut rng, n, dh, ds, 0.2);
        let activity = random_counts(&mut rng, n, t);
        let stimulus = random_stimulus(&mut rng, ds, t);

        let model = EncodingModel::with_params(params.clone(), HistoryGradient::PerLag).unwrap();
        let analytic = model.gradient(activity.view(), stimulus.view()).unwrap().to_flat();

        // The analytic gradient is d(objective)/d(theta) scaled by N.
        let base = params.to_flat();
        let step = 1e-6;
        for idx in 0..base.len() {
            // Skip the coupling diagonal; it is pinned to zero.
            if idx < n * n && idx / n == idx % n {
                continue;
            }
            let eval = |delta: f64| {
                let mut flat = base.clone();
                flat[idx] += delta;
                let p = ParamBlocks::from_flat(n, dh, ds, &flat).unwrap();
                EncodingModel::with_params(p, HistoryGradient::PerLag)
                    .unwrap()
                    .objective(activity.view(), stimulus.view())
                    .unwrap()
            };
            let numeric = (eval(step) - eval(-step)) / (2.0 * step) * n as f64;
            assert!(
                (numeric - analytic[idx]).abs() < 1e-6 * (1.0 + numeric.abs()),
                "index {idx}: numeric {numeric} vs analytic {}",
                analytic[idx]
            );
        }
    }

    #[test]
    fn aggregate_history_gradient_repeats_across_lags() {
        let mut rng = Prng::new(13);
        let params = random_blocks(&mut rng, 4, 4, 2, 0.2);
        let activity = random_counts(&mut rng, 4, 25);
        let stimulus = random_stimulus(&mut rng, 2, 25);

        let aggregate = EncodingModel::with_params(params.clone(), HistoryGradient::Aggregate)
            .unwrap()
            .gradient(activity.view(), stimulus.view())
            .unwrap();
        for row in aggregate.h.rows() {
            assert!(row.iter().all(|&g| g == row[0]));
        }

        let per_lag = EncodingModel::with_params(params, HistoryGradient::PerLag)
            .unwrap()
            .gradient(activity.view(), stimulus.view())
            .unwrap();
        // Only the history block depends on the mode.
        assert_eq!(per_lag.w, aggregate.w);
        assert_eq!(per_lag.b, aggregate.b);
        assert_eq!(per_lag.k, aggregate.k);
        assert_ne!(per_lag.h, aggregate.h);
    }

    #[test]
    fn small_step_lowers_the_objective() {
        let mut rng = Prng::new(77);
        let mut model = EncodingModel::new(5, 4, 3, HistoryGradient::PerLag);
        let activity = random_counts(&mut rng, 5, 40);
        let stimulus = random_stimulus(&mut rng, 3, 40);

        let before = model.objective(activity.view(), stimulus.view()).unwrap();
        let grad = model.gradient(activity.view(), stimulus.view()).unwrap();
        model.apply_gradient_step(&grad, 1e-2).unwrap();
        let after = model.objective(activity.view(), stimulus.view()).unwrap();

        assert!(after < before, "{after} !< {before}");
        assert_eq!(model.steps(), 1);
        assert!(model.coupling().diag().iter().all(|&w| w == 0.0));
    }

    #[test]
    fn gradient_step_skips_non_finite_entries_and_checks_shape() {
        let mut model = EncodingModel::new(2, 1, 1, HistoryGradient::PerLag);
        let mut grad = ParamBlocks::zeros(2, 1, 1);
        grad.b[0] = f64::NAN;
        grad.b[1] = 2.0;
        grad.k[[0, 0]] = f64::INFINITY;
        model.apply_gradient_step(&grad, 0.5).unwrap();
        assert_eq!(model.params().b[0], 0.0);
        assert_eq!(model.params().b[1], -1.0);
        assert_eq!(model.params().k[[0, 0]], 0.0);

        let wrong = ParamBlocks::zeros(3, 1, 1);
        assert!(matches!(
            model.apply_gradient_step(&wrong, 0.5),
            Err(FitError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn overflowing_rates_are_zeroed() {
        let mut params = ParamBlocks::zeros(1, 1, 1);
        params.b[0] = 1e6;
        let model = EncodingModel::with_params(params, HistoryGradient::PerLag).unwrap();
        let activity = Array2::from_elem((1, 4), 1.0);
        let stimulus = Array2::zeros((1, 4));
        let rate = model.forward(activity.view(), stimulus.view()).unwrap();
        assert!(rate.iter().all(|&r| r == 0.0));
        let grad = model.gradient(activity.view(), stimulus.view()).unwrap();
        assert!(grad.to_flat().iter().all(|g| g.is_finite()));
    }

    #[test]
    fn model_image_roundtrip_basic() {
        let mut rng = Prng::new(123);
        let params = random_blocks(&mut rng, 7, 4, 8, 1.0);
        let mut model = EncodingModel::with_params(params, HistoryGradient::Aggregate).unwrap();
        let grad = ParamBlocks::zeros(7, 4, 8);
        model.apply_gradient_step(&grad, 1e-5).unwrap();

        let mut bytes: Vec<u8> = Vec::new();
        model.save_image_to(&mut bytes).unwrap();

        let mut cursor = std::io::Cursor::new(bytes);
        let loaded = EncodingModel::load_image_from(&mut cursor).unwrap();

        assert_eq!(loaded.params(), model.params());
        assert_eq!(loaded.history_gradient(), HistoryGradient::Aggregate);
        assert_eq!(loaded.steps(), 1);
    }

    #[test]
    fn model_image_rejects_bad_magic() {
        let mut cursor = std::io::Cursor::new(b"NOTMODEL\x01\x00\x00\x00".to_vec());
        let err = EncodingModel::load_image_from(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

use std::io;

/// Errors raised by the fitting engine.
///
/// Numeric degeneracy (NaN/Inf in activity, rates or gradients) is not an
/// error: those values are replaced with zero where they are used.
#[derive(Debug, thiserror::Error)]
pub enum FitError {
    /// Shrinking the modeled population would discard fitted parameters.
    #[error("cannot shrink model from {current} to {requested} neurons")]
    InvalidGrowth { current: usize, requested: usize },

    #[error("frame {frame} exceeds stimulus horizon of {horizon} frames")]
    CapacityExceeded { frame: usize, horizon: usize },

    #[error("activity handle `{0}` could not be resolved")]
    Unavailable(String),

    #[error("window shape mismatch: expected {expected}, got {actual}")]
    WindowShape { expected: String, actual: String },

    #[error("parameter layout mismatch: expected {expected} values, got {actual}")]
    LayoutMismatch { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type FitResult<T> = Result<T, FitError>;

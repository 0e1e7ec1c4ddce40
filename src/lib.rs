#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/storage.rs"]
pub mod storage;

#[path = "core/model.rs"]
pub mod model;

#[path = "core/stimulus.rs"]
pub mod stimulus;

#[path = "core/tuning.rs"]
pub mod tuning;

#[path = "core/controller.rs"]
pub mod controller;

#[path = "core/snapshot.rs"]
pub mod snapshot;

pub mod boundary;
pub mod observer;

pub use controller::{FitConfig, FitState, OnlineFitController};
pub use error::{FitError, FitResult};

// error.rs — crate-wide error type.
//
// Two classes of failure exist in the detector core:
//
//   - Contract violations (bad sizes, wrong element types, a classifier
//     with zero weak learners, a window larger than a pyramid scale).
//     These are caller bugs and panic via `assert!` at the point of
//     detection, like every `assert!` in `matrix.rs`.
//
//   - Everything in this enum: conditions a serving layer can report
//     to its client (classifier missing, malformed classifier file) or
//     device failures it should surface as a service error.

use crate::gpu::device::GpuError;

/// Errors returned by the detector core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `predict` was called before any classifier was loaded.
    /// A serving layer maps this to a conflict response.
    #[error("no classifier loaded")]
    ClassifierNotLoaded,

    /// A classifier record failed validation.
    #[error("invalid classifier: {0}")]
    InvalidClassifier(String),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Gpu(#[from] GpuError),
}

pub type Result<T> = std::result::Result<T, Error>;

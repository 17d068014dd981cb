//! Error types shared by the samplers and the Jacobian evaluator

use crate::config::Backend;
use thiserror::Error;

/// Errors raised before any computation starts.
///
/// Folding deformations (non-positive Jacobian determinants) and degenerate
/// axes of length one are valid inputs and never produce an error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Tensor shapes are inconsistent with each other.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Spatial rank outside what the selected backend implements.
    #[error("Unsupported spatial rank {0}")]
    UnsupportedRank(usize),

    /// Spacing must be positive and finite, one entry per spatial axis.
    #[error("Invalid spacing {value} along axis {axis}")]
    InvalidSpacing { axis: usize, value: f64 },

    /// The requested backend cannot run on this machine.
    #[error("Backend `{backend}` unavailable: {reason}")]
    BackendUnavailable { backend: Backend, reason: String },

    /// A statistic was requested over zero voxels.
    #[error("Empty selection: {0}")]
    EmptySelection(String),

    /// Configuration could not be parsed or applied.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

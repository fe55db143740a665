//! Error types for the adaptive-glmm library.

use thiserror::Error;

/// Main error type for the library.
///
/// Recoverable numerical trouble (per-cluster mode non-convergence, curvature
/// regularization, optimizer iteration caps) is *not* an error: it is surfaced
/// through [`crate::engine::FitWarnings`] on the returned fit. Only usage errors
/// and conditions that leave the likelihood undefined abort a fit.
#[derive(Error, Debug)]
pub enum GlmmError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Family is missing a required capability: {0}")]
    MissingCapability(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Models are not nested: {0}")]
    NotNested(String),

    #[error("Singular design matrix: {0}")]
    SingularDesign(String),

    #[error("Numerical error: {0}")]
    Numerical(String),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, GlmmError>;

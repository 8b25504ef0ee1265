//! Error types for pipeline selection and setup

use thiserror::Error;

use super::codec::CodecError;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline selection and setup errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    // =========================================================================
    // Selection Errors
    // =========================================================================
    /// Every candidate failed to instantiate
    #[error("No viable {encoding} pipeline: {}", reasons.join("; "))]
    NoViablePipeline {
        /// Requested encoding
        encoding: String,
        /// One entry per failed candidate
        reasons: Vec<String>,
    },

    /// No encoder is registered for the encoding
    #[error("No encoder registered for {0}")]
    UnknownEncoding(String),

    /// No ratio of the scaling ladder brings the size within bounds
    #[error("Cannot scale {width}x{height} to fit {max_width}x{max_height}")]
    ScalingUnsatisfiable {
        /// Source width
        width: u32,
        /// Source height
        height: u32,
        /// Maximum width
        max_width: u32,
        /// Maximum height
        max_height: u32,
    },

    /// Invalid scaling ratio
    #[error("Invalid scaling ratio {num}/{den}")]
    InvalidScaling {
        /// Numerator
        num: u32,
        /// Denominator
        den: u32,
    },

    /// Codec plugin error outside of candidate setup
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl PipelineError {
    /// True when the caller can fall back to a non-video encoding and retry later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NoViablePipeline { .. } | Self::UnknownEncoding(_) => true,
            Self::Codec(e) => e.is_transient(),
            Self::ScalingUnsatisfiable { .. } | Self::InvalidScaling { .. } => false,
        }
    }
}

//! Encoding pipeline selection
//!
//! Chooses a (colorspace converter, encoder) pair for each frame and owns
//! the instances that were set up.
//!
//! # Architecture
//!
//! ```text
//! CodecRegistry ──┐
//! ClientCapabilities ──┼─> PipelineSelector::options ──> ranked PipelineCandidate list
//! ScalingAdvisor ─┘                │
//!                                  └─> PipelineSelector::setup ──> ActivePipeline
//!                                              │
//!                                        CodecFactory (plugins)
//! ```
//!
//! Codec capabilities are a read-only snapshot; replacing the registry
//! invalidates every cached selection.

mod capabilities;
mod codec;
mod error;
mod scaling;
mod scoring;
mod selector;
mod spec;

pub use capabilities::ClientCapabilities;
#[cfg(test)]
pub(crate) use codec::testing;
pub use codec::{
    CodecError, CodecFactory, CodecResult, ColorspaceConverter, ConverterHandle, ConverterRequest,
    EncoderHandle, EncoderRequest, VideoEncoder,
};
pub use error::{PipelineError, Result};
pub use scaling::{ScalingAdvisor, ScalingContext, ScalingRatio, SCALING_LADDER};
pub use scoring::{
    edge_resistance_score, encoding_score_delta, quality_score, speed_score, subsampling_divisor,
    RunningStages, ScoreBreakdown, ScoreTargets,
};
pub use selector::{
    setup_pipeline, shape_quality, ActivePipeline, ActivePipelineInfo, ConverterStage,
    PipelineCandidate, PipelineDiagnostics, PipelineSelector, PipelineTargets, RegionHint,
    SetupParams, WindowHints,
};
pub use spec::{
    is_subsampled, subsampling_divs, CodecRegistry, ConverterSpec, EncoderSpec, PlaneDivs,
};

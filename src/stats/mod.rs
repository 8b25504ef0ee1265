//! Encoding Statistics
//!
//! Bounded sample series, the weighted-average primitives that turn them into
//! normalized pressure factors, and the two aggregators built on top:
//!
//! - [`GlobalStats`]: one per connection, written by the network and damage
//!   ingestion paths, read by every window's controller
//! - [`WindowStats`]: one per window, exclusively owned by its encode context
//!
//! # Factors
//!
//! Every signal the controller listens to is expressed as a [`Factor`]:
//!
//! ```text
//!   factor > 1.0  → compress more (raise delay, lower quality)
//!   factor < 1.0  → headroom available
//!   weight        → how much this factor should count in the blend
//! ```
//!
//! Generators that have no samples yet return a neutral factor with zero
//! weight; starvation is never an error.

pub mod factor;
pub mod global;
pub mod primitives;
pub mod series;
pub mod window;

use thiserror::Error;

pub use factor::{Factor, FactorSet, MIN_FACTOR_WEIGHT};
pub use global::{GlobalStats, GlobalStatsInfo};
pub use primitives::{
    for_average, for_target, log2p, logp, queue_inspect, size_weighted_average,
    time_weighted_average, timesize_weighted_average, Smoothing, TargetParams,
};
pub use series::{LatencySample, RingBuffer, Sample, SampleSeries, SizedSample, WindowSample};
pub use window::{ClientBacklog, EncodingSample, WindowStats, WindowStatsInfo};

/// Result type for statistics operations
pub type Result<T> = std::result::Result<T, StatsError>;

/// Statistics error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    /// A weighted average was requested over no samples
    #[error("no samples for weighted average")]
    EmptySamples,

    /// Samples were present but none carried usable weight
    #[error("no usable samples out of {0}")]
    NoUsableSamples(usize),

    /// Factor values must be finite and weights non-negative
    #[error("invalid factor {name}: factor={factor} weight={weight}")]
    InvalidFactor {
        /// Metric name
        name: String,
        /// Offending factor value
        factor: f64,
        /// Offending weight value
        weight: f64,
    },

    /// A factor input was negative, NaN or infinite
    #[error("invalid {input} for {name}: {value}")]
    InvalidInput {
        /// Metric name
        name: String,
        /// Which input was rejected
        input: &'static str,
        /// Offending value
        value: f64,
    },
}

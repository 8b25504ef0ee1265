//! # lamco-video-governor
//!
//! Adaptive encoding decisions for remote display servers.
//!
//! Given a stream of window damage events and feedback from the transport,
//! this crate decides per window:
//! - how long to batch damage before flushing a frame
//! - which encoder speed and quality to aim for
//! - whether part of the window is video and should be encoded as such
//! - which (colorspace converter, encoder) pipeline to use, and at what scale
//!
//! It never touches pixels. Codecs are plugins behind
//! [`pipeline::CodecFactory`].
//!
//! # Architecture
//!
//! ```text
//! lamco-video-governor
//!   ├─> stats        (sample series, weighted averages, pressure factors)
//!   ├─> performance  (batch delay controller, speed/quality targets)
//!   ├─> video        (video region detection, delayed refreshes)
//!   ├─> pipeline     (codec registry, scoring, scaling, setup)
//!   └─> window       (per-window glue owning all of the above)
//! ```
//!
//! # Data Flow
//!
//! **Damage:** feed → [`window::WindowEncodeContext::record_damage`] →
//! damage history → region detection
//!
//! **Feedback:** acks, pings, congestion → [`stats::GlobalStats`] →
//! factors → batch delay and targets
//!
//! **Encode:** targets + region → [`pipeline::PipelineSelector`] →
//! active pipeline

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Configuration
pub mod config;

/// Rectangle algebra and damage history
pub mod damage;

/// Batch delay and encoder target control
pub mod performance;

/// Codec pipeline selection and scaling
pub mod pipeline;

/// Encoding statistics and pressure factors
pub mod stats;

/// Video region detection
pub mod video;

/// Per-window encode context
pub mod window;

pub use config::Config;
pub use window::{WindowDiagnostics, WindowEncodeContext};

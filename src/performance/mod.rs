//! Batching and encoder target control
//!
//! This module contains the per-window feedback controllers:
//! - **Batch delay**: how long damage is accumulated before a flush
//! - **Targets**: encoder speed and quality in 0..=100
//!
//! # Architecture
//!
//! ```text
//! WindowStats ─┐
//!              ├─> BatchController::recompute ──> BatchState.delay
//! GlobalStats ─┘                 │
//!                                └─> target_speed / target_quality
//!                                        └─> TargetSettings (manual overrides)
//! ```
//!
//! Both run on the window's recalculation tick, never per damage event.

mod batch;
mod targets;

use thiserror::Error;

pub use batch::{BatchController, BatchDiagnostics, BatchInputs, BatchState};
pub use targets::{
    target_quality, target_speed, QualityBreakdown, QualityTarget, SpeedBreakdown, SpeedTarget,
    TargetContext, TargetSettings, MAX_PIXEL_RATE_MPPS, MIN_DECODE_SPEED,
};

/// Result type for control surface operations
pub type Result<T> = std::result::Result<T, ControlError>;

/// Rejected manual control values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// Value outside its permitted range
    #[error("{name} {value} outside {min}..={max}")]
    OutOfRange {
        /// Setting name
        name: &'static str,
        /// Rejected value
        value: f64,
        /// Lowest permitted value
        min: f64,
        /// Highest permitted value
        max: f64,
    },

    /// Value that is not a usable number
    #[error("invalid {name}: {value}")]
    InvalidValue {
        /// Setting name
        name: &'static str,
        /// Rejected value
        value: f64,
    },
}

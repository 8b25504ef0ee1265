//! Video region handling
//!
//! This module finds the video-like part of a window and drives the
//! delayed refreshes that repair lossy frames inside it.
//!
//! # Components
//!
//! - [`VideoRegionDetector`]: scores damage history and adopts a region
//! - [`RefreshTimer`]: single outstanding tokio timer per window

mod refresh;
mod subregion;

pub use refresh::{RefreshRequest, RefreshTimer};
pub use subregion::{
    RegionDiagnostics, RegionState, ScoredRegion, SubregionRefresh, VideoRegionDetector,
};

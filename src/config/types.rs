//! Configuration type definitions
//!
//! Every field has a serde default so a partial TOML file (or none at all)
//! yields the tuned defaults below. The region thresholds and decay values
//! are empirically calibrated; treat them as tuning knobs.

use serde::{Deserialize, Serialize};

// =============================================================================
// Batching
// =============================================================================

/// Batch delay controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Lowest delay the controller may settle on (ms)
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: f64,

    /// Highest delay the controller may settle on (ms)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: f64,

    /// Delay for a new window and after a full-quality refresh (ms)
    #[serde(default = "default_start_delay")]
    pub start_delay_ms: f64,

    /// Minimum delay while another window is fullscreen or maximized (ms)
    #[serde(default = "default_peer_min_delay")]
    pub peer_min_delay_ms: f64,

    /// Always batch, even when the delay is below the minimum
    #[serde(default)]
    pub always: bool,

    /// How often delays, targets and the video region are recomputed (ms)
    #[serde(default = "default_recalculate_interval")]
    pub recalculate_interval_ms: u64,

    /// Flush a batch early after this many damage events
    #[serde(default = "default_max_events")]
    pub max_events: u32,

    /// Flush a batch early after this many pixels (0 = one frame)
    #[serde(default)]
    pub max_pixels: u64,

    /// Requested and actual delays remembered for the history blend
    #[serde(default = "default_delay_history")]
    pub delay_history: usize,
}

fn default_min_delay() -> f64 {
    5.0
}

fn default_max_delay() -> f64 {
    15_000.0
}

fn default_start_delay() -> f64 {
    50.0
}

fn default_peer_min_delay() -> f64 {
    40.0
}

fn default_recalculate_interval() -> u64 {
    250
}

fn default_max_events() -> u32 {
    50
}

fn default_delay_history() -> usize {
    64
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            start_delay_ms: default_start_delay(),
            peer_min_delay_ms: default_peer_min_delay(),
            always: false,
            recalculate_interval_ms: default_recalculate_interval(),
            max_events: default_max_events(),
            max_pixels: 0,
            delay_history: default_delay_history(),
        }
    }
}

// =============================================================================
// Video region detection
// =============================================================================

/// Score thresholds for adopting or keeping a video region
///
/// Scores are on a 0..~150+ scale where 100 is neutral.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionThresholds {
    /// An existing region scoring at least this is kept without re-evaluation
    #[serde(default = "default_keep")]
    pub keep: f64,

    /// A single exact rectangle scoring at least this is adopted immediately
    #[serde(default = "default_shortcut")]
    pub shortcut: f64,

    /// An existing region is retained down to this score
    #[serde(default = "default_retain")]
    pub retain: f64,

    /// Merged candidates are adopted down to this score
    #[serde(default = "default_adopt")]
    pub adopt: f64,

    /// The union of all candidates is adopted down to this score
    #[serde(default = "default_union")]
    pub union: f64,
}

fn default_keep() -> f64 {
    125.0
}

fn default_shortcut() -> f64 {
    120.0
}

fn default_retain() -> f64 {
    90.0
}

fn default_adopt() -> f64 {
    100.0
}

fn default_union() -> f64 {
    110.0
}

impl Default for RegionThresholds {
    fn default() -> Self {
        Self {
            keep: default_keep(),
            shortcut: default_shortcut(),
            retain: default_retain(),
            adopt: default_adopt(),
            union: default_union(),
        }
    }
}

/// Video region detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRegionConfig {
    /// Master switch; when off no region is ever reported
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Automatic detection (a manual region can still be set when off)
    #[serde(default = "default_true")]
    pub detection: bool,

    /// Damage events required before detection runs
    #[serde(default = "default_min_events")]
    pub min_events: u64,

    /// Smallest region width
    #[serde(default = "default_min_width")]
    pub min_width: u32,

    /// Smallest region height
    #[serde(default = "default_min_height")]
    pub min_height: u32,

    /// Only damage this recent is considered (ms)
    #[serde(default = "default_max_time")]
    pub max_time_ms: u64,

    /// New damage events required between two evaluations
    #[serde(default = "default_debounce_events")]
    pub debounce_events: u64,

    /// Lowest delay before a queued region refresh fires (ms)
    #[serde(default = "default_refresh_delay")]
    pub refresh_delay_ms: u64,

    /// Adoption thresholds
    #[serde(default)]
    pub thresholds: RegionThresholds,
}

fn default_true() -> bool {
    true
}

fn default_min_events() -> u64 {
    20
}

fn default_min_width() -> u32 {
    128
}

fn default_min_height() -> u32 {
    96
}

fn default_max_time() -> u64 {
    5000
}

fn default_debounce_events() -> u64 {
    10
}

fn default_refresh_delay() -> u64 {
    150
}

impl Default for VideoRegionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detection: true,
            min_events: default_min_events(),
            min_width: default_min_width(),
            min_height: default_min_height(),
            max_time_ms: default_max_time(),
            debounce_events: default_debounce_events(),
            refresh_delay_ms: default_refresh_delay(),
            thresholds: RegionThresholds::default(),
        }
    }
}

// =============================================================================
// Pipeline selection
// =============================================================================

/// Pipeline selector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long a ranked candidate list stays valid (ms)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,

    /// Encodings in order of preference; earlier entries get a score bonus
    #[serde(default = "default_preferred_encodings")]
    pub preferred_encodings: Vec<String>,

    /// Lowest speed requested from a colorspace converter
    #[serde(default = "default_min_converter_speed")]
    pub min_converter_speed: u8,
}

fn default_cache_ttl() -> u64 {
    1000
}

fn default_preferred_encodings() -> Vec<String> {
    ["h264", "vp9", "h265", "av1", "vp8"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_min_converter_speed() -> u8 {
    1
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl(),
            preferred_encodings: default_preferred_encodings(),
            min_converter_speed: default_min_converter_speed(),
        }
    }
}

// =============================================================================
// Scaling
// =============================================================================

/// Scaling advisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Allow downscaling at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 0 (never scale) to 100 (scale aggressively); unset = automatic
    #[serde(default)]
    pub control: Option<u8>,

    /// Pixel rate (pixels/s) above which video content gets downscaled
    #[serde(default = "default_pps_target")]
    pub pps_target: f64,

    /// Windows narrower than this are never scaled
    #[serde(default = "default_min_scaling_width")]
    pub min_width: u32,

    /// Windows shorter than this are never scaled
    #[serde(default = "default_min_scaling_height")]
    pub min_height: u32,
}

fn default_pps_target() -> f64 {
    25.0 * 1920.0 * 1080.0
}

fn default_min_scaling_width() -> u32 {
    128
}

fn default_min_scaling_height() -> u32 {
    96
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            control: None,
            pps_target: default_pps_target(),
            min_width: default_min_scaling_width(),
            min_height: default_min_scaling_height(),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "pretty", "compact" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

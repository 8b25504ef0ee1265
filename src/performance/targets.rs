//! Speed and Quality Targets
//!
//! Turns window and connection statistics into encoder speed and quality
//! targets in 0..=100.
//!
//! # Speed
//!
//! ```text
//!   factors: damage latency vs size-derived reference   (absolute, relative)
//!            client decode speed vs 8 Mpixel/s
//!            recent pixel rate vs 50 Mpixel/s
//!   speed  = min_speed + (100 - min_speed) × min(1, max(factors))
//!   capped by backlog, bandwidth and congestion limits
//! ```
//!
//! # Quality
//!
//! ```text
//!   target  = min(backlog, bandwidth, congestion, batch delay, latency)
//!           × compression trend
//!   target ^= (100 + 4·min_speed) / 100          when a speed floor is set
//!   quiet window boost when little of it changed recently
//!   quality = min_quality + (100 - min_quality) × target
//! ```

use std::time::{Duration, Instant};

use serde::Serialize;

use super::batch::BatchState;
use super::{ControlError, Result};
use crate::stats::global::GlobalAverages;
use crate::stats::{logp, WindowStats};

/// Client decode rate we expect to sustain (pixels/s)
pub const MIN_DECODE_SPEED: f64 = 8_000_000.0;

/// Pixel rate at which the speed target saturates (Mpixels/s)
pub const MAX_PIXEL_RATE_MPPS: f64 = 50.0;

/// Window over which the quiet-window boost looks at damage
const QUIET_WINDOW: Duration = Duration::from_secs(5);

// =============================================================================
// Manual overrides
// =============================================================================

/// Manual quality/speed settings for one window
///
/// Fixed values override the automatic targets until cleared with `None`.
/// Floors bound the automatic targets from below.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TargetSettings {
    fixed_quality: Option<u8>,
    min_quality: u8,
    fixed_speed: Option<u8>,
    min_speed: u8,
}

fn check_percent(name: &'static str, value: u8) -> Result<u8> {
    if value > 100 {
        return Err(ControlError::OutOfRange {
            name,
            value: value as f64,
            min: 0.0,
            max: 100.0,
        });
    }
    Ok(value)
}

impl TargetSettings {
    /// Settings with the given floors
    pub fn with_floors(min_quality: u8, min_speed: u8) -> Result<Self> {
        Ok(Self {
            min_quality: check_percent("min_quality", min_quality)?,
            min_speed: check_percent("min_speed", min_speed)?,
            ..Self::default()
        })
    }

    /// Pin the quality, or resume automatic control with `None`
    pub fn set_quality(&mut self, quality: Option<u8>) -> Result<()> {
        self.fixed_quality = quality.map(|q| check_percent("quality", q)).transpose()?;
        Ok(())
    }

    /// Set the quality floor
    pub fn set_min_quality(&mut self, min_quality: u8) -> Result<()> {
        self.min_quality = check_percent("min_quality", min_quality)?;
        Ok(())
    }

    /// Pin the speed, or resume automatic control with `None`
    pub fn set_speed(&mut self, speed: Option<u8>) -> Result<()> {
        self.fixed_speed = speed.map(|s| check_percent("speed", s)).transpose()?;
        Ok(())
    }

    /// Set the speed floor
    pub fn set_min_speed(&mut self, min_speed: u8) -> Result<()> {
        self.min_speed = check_percent("min_speed", min_speed)?;
        Ok(())
    }

    /// Pinned quality
    pub fn fixed_quality(&self) -> Option<u8> {
        self.fixed_quality
    }

    /// Quality floor
    pub fn min_quality(&self) -> u8 {
        self.min_quality
    }

    /// Pinned speed
    pub fn fixed_speed(&self) -> Option<u8> {
        self.fixed_speed
    }

    /// Speed floor
    pub fn min_speed(&self) -> u8 {
        self.min_speed
    }
}

// =============================================================================
// Inputs and results
// =============================================================================

/// Everything the target computations read
#[derive(Debug, Clone, Copy)]
pub struct TargetContext<'a> {
    /// Window width
    pub width: u32,
    /// Window height
    pub height: u32,
    /// Window statistics (averages already refreshed)
    pub window: &'a WindowStats,
    /// Connection averages
    pub global: &'a GlobalAverages,
    /// Batching state
    pub batch: &'a BatchState,
    /// Manual settings
    pub settings: &'a TargetSettings,
    /// Speed currently in use
    pub current_speed: f64,
    /// Bandwidth cap in bits per second (0 = none)
    pub bandwidth_limit: u64,
    /// Evaluation time
    pub now: Instant,
}

impl TargetContext<'_> {
    fn frame_pixels(&self) -> f64 {
        (self.width as f64 * self.height as f64).max(1.0)
    }

    fn bandwidth_mbps(&self) -> Option<f64> {
        (self.bandwidth_limit > 0).then(|| self.bandwidth_limit as f64 / 1_000_000.0)
    }
}

/// Components of a speed decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SpeedBreakdown {
    /// Damage latency above reference, absolute
    pub damage_latency_abs: f64,
    /// Damage latency relative to the frame delay
    pub damage_latency_rel: f64,
    /// Decode speed deficit
    pub decode_latency: f64,
    /// Recent pixel rate
    pub pixel_rate: f64,
    /// Limit from the client backlog
    pub backlog_limit: f64,
    /// Limit from the bandwidth cap
    pub bandwidth_limit: f64,
    /// Limit from congestion
    pub congestion_limit: f64,
}

/// Speed target
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedTarget {
    /// Target speed, 0..=100
    pub speed: f64,
    /// Ceiling applied to the target
    pub max_speed: f64,
    /// How it was derived
    pub breakdown: SpeedBreakdown,
}

/// Components of a quality decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QualityBreakdown {
    /// Limit from the client backlog
    pub backlog: f64,
    /// Limit from the bandwidth cap
    pub bandwidth: f64,
    /// Limit from congestion
    pub congestion: f64,
    /// Batch delay against its reference
    pub batch: f64,
    /// Client latency against target
    pub latency: f64,
    /// Compression trend multiplier
    pub compression: f64,
    /// Share of the window damaged recently
    pub damaged_ratio: f64,
}

/// Quality target
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityTarget {
    /// Target quality, 0..=100
    pub quality: f64,
    /// How it was derived
    pub breakdown: QualityBreakdown,
}

// =============================================================================
// Speed
// =============================================================================

/// Compute the automatic speed target
pub fn target_speed(ctx: &TargetContext<'_>) -> SpeedTarget {
    let min_speed = ctx.settings.min_speed() as f64;
    let mut b = SpeedBreakdown::default();

    // reference latency grows with the log of the frame size
    let mpixels = ctx.frame_pixels() / 1_000_000.0;
    let ref_latency = (10.0 + 25.0 * (1.0 + mpixels.max(1.0).ln())) / 1000.0;

    let adil = ctx.window.avg_damage_in_latency();
    b.damage_latency_abs = (adil - ref_latency).max(0.0) / (ref_latency * 3.0);

    if !ctx.batch.is_locked() {
        let avg_delay = ctx.batch.avg_actual_delay().unwrap_or(ctx.batch.delay());
        let frame_delay = ((avg_delay + ctx.batch.delay()) / 2.0).max(10.0);
        let target = ref_latency.max(frame_delay / 1000.0);
        b.damage_latency_rel = ctx.current_speed / 100.0 * adil / target;
    }

    let decode_speed = if ctx.window.avg_decode_speed() > 0.0 {
        ctx.window.avg_decode_speed()
    } else {
        ctx.global.avg_decode_speed
    };
    if decode_speed > 0.0 {
        b.decode_latency = MIN_DECODE_SPEED / decode_speed;
    }

    let one_second_ago = ctx.now.checked_sub(Duration::from_secs(1));
    let (events, pixels) = match one_second_ago {
        Some(since) => ctx
            .window
            .damage()
            .since(since)
            .fold((0usize, 0u64), |(n, p), e| (n + 1, p + e.rect.area())),
        None => (0, 0),
    };
    let mpps = pixels as f64 / 1_000_000.0;
    if events > 5 && mpps >= 1.0 {
        b.pixel_rate = (mpps / MAX_PIXEL_RATE_MPPS).sqrt();
    }

    let backlog = ctx.window.client_backlog();
    let pb_ratio = backlog.pixels as f64 / ctx.frame_pixels();
    b.backlog_limit = 100.0 - 100.0 * logp(pb_ratio / 4.0);
    b.bandwidth_limit = match ctx.bandwidth_mbps() {
        Some(mbps) => (200.0 * logp(mbps / 10.0)).min(100.0),
        None => 100.0,
    };
    b.congestion_limit = 100.0 - 100.0 * ctx.global.congestion_value.clamp(0.0, 1.0);

    let max_speed = min_speed.max(b.backlog_limit.min(b.bandwidth_limit).min(b.congestion_limit));
    let factor = b
        .damage_latency_abs
        .max(b.damage_latency_rel)
        .max(b.decode_latency)
        .max(b.pixel_rate)
        .min(1.0);
    let speed = (min_speed + (100.0 - min_speed) * factor).clamp(min_speed, max_speed);

    SpeedTarget {
        speed,
        max_speed,
        breakdown: b,
    }
}

// =============================================================================
// Quality
// =============================================================================

/// Compute the automatic quality target
pub fn target_quality(ctx: &TargetContext<'_>) -> QualityTarget {
    let min_quality = ctx.settings.min_quality() as f64;
    let min_speed = ctx.settings.min_speed() as f64;
    let frame_pixels = ctx.frame_pixels();
    let mut b = QualityBreakdown::default();

    let backlog = ctx.window.client_backlog();
    b.backlog = 1.0 - logp(backlog.pixels as f64 / frame_pixels / 4.0);
    b.bandwidth = match ctx.bandwidth_mbps() {
        Some(mbps) => (2.0 * logp(mbps / 4.0)).min(1.0),
        None => 1.0,
    };
    b.congestion = (1.0 - ctx.global.congestion_value * 10.0).max(0.0);

    // the further the delay from its reference, the lower the quality
    let n = 3.0 - min_speed / 50.0;
    let tolerance = 10.0 - min_speed / 10.0;
    let recs = ctx.batch.actual_delay_count() as f64;
    let ref_delay = tolerance
        + n * (ctx.batch.start_delay() * 10.0 + ctx.batch.min_delay() * recs) / (recs + 10.0);
    b.batch = n * ref_delay / ctx.batch.min_delay().max(ctx.batch.delay()).max(1.0);

    b.latency = if ctx.global.recent_client_latency > 0.0 {
        3.0 * ctx.window.target_latency() / ctx.global.recent_client_latency
    } else {
        1.0
    };

    let mut target = b
        .backlog
        .min(b.bandwidth)
        .min(b.congestion)
        .min(b.batch)
        .min(b.latency)
        .clamp(0.0, 1.0);

    let (avg_ratio, recent_ratio) = ctx.window.compression_ratios();
    b.compression = if avg_ratio > 0.0 && recent_ratio > 0.0 {
        (recent_ratio / avg_ratio).sqrt().clamp(0.8, 1.25)
    } else {
        1.0
    };
    target = (target * b.compression).min(1.0);

    if min_speed > 0.0 {
        target = target.powf((100.0 + 4.0 * min_speed) / 100.0);
    }

    if let Some(since) = ctx.now.checked_sub(QUIET_WINDOW) {
        let damage = ctx.window.damage();
        let recent = damage.pixels_since(since);
        b.damaged_ratio = (recent as f64 / frame_pixels).min(1.0);
        if b.damaged_ratio < 0.5 {
            target = (target * (1.5 - b.damaged_ratio)).min(1.0);
        }
        let older = match since.checked_sub(QUIET_WINDOW) {
            Some(older_since) => damage.pixels_since(older_since) - recent,
            None => 0,
        };
        if recent < older {
            target = target.sqrt();
        }
    }

    let quality = min_quality + (100.0 - min_quality) * target.clamp(0.0, 1.0);
    QualityTarget {
        quality: quality.clamp(min_quality, 100.0),
        breakdown: b,
    }
}

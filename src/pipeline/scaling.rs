//! Downscaling advisor
//!
//! Decides how much a video region is downscaled before encoding. Two
//! kinds of limit apply:
//!
//! - **Required**: the encoder or client cannot take the full size, so
//!   the least reduction from the ladder that fits is mandatory.
//! - **Heuristic**: the pixel rate is too high for the quality and speed
//!   targets, so a stronger reduction is chosen even though it is not
//!   strictly needed.
//!
//! The result is always the stronger of the two, never an upscale, and
//! never below 1:10 per axis.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{PipelineError, Result};
use crate::config::ScalingConfig;
use crate::performance::ControlError;

/// Lowest pixel rate target used when deriving it from a bandwidth limit
const MIN_PPS_TARGET: f64 = 25.0 * 320.0 * 240.0;

/// Score divisor favoring the ratio already in use
const EDGE_RESISTANCE: f64 = 1.5;

/// Damage events required before heuristics are trusted
const MIN_SCALING_EVENTS: u64 = 50;

/// A downscaling ratio `num/den`, at most 1
///
/// Only [`ScalingRatio::new`], the ladder and deserialization build one, so
/// a value in hand is always between 1:10 and 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawScalingRatio")]
pub struct ScalingRatio {
    num: u32,
    den: u32,
}

#[derive(Deserialize)]
struct RawScalingRatio {
    num: u32,
    den: u32,
}

impl TryFrom<RawScalingRatio> for ScalingRatio {
    type Error = PipelineError;

    fn try_from(raw: RawScalingRatio) -> Result<Self> {
        Self::new(raw.num, raw.den)
    }
}

impl ScalingRatio {
    /// No scaling
    pub const IDENTITY: Self = Self { num: 1, den: 1 };

    /// Create a ratio, rejecting upscales, zero terms and anything below 1/10
    pub fn new(num: u32, den: u32) -> Result<Self> {
        if num == 0 || den == 0 || num > den || (num as u64) * 10 < den as u64 {
            return Err(PipelineError::InvalidScaling { num, den });
        }
        Ok(Self { num, den })
    }

    const fn of(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Numerator
    pub fn num(&self) -> u32 {
        self.num
    }

    /// Denominator
    pub fn den(&self) -> u32 {
        self.den
    }

    /// Ratio as a float
    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// True for 1:1
    pub fn is_identity(&self) -> bool {
        self.num == self.den
    }

    /// Scale one dimension
    pub fn apply(&self, value: u32) -> u32 {
        (value as u64 * self.num as u64 / self.den as u64) as u32
    }

    /// True when the scaled size fits
    pub fn fits(&self, width: u32, height: u32, max_width: u32, max_height: u32) -> bool {
        self.apply(width) <= max_width && self.apply(height) <= max_height
    }
}

impl Default for ScalingRatio {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl fmt::Display for ScalingRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.num, self.den)
    }
}

/// Allowed reductions, least reduction first
pub const SCALING_LADDER: [ScalingRatio; 6] = [
    ScalingRatio::of(2, 3),
    ScalingRatio::of(1, 2),
    ScalingRatio::of(1, 3),
    ScalingRatio::of(1, 4),
    ScalingRatio::of(1, 8),
    ScalingRatio::of(1, 10),
];

/// Window state the advisor looks at
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScalingContext {
    /// Current quality target
    pub quality: u8,
    /// Current speed target
    pub speed: u8,
    /// Frames per second of the content being encoded
    pub fps: u32,
    /// Content is known to be video
    pub video: bool,
    /// Window is fullscreen on the client
    pub fullscreen: bool,
    /// Window is maximized on the client
    pub maximized: bool,
    /// Ratio in use by the active pipeline
    pub current: ScalingRatio,
    /// Client can upscale on its side
    pub client_scaling: bool,
    /// Damage events seen for the window
    pub damage_events: u64,
    /// Window was resized within the last half second
    pub resizing: bool,
    /// Bandwidth limit in bits/s, 0 when unknown
    pub bandwidth_limit: u64,
}

impl Default for ScalingContext {
    fn default() -> Self {
        Self {
            quality: 50,
            speed: 50,
            fps: 0,
            video: false,
            fullscreen: false,
            maximized: false,
            current: ScalingRatio::IDENTITY,
            client_scaling: true,
            damage_events: 0,
            resizing: false,
            bandwidth_limit: 0,
        }
    }
}

/// Per-window scaling advisor
#[derive(Debug, Clone)]
pub struct ScalingAdvisor {
    config: ScalingConfig,
    fixed: Option<ScalingRatio>,
    control: Option<u8>,
}

impl ScalingAdvisor {
    /// Create an advisor
    pub fn new(config: ScalingConfig) -> Self {
        let control = config.control.map(|c| c.min(100));
        Self {
            config,
            fixed: None,
            control,
        }
    }

    /// Force a ratio for this window (still reduced further if required)
    pub fn set_scaling(&mut self, ratio: Option<ScalingRatio>) -> Result<()> {
        self.fixed = ratio.map(|r| ScalingRatio::new(r.num, r.den)).transpose()?;
        Ok(())
    }

    /// Fixed ratio, if any
    pub fn fixed_scaling(&self) -> Option<ScalingRatio> {
        self.fixed
    }

    /// Set how aggressive scaling is, 0 (only when required) to 100
    pub fn set_control(&mut self, control: Option<u8>) -> std::result::Result<(), ControlError> {
        if let Some(c) = control {
            if c > 100 {
                return Err(ControlError::OutOfRange {
                    name: "scaling control",
                    value: c as f64,
                    min: 0.0,
                    max: 100.0,
                });
            }
        }
        self.control = control;
        Ok(())
    }

    /// Current control value
    pub fn control(&self) -> Option<u8> {
        self.control
    }

    /// Least reduction that fits, no stronger than `preferred`
    fn required(
        &self,
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
        preferred: ScalingRatio,
    ) -> Result<ScalingRatio> {
        if preferred.fits(width, height, max_width, max_height) {
            return Ok(preferred);
        }
        SCALING_LADDER
            .iter()
            .copied()
            .filter(|r| r.as_f64() <= preferred.as_f64())
            .find(|r| r.fits(width, height, max_width, max_height))
            .ok_or(PipelineError::ScalingUnsatisfiable {
                width,
                height,
                max_width,
                max_height,
            })
    }

    /// Ratio to encode `width`x`height` with, given encoder limits
    pub fn scale(
        &self,
        width: u32,
        height: u32,
        max_width: u32,
        max_height: u32,
        ctx: &ScalingContext,
    ) -> Result<ScalingRatio> {
        if width == 0 || height == 0 {
            return Ok(ScalingRatio::IDENTITY);
        }
        if !self.config.enabled || !ctx.client_scaling {
            if width > max_width || height > max_height {
                warn!(
                    "Scaling unavailable but {}x{} exceeds {}x{}",
                    width, height, max_width, max_height
                );
            }
            return Ok(ScalingRatio::IDENTITY);
        }

        let need = |preferred| self.required(width, height, max_width, max_height, preferred);
        if let Some(fixed) = self.fixed {
            return need(fixed);
        }
        if self.control == Some(0) {
            return need(ScalingRatio::IDENTITY);
        }
        if width < self.config.min_width || height < self.config.min_height {
            return need(ScalingRatio::IDENTITY);
        }
        if ctx.resizing {
            return need(ctx.current);
        }
        if ctx.damage_events <= MIN_SCALING_EVENTS {
            return need(ScalingRatio::IDENTITY);
        }

        let minimum = need(ScalingRatio::IDENTITY)?;
        let heuristic = match self.control {
            None => self.auto_ratio(width, height, minimum, ctx),
            Some(control) => control_ratio(control, width, height, ctx),
        };
        let chosen = if heuristic.as_f64() < minimum.as_f64() {
            heuristic
        } else {
            minimum
        };
        debug!(
            "scaling {}x{} (max {}x{}): heuristic={}, minimum={}, chosen={}",
            width, height, max_width, max_height, heuristic, minimum, chosen
        );
        Ok(chosen)
    }

    /// Automatic mode: match the pixel rate to a target derived from q/s
    fn auto_ratio(
        &self,
        width: u32,
        height: u32,
        minimum: ScalingRatio,
        ctx: &ScalingContext,
    ) -> ScalingRatio {
        let video = ctx.video as u8 as f64;
        let q = ctx.quality as f64;
        let s = ctx.speed as f64;
        let no_scaling_quality = 65.0 + video * 30.0;
        if q >= no_scaling_quality || ctx.fps == 0 {
            return minimum;
        }

        let pps = ctx.fps as f64 * width as f64 * height as f64;
        let mut target = if ctx.bandwidth_limit > 0 {
            // video compresses to roughly 1/20th of the raw pixel data
            MIN_PPS_TARGET.max(ctx.bandwidth_limit as f64 / 8.0 * 20.0)
        } else {
            self.config.pps_target
        };
        if !ctx.video {
            target *= 2.0;
        }
        target *= (100.0 + (q - video * 30.0).max(0.0)).powi(2) / 200f64.powi(2);
        target *= 60f64.powi(2) / (s + 20.0).powi(2);

        let mut best = (f64::MAX, minimum);
        for ratio in std::iter::once(ScalingRatio::IDENTITY).chain(SCALING_LADDER) {
            let scaled = pps * ratio.as_f64().powi(2);
            let mut score = (1.0 - target / scaled).abs() * 100.0;
            if ratio == ctx.current {
                score /= EDGE_RESISTANCE;
            }
            if ratio.as_f64() > minimum.as_f64() {
                score *= 100.0;
            }
            if score < best.0 {
                best = (score, ratio);
            }
        }
        best.1
    }
}

/// Manual mode: `control` from 1 (gentle) to 100 (aggressive)
fn control_ratio(control: u8, width: u32, height: u32, ctx: &ScalingContext) -> ScalingRatio {
    let control = control as f64;
    let sc = if ctx.video {
        (control + 50.0) * 2.0
    } else {
        control + 25.0
    };
    let mut er = sc / 50.0;
    if !ctx.current.is_identity() {
        er += 0.5 * ctx.current.den as f64 / ctx.current.num as f64;
    }

    let q = ctx.quality as f64;
    let s = ctx.speed as f64;
    let fps = ctx.fps as f64;
    let fast_low_quality = s > q - er * 10.0 && q < 50.0 + er * 15.0;
    let busy = |floor: f64, base: f64, step: f64| {
        fast_low_quality || fps >= floor.max((base - er * step).round())
    };
    let pixels = width as f64 * height as f64;

    if ctx.fullscreen && busy(2.0, 10.0, 3.0) {
        ScalingRatio::of(1, 3)
    } else if ctx.maximized && busy(2.0, 10.0, 3.0) {
        ScalingRatio::of(1, 2)
    } else if pixels >= (2560.0 - er * 768.0) * 1600.0 && busy(4.0, 25.0, 5.0) {
        ScalingRatio::of(1, 3)
    } else if pixels >= (1920.0 - er * 384.0) * 1200.0 && busy(5.0, 30.0, 10.0) {
        ScalingRatio::of(2, 3)
    } else if pixels >= (1200.0 - er * 256.0) * 1024.0 && busy(10.0, 50.0, 15.0) {
        ScalingRatio::of(2, 3)
    } else {
        ScalingRatio::IDENTITY
    }
}

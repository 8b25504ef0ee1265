//! Candidate pipeline scoring
//!
//! Every (converter, encoder) path gets three sub-scores on a 0..=100
//! scale:
//!
//! | Score | Rewards |
//! |-------|---------|
//! | quality | declared quality close to the target, no chroma subsampling |
//! | speed | declared speed close to the target, and raw speed |
//! | edge resistance | reusing the codecs already running |
//!
//! The pipeline score is their mean, multiplied by the factory's runtime
//! factor, plus the encoding preference delta.

use serde::Serialize;

use super::spec::{subsampling_divs, ConverterSpec, EncoderSpec};

/// Switch score of a converter when none has to be created
const CONVERTER_REUSE_SCORE: f64 = 80.0;

/// Switch score of an encoder when none has to be created
const ENCODER_REUSE_SCORE: f64 = 100.0;

/// Quality and speed goals a pipeline is scored against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreTargets {
    /// Target quality
    pub quality: u8,
    /// Quality floor
    pub min_quality: u8,
    /// Target speed
    pub speed: u8,
    /// Speed floor
    pub min_speed: u8,
}

/// What is running right now, used to score switch costs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningStages {
    /// Converter: codec type, output format and input size
    pub converter: Option<(String, String, (u32, u32))>,
    /// Encoder: codec type, input format and size
    pub encoder: Option<(String, String, (u32, u32))>,
}

/// Individual scores of one candidate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Quality score
    pub quality: f64,
    /// Speed score
    pub speed: f64,
    /// Switch cost score
    pub edge_resistance: f64,
    /// Factory load multiplier
    pub runtime_factor: f64,
    /// Encoding preference and penalties
    pub score_delta: f64,
}

impl ScoreBreakdown {
    /// Combined score
    pub fn total(&self) -> f64 {
        (self.quality + self.speed + self.edge_resistance) / 3.0 * self.runtime_factor
            + self.score_delta
    }
}

fn clamp_score(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

/// Quality divisor of a planar format: 0.5 + Σ(dx·dy)/2
///
/// 2.0 for 4:4:4, larger for subsampled formats; packed formats are 2.0.
pub fn subsampling_divisor(format: &str) -> f64 {
    match subsampling_divs(format) {
        Some(divs) => 0.5 + divs.iter().map(|&(x, y)| (x * y) as f64).sum::<f64>() / 2.0,
        None => 2.0,
    }
}

/// Score how close the pipeline's output quality is to the target
pub fn quality_score(
    enc_in_format: &str,
    converter: Option<&ConverterSpec>,
    encoder: &EncoderSpec,
    targets: &ScoreTargets,
) -> f64 {
    let mut quality = clamp_score(encoder.quality as f64 * 2.0 / subsampling_divisor(enc_in_format));
    if let Some(csc) = converter {
        quality = (quality + csc.quality as f64) / 2.0;
    }
    let mut score = (100.0 - (targets.quality as f64 - quality).abs()).max(0.0);
    if targets.min_quality > 0 && quality < targets.min_quality as f64 {
        score *= quality / targets.min_quality as f64;
    }
    score
}

/// Score the pipeline's speed, always favoring faster pipelines
pub fn speed_score(
    converter: Option<&ConverterSpec>,
    encoder: &EncoderSpec,
    targets: &ScoreTargets,
) -> f64 {
    let mut speed = clamp_score(encoder.speed as f64);
    if let Some(csc) = converter {
        speed = (speed + csc.speed as f64) / 2.0;
    }
    let closeness = (100.0 - (targets.speed as f64 - speed).abs()).max(0.0);
    let mut score = (closeness + speed) / 2.0;
    if targets.min_speed > 0 && speed < targets.min_speed as f64 {
        score *= speed / targets.min_speed as f64;
    }
    score
}

/// Score the cost of switching from the running pipeline
pub fn edge_resistance_score(
    running: &RunningStages,
    converter: Option<&ConverterSpec>,
    csc_size: (u32, u32),
    enc_in_format: &str,
    encoder: &EncoderSpec,
    enc_size: (u32, u32),
) -> f64 {
    let csc_score = match converter {
        None => 100.0,
        Some(spec) => {
            let reused = running.converter.as_ref().is_some_and(|(codec, dst, size)| {
                codec == &spec.codec_type && dst == enc_in_format && *size == csc_size
            });
            if reused {
                CONVERTER_REUSE_SCORE
            } else {
                CONVERTER_REUSE_SCORE - spec.setup_cost as f64 * 0.8
            }
        }
    };
    let reused = running.encoder.as_ref().is_some_and(|(codec, src, size)| {
        codec == &encoder.codec_type && src == enc_in_format && *size == enc_size
    });
    let enc_score = if reused {
        ENCODER_REUSE_SCORE
    } else {
        ENCODER_REUSE_SCORE - encoder.setup_cost as f64 + encoder.score_boost as f64
    };
    (csc_score + enc_score) / 2.0
}

/// Preference bonus: earlier encodings in `order` score higher
pub fn encoding_score_delta(order: &[String], encoding: &str) -> f64 {
    match order.iter().position(|e| e == encoding) {
        Some(index) => (order.len() / 2) as f64 - index as f64,
        None => 0.0,
    }
}

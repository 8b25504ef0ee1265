//! Pipeline selection and setup
//!
//! For a frame of a given size and pixel format, enumerates every way the
//! registered codecs can produce the requested encoding, scores each path
//! and instantiates the best one that actually starts.
//!
//! # Paths
//!
//! ```text
//!   src_format ──────────────────────────> encoder   (direct)
//!   src_format ──> converter ──> format ──> encoder   (via colorspace conversion)
//! ```
//!
//! # Fallback Behavior
//!
//! Candidates are tried in score order. A candidate that fails to start,
//! whether transiently or not, is logged and released before the next one
//! is tried. If every candidate fails the caller gets
//! [`PipelineError::NoViablePipeline`] listing each failure.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::capabilities::ClientCapabilities;
use super::codec::{
    CodecFactory, CodecResult, ConverterHandle, ConverterRequest, EncoderHandle, EncoderRequest,
};
use super::error::{PipelineError, Result};
use super::scaling::{ScalingAdvisor, ScalingContext, ScalingRatio};
use super::scoring::{
    edge_resistance_score, encoding_score_delta, quality_score, speed_score, RunningStages,
    ScoreBreakdown, ScoreTargets,
};
use super::spec::{is_subsampled, CodecRegistry, ConverterSpec, EncoderSpec};
use crate::config::{PipelineConfig, ScalingConfig};

/// Penalty for lossy paths when lossless output was requested
const LOSSLESS_PENALTY: f64 = 250.0;

/// How the region being encoded relates to the window's video region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionHint {
    /// No video region, or the frame does not match it
    #[default]
    None,
    /// The frame is the video region but it is not confirmed as video yet
    NonVideo,
    /// The frame is a confirmed video region
    Video {
        /// Frame rate inside the region
        fps: u32,
    },
}

/// Window state relevant to scaling
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowHints {
    /// Fullscreen on the client
    pub fullscreen: bool,
    /// Maximized on the client
    pub maximized: bool,
    /// Whole-window frame rate
    pub fps: u32,
    /// Damage events seen so far
    pub damage_events: u64,
    /// Resized within the last half second
    pub resizing: bool,
    /// Bandwidth limit in bits/s, 0 when unknown
    pub bandwidth_limit: u64,
}

/// Targets a selection is made for
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PipelineTargets {
    /// Quality target
    pub quality: u8,
    /// Quality floor
    pub min_quality: u8,
    /// Speed target
    pub speed: u8,
    /// Speed floor
    pub min_speed: u8,
    /// Video region match
    pub region: RegionHint,
    /// Window state
    pub window: WindowHints,
}

/// Adjust the quality target for the kind of region being encoded
///
/// Confirmed video trades quality for frame rate; a region that has not
/// proved to be video gets a boost since it will be looked at closely.
pub fn shape_quality(quality: u8, min_quality: u8, region: RegionHint) -> u8 {
    if quality >= 100 {
        return quality;
    }
    match region {
        RegionHint::None => quality,
        RegionHint::Video { fps } => {
            let reduction = 90.min(fps.saturating_mul(2));
            let shaped = quality as u32 * (100 - reduction) / 100;
            (shaped as u8).max(min_quality)
        }
        RegionHint::NonVideo => ((quality as f64 / 100.0).sqrt() * 100.0) as u8,
    }
}

/// Converter stage of a candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConverterStage {
    /// Converter to instantiate
    pub spec: ConverterSpec,
    /// Masked input width
    pub width: u32,
    /// Masked input height
    pub height: u32,
}

/// One scored way of producing an encoding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineCandidate {
    /// Combined score
    pub score: f64,
    /// Sub-scores
    pub breakdown: ScoreBreakdown,
    /// Encoding produced
    pub encoding: String,
    /// Source pixel format
    pub src_format: String,
    /// Optional conversion step
    pub converter: Option<ConverterStage>,
    /// Format fed to the encoder
    pub enc_in_format: String,
    /// Encoder to instantiate
    pub encoder: EncoderSpec,
    /// Downscaling applied
    pub scaling: ScalingRatio,
    /// Encoder input width
    pub enc_width: u32,
    /// Encoder input height
    pub enc_height: u32,
}

impl PipelineCandidate {
    /// Short description, e.g. `swscale->x264 (YUV420P)`
    pub fn label(&self) -> String {
        match &self.converter {
            Some(stage) => format!(
                "{}->{} ({})",
                stage.spec.codec_type, self.encoder.codec_type, self.enc_in_format
            ),
            None => format!("{} ({})", self.encoder.codec_type, self.enc_in_format),
        }
    }

    fn masks(&self) -> (u32, u32) {
        let (cw, ch) = self
            .converter
            .as_ref()
            .map_or((u32::MAX, u32::MAX), |s| (s.spec.width_mask, s.spec.height_mask));
        (self.encoder.width_mask & cw, self.encoder.height_mask & ch)
    }
}

/// Size and quality settings for instantiating a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupParams {
    /// Source width
    pub width: u32,
    /// Source height
    pub height: u32,
    /// Encoder quality
    pub quality: u8,
    /// Encoder speed
    pub speed: u8,
    /// Lowest speed requested from a converter
    pub min_converter_speed: u8,
}

impl SetupParams {
    /// Converter speed: `max(1, min(speed, 100 - quality/2))`
    pub fn converter_speed(&self) -> u8 {
        self.speed
            .min(100u8.saturating_sub(self.quality / 2))
            .max(self.min_converter_speed.max(1))
    }
}

/// An instantiated pipeline
///
/// Dropping it cleans the encoder and converter.
#[derive(Debug)]
pub struct ActivePipeline {
    candidate: PipelineCandidate,
    width: u32,
    height: u32,
    converter: Option<ConverterHandle>,
    encoder: EncoderHandle,
}

impl ActivePipeline {
    /// The candidate this pipeline was built from
    pub fn candidate(&self) -> &PipelineCandidate {
        &self.candidate
    }

    /// Converter handle
    pub fn converter(&self) -> Option<&ConverterHandle> {
        self.converter.as_ref()
    }

    /// Encoder handle
    pub fn encoder(&self) -> &EncoderHandle {
        &self.encoder
    }

    /// Scaling ratio in use
    pub fn scaling(&self) -> ScalingRatio {
        self.candidate.scaling
    }

    fn info(&self) -> ActivePipelineInfo {
        ActivePipelineInfo {
            encoding: self.candidate.encoding.clone(),
            encoder: self.encoder.get().codec_type().to_string(),
            converter: self
                .converter
                .as_ref()
                .map(|c| c.get().codec_type().to_string()),
            enc_in_format: self.candidate.enc_in_format.clone(),
            width: self.width,
            height: self.height,
            enc_width: self.candidate.enc_width,
            enc_height: self.candidate.enc_height,
            scaling: self.candidate.scaling,
            score: self.candidate.score,
        }
    }
}

fn instantiate(
    candidate: &PipelineCandidate,
    factory: &dyn CodecFactory,
    params: &SetupParams,
) -> CodecResult<ActivePipeline> {
    let converter = match &candidate.converter {
        Some(stage) => {
            let request = ConverterRequest {
                src_format: candidate.src_format.clone(),
                src_width: stage.width,
                src_height: stage.height,
                dst_format: candidate.enc_in_format.clone(),
                dst_width: candidate.enc_width,
                dst_height: candidate.enc_height,
                speed: params.converter_speed(),
            };
            Some(ConverterHandle::new(
                factory.make_converter(&stage.spec, &request)?,
            ))
        }
        None => None,
    };

    // a failing encoder drops the converter handle created above
    let request = EncoderRequest {
        encoding: candidate.encoding.clone(),
        src_format: candidate.enc_in_format.clone(),
        width: candidate.enc_width,
        height: candidate.enc_height,
        quality: params.quality,
        speed: params.speed,
    };
    let encoder = EncoderHandle::new(factory.make_encoder(&candidate.encoder, &request)?);

    Ok(ActivePipeline {
        candidate: candidate.clone(),
        width: params.width,
        height: params.height,
        converter,
        encoder,
    })
}

/// Instantiate the first candidate that starts
///
/// # Errors
///
/// Returns `PipelineError::NoViablePipeline` if the list is empty or every
/// candidate fails.
pub fn setup_pipeline(
    candidates: &[PipelineCandidate],
    factory: &dyn CodecFactory,
    params: &SetupParams,
) -> Result<ActivePipeline> {
    let encoding = candidates
        .first()
        .map(|c| c.encoding.clone())
        .unwrap_or_default();
    let mut reasons = Vec::new();

    for candidate in candidates {
        match instantiate(candidate, factory, params) {
            Ok(pipeline) => {
                info!(
                    "Pipeline {} ready: {}x{} -> {}x{} ({}), score {:.1}",
                    candidate.label(),
                    params.width,
                    params.height,
                    candidate.enc_width,
                    candidate.enc_height,
                    candidate.scaling,
                    candidate.score
                );
                return Ok(pipeline);
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("Pipeline {} temporarily unavailable: {}", candidate.label(), e);
                } else {
                    warn!("Pipeline {} failed: {}", candidate.label(), e);
                }
                reasons.push(format!("{}: {}", candidate.label(), e));
            }
        }
    }

    if reasons.is_empty() {
        reasons.push("no candidates".to_string());
    }
    Err(PipelineError::NoViablePipeline { encoding, reasons })
}

/// Serializable view of the active pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePipelineInfo {
    /// Encoding produced
    pub encoding: String,
    /// Encoder codec type
    pub encoder: String,
    /// Converter codec type
    pub converter: Option<String>,
    /// Encoder input format
    pub enc_in_format: String,
    /// Source width
    pub width: u32,
    /// Source height
    pub height: u32,
    /// Encoder width
    pub enc_width: u32,
    /// Encoder height
    pub enc_height: u32,
    /// Scaling in use
    pub scaling: ScalingRatio,
    /// Score at selection time
    pub score: f64,
}

/// Serializable view of the selector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDiagnostics {
    /// Running pipeline
    pub active: Option<ActivePipelineInfo>,
    /// Candidates of the last evaluation, best first
    pub candidates: Vec<PipelineCandidate>,
    /// Paths rejected in the last evaluation
    pub exclusions: Vec<String>,
    /// Setup failures of the last attempt
    pub failures: Vec<String>,
    /// Cached selections
    pub cached: usize,
    /// Fixed scaling, if any
    pub fixed_scaling: Option<ScalingRatio>,
    /// Scaling control value
    pub scaling_control: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    encoding: String,
    width: u32,
    height: u32,
    src_format: String,
}

#[derive(Debug, Clone)]
struct CachedOptions {
    at: Instant,
    candidates: Vec<PipelineCandidate>,
}

/// Shared inputs of one evaluation
struct Evaluation<'a> {
    encoding: &'a str,
    width: u32,
    height: u32,
    src_format: &'a str,
    targets: ScoreTargets,
    scaling: ScalingContext,
    running: RunningStages,
    score_delta: f64,
}

/// Per-window pipeline selector
pub struct PipelineSelector {
    registry: Arc<CodecRegistry>,
    capabilities: ClientCapabilities,
    config: PipelineConfig,
    factory: Arc<dyn CodecFactory>,
    scaling: ScalingAdvisor,
    cache: HashMap<PipelineKey, CachedOptions>,
    active: Option<ActivePipeline>,
    last_candidates: Vec<PipelineCandidate>,
    last_exclusions: Vec<String>,
    last_failures: Vec<String>,
}

impl fmt::Debug for PipelineSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineSelector")
            .field("encoders", &self.registry.encoders.len())
            .field("converters", &self.registry.converters.len())
            .field("cached", &self.cache.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl PipelineSelector {
    /// Create a selector
    pub fn new(
        registry: Arc<CodecRegistry>,
        capabilities: ClientCapabilities,
        config: PipelineConfig,
        scaling: ScalingConfig,
        factory: Arc<dyn CodecFactory>,
    ) -> Self {
        Self {
            registry,
            capabilities,
            config,
            factory,
            scaling: ScalingAdvisor::new(scaling),
            cache: HashMap::new(),
            active: None,
            last_candidates: Vec::new(),
            last_exclusions: Vec::new(),
            last_failures: Vec::new(),
        }
    }

    /// Swap the codec snapshot; cached selections are dropped
    pub fn update_registry(&mut self, registry: Arc<CodecRegistry>) {
        debug!(
            "Codec registry updated: {} encoders, {} converters",
            registry.encoders.len(),
            registry.converters.len()
        );
        self.registry = registry;
        self.cache.clear();
    }

    /// Replace the client capabilities; cached selections are dropped
    pub fn set_capabilities(&mut self, capabilities: ClientCapabilities) {
        self.capabilities = capabilities;
        self.cache.clear();
    }

    /// Client capabilities
    pub fn capabilities(&self) -> &ClientCapabilities {
        &self.capabilities
    }

    /// Scaling advisor
    pub fn scaling(&self) -> &ScalingAdvisor {
        &self.scaling
    }

    /// Scaling advisor, for control changes; cached selections are dropped
    pub fn scaling_mut(&mut self) -> &mut ScalingAdvisor {
        self.cache.clear();
        &mut self.scaling
    }

    /// Running pipeline
    pub fn active(&self) -> Option<&ActivePipeline> {
        self.active.as_ref()
    }

    /// Ranked candidates for encoding a `width`x`height` `src_format` frame
    ///
    /// Results are reused for the same key until the cache TTL expires,
    /// even if the targets changed in between.
    pub fn options(
        &mut self,
        encoding: &str,
        width: u32,
        height: u32,
        src_format: &str,
        targets: &PipelineTargets,
        now: Instant,
    ) -> Vec<PipelineCandidate> {
        let key = PipelineKey {
            encoding: encoding.to_string(),
            width,
            height,
            src_format: src_format.to_string(),
        };
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);
        if let Some(cached) = self.cache.get(&key) {
            if now.saturating_duration_since(cached.at) < ttl {
                trace!("pipeline options for {:?} from cache", key);
                return cached.candidates.clone();
            }
        }

        let candidates = self.evaluate(encoding, width, height, src_format, targets);
        self.cache
            .retain(|_, c| now.saturating_duration_since(c.at) < ttl);
        self.cache.insert(
            key,
            CachedOptions {
                at: now,
                candidates: candidates.clone(),
            },
        );
        self.last_candidates = candidates.clone();
        candidates
    }

    fn running_stages(&self) -> RunningStages {
        let Some(active) = &self.active else {
            return RunningStages::default();
        };
        RunningStages {
            converter: active.converter.as_ref().map(|c| {
                let c = c.get();
                (c.codec_type().to_string(), c.dst_format().to_string(), c.src_size())
            }),
            encoder: {
                let e = active.encoder.get();
                Some((e.codec_type().to_string(), e.src_format().to_string(), e.size()))
            },
        }
    }

    fn evaluate(
        &mut self,
        encoding: &str,
        width: u32,
        height: u32,
        src_format: &str,
        targets: &PipelineTargets,
    ) -> Vec<PipelineCandidate> {
        let mut exclusions = Vec::new();
        if self.capabilities.accepted_colorspaces(encoding).is_empty() {
            debug!("client accepts no colorspace for {}", encoding);
            self.last_exclusions = vec![format!("client accepts no colorspace for {}", encoding)];
            return Vec::new();
        }

        let quality = shape_quality(targets.quality, targets.min_quality, targets.region);
        if quality != targets.quality {
            trace!(
                "quality target {} shaped to {} for {:?}",
                targets.quality,
                quality,
                targets.region
            );
        }
        let (fps, video) = match targets.region {
            RegionHint::Video { fps } => (fps, true),
            _ => (targets.window.fps, false),
        };
        let eval = Evaluation {
            encoding,
            width,
            height,
            src_format,
            targets: ScoreTargets {
                quality,
                min_quality: targets.min_quality,
                speed: targets.speed,
                min_speed: targets.min_speed,
            },
            scaling: ScalingContext {
                quality: targets.quality,
                speed: targets.speed,
                fps,
                video,
                fullscreen: targets.window.fullscreen,
                maximized: targets.window.maximized,
                current: self
                    .active
                    .as_ref()
                    .map_or(ScalingRatio::IDENTITY, ActivePipeline::scaling),
                client_scaling: self.capabilities.scaling,
                damage_events: targets.window.damage_events,
                resizing: targets.window.resizing,
                bandwidth_limit: targets.window.bandwidth_limit,
            },
            running: self.running_stages(),
            score_delta: encoding_score_delta(&self.config.preferred_encodings, encoding),
        };

        let registry = Arc::clone(&self.registry);
        let mut candidates = Vec::new();
        for encoder in registry.encoders_for(encoding) {
            let accepted = self.capabilities.accepted_colorspaces(encoding);
            if !encoder.output_colorspaces.iter().any(|c| accepted.contains(c)) {
                exclusions.push(format!(
                    "{}: output colorspaces {:?} not accepted by client",
                    encoder.codec_type, encoder.output_colorspaces
                ));
                continue;
            }

            let mut paths: Vec<(Option<&ConverterSpec>, &str)> = Vec::new();
            if encoder.accepts(src_format) {
                paths.push((None, src_format));
            }
            for csc in registry.converters_from(src_format) {
                for out in &csc.output_formats {
                    if encoder.accepts(out) {
                        paths.push((Some(csc), out.as_str()));
                    }
                }
            }

            for (csc, enc_in_format) in paths {
                match self.build_candidate(&eval, csc, enc_in_format, encoder) {
                    Ok(candidate) => candidates.push(candidate),
                    Err(reason) => exclusions.push(reason),
                }
            }
        }

        if candidates.is_empty() {
            debug!(
                "no {} pipeline for {}x{} {}: {:?}",
                encoding, width, height, src_format, exclusions
            );
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.last_exclusions = exclusions;
        candidates
    }

    fn build_candidate(
        &self,
        eval: &Evaluation<'_>,
        csc: Option<&ConverterSpec>,
        enc_in_format: &str,
        encoder: &EncoderSpec,
    ) -> std::result::Result<PipelineCandidate, String> {
        let label = match csc {
            Some(c) => format!("{}->{} ({})", c.codec_type, encoder.codec_type, enc_in_format),
            None => format!("{} ({})", encoder.codec_type, enc_in_format),
        };
        let (video_max_w, video_max_h) = self.capabilities.video_max_size;
        let max_w = encoder.max_width.min(video_max_w);
        let max_h = encoder.max_height.min(video_max_h);

        let can_scale = encoder.can_scale || csc.is_some_and(|c| c.can_scale);
        let scaling = if can_scale {
            self.scaling
                .scale(eval.width, eval.height, max_w, max_h, &eval.scaling)
                .map_err(|e| format!("{}: {}", label, e))?
        } else {
            ScalingRatio::IDENTITY
        };

        let width_mask = encoder.width_mask & csc.map_or(u32::MAX, |c| c.width_mask);
        let height_mask = encoder.height_mask & csc.map_or(u32::MAX, |c| c.height_mask);
        let csc_size = (eval.width & width_mask, eval.height & height_mask);
        let enc_width = scaling.apply(csc_size.0) & encoder.width_mask;
        let enc_height = scaling.apply(csc_size.1) & encoder.height_mask;

        if let Some(c) = csc {
            if !c.can_handle(csc_size.0, csc_size.1) {
                return Err(format!(
                    "{}: converter cannot handle {}x{}",
                    label, csc_size.0, csc_size.1
                ));
            }
        }
        if enc_width > max_w || enc_height > max_h {
            return Err(format!(
                "{}: {}x{} exceeds {}x{} and cannot be scaled",
                label, enc_width, enc_height, max_w, max_h
            ));
        }
        if !encoder.can_handle(enc_width, enc_height) {
            return Err(format!(
                "{}: {}x{} outside encoder limits",
                label, enc_width, enc_height
            ));
        }

        let mut score_delta = eval.score_delta;
        if (!scaling.is_identity() || is_subsampled(enc_in_format)) && eval.targets.quality >= 100 {
            score_delta -= LOSSLESS_PENALTY;
        }
        let runtime_factor = self.factory.runtime_factor(&encoder.codec_type)
            * csc.map_or(1.0, |c| self.factory.runtime_factor(&c.codec_type));

        let breakdown = ScoreBreakdown {
            quality: quality_score(enc_in_format, csc, encoder, &eval.targets),
            speed: speed_score(csc, encoder, &eval.targets),
            edge_resistance: edge_resistance_score(
                &eval.running,
                csc,
                csc_size,
                enc_in_format,
                encoder,
                (enc_width, enc_height),
            ),
            runtime_factor,
            score_delta,
        };
        trace!("{}: {:?}", label, breakdown);

        Ok(PipelineCandidate {
            score: breakdown.total(),
            breakdown,
            encoding: eval.encoding.to_string(),
            src_format: eval.src_format.to_string(),
            converter: csc.map(|c| ConverterStage {
                spec: c.clone(),
                width: csc_size.0,
                height: csc_size.1,
            }),
            enc_in_format: enc_in_format.to_string(),
            encoder: encoder.clone(),
            scaling,
            enc_width,
            enc_height,
        })
    }

    /// Replace the running pipeline with the first candidate that starts
    pub fn setup(
        &mut self,
        candidates: &[PipelineCandidate],
        params: &SetupParams,
    ) -> Result<&ActivePipeline> {
        self.clean();
        let factory = Arc::clone(&self.factory);
        match setup_pipeline(candidates, factory.as_ref(), params) {
            Ok(pipeline) => {
                self.last_failures.clear();
                Ok(self.active.insert(pipeline))
            }
            Err(e) => {
                if let PipelineError::NoViablePipeline { reasons, .. } = &e {
                    self.last_failures = reasons.clone();
                }
                Err(e)
            }
        }
    }

    /// True when the running pipeline can encode this input unchanged
    pub fn check_pipeline(&self, encoding: &str, width: u32, height: u32, src_format: &str) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        let candidate = &active.candidate;
        if candidate.encoding != encoding || candidate.src_format != src_format {
            debug!(
                "check_pipeline: {} {} no longer matches {} {}",
                candidate.encoding, candidate.src_format, encoding, src_format
            );
            return false;
        }
        let (wm, hm) = candidate.masks();
        if (width & wm, height & hm) != (active.width & wm, active.height & hm) {
            debug!(
                "check_pipeline: size changed from {}x{} to {}x{}",
                active.width, active.height, width, height
            );
            return false;
        }

        let encoder = active.encoder.get();
        if encoder.encoding() != encoding
            || encoder.size() != (candidate.enc_width, candidate.enc_height)
        {
            return false;
        }
        match &active.converter {
            Some(handle) => {
                let csc = handle.get();
                if csc.dst_format() != encoder.src_format() {
                    warn!(
                        "check_pipeline: intermediate format mismatch {} vs {}",
                        csc.dst_format(),
                        encoder.src_format()
                    );
                    return false;
                }
                csc.src_format() == src_format
            }
            None => encoder.src_format() == src_format,
        }
    }

    /// Tear down the running pipeline
    pub fn clean(&mut self) {
        if let Some(pipeline) = self.active.take() {
            debug!("Cleaning pipeline {}", pipeline.candidate.label());
        }
    }

    /// Diagnostics snapshot
    pub fn diagnostics(&self) -> PipelineDiagnostics {
        PipelineDiagnostics {
            active: self.active.as_ref().map(ActivePipeline::info),
            candidates: self.last_candidates.clone(),
            exclusions: self.last_exclusions.clone(),
            failures: self.last_failures.clone(),
            cached: self.cache.len(),
            fixed_scaling: self.scaling.fixed_scaling(),
            scaling_control: self.scaling.control(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::codec::testing::{FakeConverter, FakeEncoder, FakeFactory};
    use super::super::codec::{CodecError, ColorspaceConverter, VideoEncoder};
    use super::*;
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        Factory {}

        impl CodecFactory for Factory {
            fn make_converter(
                &self,
                spec: &ConverterSpec,
                request: &ConverterRequest,
            ) -> CodecResult<Box<dyn ColorspaceConverter>>;

            fn make_encoder(
                &self,
                spec: &EncoderSpec,
                request: &EncoderRequest,
            ) -> CodecResult<Box<dyn VideoEncoder>>;

            fn runtime_factor(&self, codec_type: &str) -> f64;
        }
    }

    const REGISTRY: &str = r#"
        [[encoders]]
        codec_type = "x264"
        encoding = "h264"
        input_formats = ["YUV420P", "YUV444P"]
        output_colorspaces = ["YUV420P", "YUV444P"]
        quality = 70
        speed = 40
        setup_cost = 30
        width_mask = 0xFFFE
        height_mask = 0xFFFE

        [[encoders]]
        codec_type = "nvenc"
        encoding = "h264"
        input_formats = ["NV12"]
        output_colorspaces = ["YUV420P"]
        quality = 50
        speed = 95
        setup_cost = 70
        width_mask = 0xFFF0
        height_mask = 0xFFFE

        [[encoders]]
        codec_type = "vpx"
        encoding = "vp9"
        input_formats = ["YUV420P"]
        output_colorspaces = ["YUV420P"]

        [[converters]]
        codec_type = "swscale"
        input_formats = ["BGRX"]
        output_formats = ["YUV420P", "YUV444P", "NV12"]
        quality = 90
        speed = 60
        max_width = 8192
        max_height = 8192
        can_scale = true
    "#;

    fn registry() -> Arc<CodecRegistry> {
        Arc::new(CodecRegistry::from_toml(REGISTRY).unwrap())
    }

    fn capabilities() -> ClientCapabilities {
        ClientCapabilities {
            scaling: true,
            ..Default::default()
        }
        .with_colorspaces("h264", ["YUV420P", "YUV444P"])
        .with_colorspaces("vp9", ["YUV420P"])
    }

    fn selector_with(factory: Arc<dyn CodecFactory>) -> PipelineSelector {
        PipelineSelector::new(
            registry(),
            capabilities(),
            PipelineConfig::default(),
            ScalingConfig::default(),
            factory,
        )
    }

    fn targets(quality: u8) -> PipelineTargets {
        PipelineTargets {
            quality,
            min_quality: 0,
            speed: 50,
            min_speed: 0,
            region: RegionHint::None,
            window: WindowHints::default(),
        }
    }

    fn params(width: u32, height: u32) -> SetupParams {
        SetupParams {
            width,
            height,
            quality: 50,
            speed: 50,
            min_converter_speed: 1,
        }
    }

    #[test]
    fn test_shape_quality() {
        assert_eq!(shape_quality(80, 0, RegionHint::None), 80);
        assert_eq!(shape_quality(80, 0, RegionHint::Video { fps: 10 }), 64);
        // reduction capped at 90%, then floored
        assert_eq!(shape_quality(80, 30, RegionHint::Video { fps: 100 }), 30);
        assert_eq!(shape_quality(25, 0, RegionHint::NonVideo), 50);
        assert_eq!(shape_quality(100, 0, RegionHint::Video { fps: 30 }), 100);
    }

    #[test]
    fn test_converter_speed() {
        assert_eq!(params(10, 10).converter_speed(), 50);
        let p = SetupParams {
            quality: 100,
            speed: 90,
            ..params(10, 10)
        };
        assert_eq!(p.converter_speed(), 50);
        let p = SetupParams {
            speed: 0,
            ..params(10, 10)
        };
        assert_eq!(p.converter_speed(), 1);
    }

    #[test]
    fn test_options_ranked_and_masked() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        let candidates =
            selector.options("h264", 1001, 601, "BGRX", &targets(50), Instant::now());

        // BGRX is not an encoder input: every path goes through swscale
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.converter.is_some()));
        assert!(candidates.windows(2).all(|w| w[0].score >= w[1].score));

        let nvenc = candidates
            .iter()
            .find(|c| c.encoder.codec_type == "nvenc")
            .unwrap();
        assert_eq!(nvenc.enc_in_format, "NV12");
        assert_eq!((nvenc.enc_width, nvenc.enc_height), (992, 600));
    }

    #[test]
    fn test_cache_determinism() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        let now = Instant::now();
        let first = selector.options("h264", 800, 600, "BGRX", &targets(90), now);
        let cached = selector.options(
            "h264",
            800,
            600,
            "BGRX",
            &targets(10),
            now + Duration::from_millis(500),
        );
        assert_eq!(first, cached);

        let fresh = selector.options(
            "h264",
            800,
            600,
            "BGRX",
            &targets(10),
            now + Duration::from_millis(1500),
        );
        assert_ne!(first, fresh);
    }

    #[test]
    fn test_client_colorspaces_exclude_encoder() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        selector.set_capabilities(ClientCapabilities::default().with_colorspaces("h264", ["YUV444P"]));
        let candidates = selector.options("h264", 800, 600, "BGRX", &targets(50), Instant::now());

        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.encoder.codec_type == "x264"));
        assert!(selector
            .diagnostics()
            .exclusions
            .iter()
            .any(|e| e.starts_with("nvenc")));
    }

    #[test]
    fn test_no_capabilities_no_candidates() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        selector.set_capabilities(ClientCapabilities::default());
        let candidates = selector.options("h264", 800, 600, "BGRX", &targets(50), Instant::now());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_unscalable_oversize_excluded() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        selector.set_capabilities(
            ClientCapabilities {
                scaling: false,
                ..Default::default()
            }
            .with_colorspaces("h264", ["YUV420P", "YUV444P"]),
        );
        let candidates = selector.options("h264", 5000, 600, "BGRX", &targets(50), Instant::now());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_oversize_scaled_to_fit() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        let candidates = selector.options("h264", 6000, 3000, "BGRX", &targets(50), Instant::now());
        assert!(!candidates.is_empty());
        for c in &candidates {
            assert!(c.enc_width <= c.encoder.max_width);
            assert!(!c.scaling.is_identity());
        }
    }

    #[test]
    fn test_lossless_penalizes_subsampling() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        let candidates = selector.options("h264", 800, 600, "BGRX", &targets(100), Instant::now());
        assert_eq!(candidates[0].enc_in_format, "YUV444P");
    }

    #[test]
    fn test_update_registry_clears_cache() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        let now = Instant::now();
        assert_eq!(selector.options("h264", 800, 600, "BGRX", &targets(50), now).len(), 3);

        let mut smaller = (*registry()).clone();
        smaller.encoders.retain(|e| e.codec_type != "nvenc");
        selector.update_registry(Arc::new(smaller));
        assert_eq!(selector.options("h264", 800, 600, "BGRX", &targets(50), now).len(), 2);
    }

    #[test]
    fn test_setup_falls_back_on_failure() {
        let ranked = selector_with(Arc::new(FakeFactory::default()))
            .options("h264", 800, 600, "BGRX", &targets(50), Instant::now());
        let failing = ranked[0].encoder.codec_type.clone();
        let expected_failures = ranked
            .iter()
            .take_while(|c| c.encoder.codec_type == failing)
            .count();

        let cleaned = Arc::new(AtomicUsize::new(0));
        let mut factory = MockFactory::new();
        factory.expect_runtime_factor().return_const(1.0);
        let counter = cleaned.clone();
        factory.expect_make_converter().returning(move |_, request| {
            Ok(Box::new(FakeConverter {
                request: request.clone(),
                cleaned: counter.clone(),
            }) as Box<dyn ColorspaceConverter>)
        });
        let bad = failing.clone();
        factory
            .expect_make_encoder()
            .withf(move |spec, _| spec.codec_type == bad)
            .times(expected_failures)
            .returning(|spec, _| Err(CodecError::Transient(format!("{} busy", spec.codec_type))));
        let good = failing.clone();
        let counter = cleaned.clone();
        factory
            .expect_make_encoder()
            .withf(move |spec, _| spec.codec_type != good)
            .times(1)
            .returning(move |spec, request| {
                Ok(Box::new(FakeEncoder {
                    codec_type: spec.codec_type.clone(),
                    request: request.clone(),
                    cleaned: counter.clone(),
                }) as Box<dyn VideoEncoder>)
            });

        let mut selector = selector_with(Arc::new(factory));
        let candidates = selector.options("h264", 800, 600, "BGRX", &targets(50), Instant::now());
        let active = selector.setup(&candidates, &params(800, 600)).unwrap();
        assert_ne!(active.encoder().get().codec_type(), failing);

        // converters of failed candidates were released
        assert_eq!(cleaned.load(Ordering::SeqCst), expected_failures);

        selector.clean();
        assert_eq!(cleaned.load(Ordering::SeqCst), expected_failures + 2);
        assert!(selector.active().is_none());
    }

    #[test]
    fn test_setup_exhausted() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let mut factory = MockFactory::new();
        factory.expect_runtime_factor().return_const(1.0);
        let counter = cleaned.clone();
        factory.expect_make_converter().returning(move |_, request| {
            Ok(Box::new(FakeConverter {
                request: request.clone(),
                cleaned: counter.clone(),
            }) as Box<dyn ColorspaceConverter>)
        });
        factory
            .expect_make_encoder()
            .returning(|_, _| Err(CodecError::Failed("no device".into())));

        let mut selector = selector_with(Arc::new(factory));
        let candidates = selector.options("h264", 800, 600, "BGRX", &targets(50), Instant::now());
        let err = selector.setup(&candidates, &params(800, 600)).unwrap_err();

        match err {
            PipelineError::NoViablePipeline { encoding, reasons } => {
                assert_eq!(encoding, "h264");
                assert_eq!(reasons.len(), candidates.len());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cleaned.load(Ordering::SeqCst), candidates.len());
        assert_eq!(selector.diagnostics().failures.len(), candidates.len());
    }

    #[test]
    fn test_setup_empty() {
        let factory = FakeFactory::default();
        let err = setup_pipeline(&[], &factory, &params(10, 10)).unwrap_err();
        assert!(matches!(err, PipelineError::NoViablePipeline { .. }));
    }

    #[test]
    fn test_check_pipeline() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        assert!(!selector.check_pipeline("h264", 800, 600, "BGRX"));

        let candidates = selector.options("h264", 800, 600, "BGRX", &targets(50), Instant::now());
        selector.setup(&candidates, &params(800, 600)).unwrap();
        assert!(selector.check_pipeline("h264", 800, 600, "BGRX"));
        // odd width masked away by every encoder in the registry
        assert!(selector.check_pipeline("h264", 801, 600, "BGRX"));
        assert!(!selector.check_pipeline("h264", 1024, 768, "BGRX"));
        assert!(!selector.check_pipeline("vp9", 800, 600, "BGRX"));
        assert!(!selector.check_pipeline("h264", 800, 600, "BGRA"));

        selector.clean();
        assert!(!selector.check_pipeline("h264", 800, 600, "BGRX"));
    }

    #[test]
    fn test_edge_resistance_prefers_running_pipeline() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        let now = Instant::now();
        let candidates = selector.options("h264", 800, 600, "BGRX", &targets(50), now);
        selector.setup(&candidates, &params(800, 600)).unwrap();
        let running = candidates[0].label();

        let later = now + Duration::from_secs(2);
        let again = selector.options("h264", 800, 600, "BGRX", &targets(50), later);
        assert_eq!(again[0].label(), running);
        assert!(again[0].breakdown.edge_resistance >= candidates[0].breakdown.edge_resistance);
    }

    #[test]
    fn test_diagnostics_serialize() {
        let mut selector = selector_with(Arc::new(FakeFactory::default()));
        let candidates = selector.options("h264", 800, 600, "BGRX", &targets(50), Instant::now());
        selector.setup(&candidates, &params(800, 600)).unwrap();
        let json = serde_json::to_value(selector.diagnostics()).unwrap();
        assert_eq!(json["active"]["encoding"], "h264");
        assert_eq!(json["candidates"].as_array().unwrap().len(), 3);
    }
}

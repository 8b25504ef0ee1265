//! Per-window encode context
//!
//! Owns every piece of per-window state and drives the recalculation tick:
//!
//! ```text
//! damage ──> WindowStats ──┐
//!                          ├─ update() every recalculate_interval
//! GlobalStats ─────────────┘      ├─> BatchController::recompute  (delay)
//!                                 ├─> target_speed / target_quality
//!                                 └─> VideoRegionDetector::identify
//!
//! encode_options() ──> PipelineSelector::options ──> setup_pipeline()
//! ```
//!
//! Nothing here is shared: one context per window, driven by one task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::damage::{GeometryError, Rectangle};
use crate::performance::{
    self, target_quality, target_speed, BatchController, BatchDiagnostics, BatchInputs,
    BatchState, QualityTarget, SpeedTarget, TargetContext, TargetSettings,
};
use crate::pipeline::{
    self, ActivePipeline, ClientCapabilities, CodecFactory, CodecRegistry, PipelineCandidate,
    PipelineDiagnostics, PipelineError, PipelineSelector, PipelineTargets, RegionHint,
    ScalingRatio, SetupParams, WindowHints,
};
use crate::stats::{EncodingSample, GlobalStats, WindowStats, WindowStatsInfo};
use crate::video::{
    RefreshRequest, RegionDiagnostics, RegionState, SubregionRefresh, VideoRegionDetector,
};

/// Damage events kept per window
pub const DAMAGE_HISTORY: usize = 150;

/// A resize this recent counts as "resizing"
const RESIZE_WINDOW: Duration = Duration::from_millis(500);

/// Targets before the first recalculation
const INITIAL_TARGET: u8 = 50;

/// Serializable snapshot of one window
#[derive(Debug, Clone, Serialize)]
pub struct WindowDiagnostics {
    /// Window id
    pub window_id: u32,
    /// Window width
    pub width: u32,
    /// Window height
    pub height: u32,
    /// Batch delay and factor breakdown
    pub batch: BatchDiagnostics,
    /// Last automatic speed target
    pub speed_target: Option<SpeedTarget>,
    /// Last automatic quality target
    pub quality_target: Option<QualityTarget>,
    /// Speed in use
    pub speed: u8,
    /// Quality in use
    pub quality: u8,
    /// Manual overrides
    pub settings: TargetSettings,
    /// Window statistics
    pub stats: WindowStatsInfo,
    /// Video region
    pub video_region: RegionDiagnostics,
    /// Pipeline selection
    pub pipeline: PipelineDiagnostics,
}

/// Per-window encode state
#[derive(Debug)]
pub struct WindowEncodeContext {
    window_id: u32,
    width: u32,
    height: u32,
    stats: WindowStats,
    controller: BatchController,
    batch: BatchState,
    settings: TargetSettings,
    inputs: BatchInputs,
    fullscreen: bool,
    maximized: bool,
    detector: VideoRegionDetector,
    selector: PipelineSelector,
    min_converter_speed: u8,
    recalculate_interval: Duration,
    last_update: Option<Instant>,
    speed_target: Option<SpeedTarget>,
    quality_target: Option<QualityTarget>,
    speed: u8,
    quality: u8,
}

impl WindowEncodeContext {
    /// Create the context for a new window
    ///
    /// Optimizations the client cannot use are disabled up front: no
    /// subregion support turns off region detection, no batching pins the
    /// delay at zero.
    pub fn new(
        window_id: u32,
        width: u32,
        height: u32,
        config: &Config,
        registry: Arc<CodecRegistry>,
        capabilities: ClientCapabilities,
        factory: Arc<dyn CodecFactory>,
    ) -> Self {
        let controller = BatchController::new(config.batch.clone());
        let mut batch = controller.new_state();
        if !capabilities.batching {
            if let Err(e) = batch.lock(0.0) {
                warn!("window {}: cannot disable batching: {}", window_id, e);
            }
        }

        let mut detector = VideoRegionDetector::new(config.video_region.clone());
        if !capabilities.subregion {
            debug!("window {}: client has no subregion support", window_id);
            detector.set_enabled(false);
        }

        // floors come from the client and are clamped to 0..=100
        let settings = TargetSettings::with_floors(
            capabilities.min_quality.min(100),
            capabilities.min_speed.min(100),
        )
        .unwrap_or_default();

        let selector = PipelineSelector::new(
            registry,
            capabilities,
            config.pipeline.clone(),
            config.scaling.clone(),
            factory,
        );

        Self {
            window_id,
            width,
            height,
            stats: WindowStats::new(DAMAGE_HISTORY),
            controller,
            batch,
            settings,
            inputs: BatchInputs {
                window_id,
                width,
                height,
                ..Default::default()
            },
            fullscreen: false,
            maximized: false,
            detector,
            selector,
            min_converter_speed: config.pipeline.min_converter_speed,
            recalculate_interval: Duration::from_millis(config.batch.recalculate_interval_ms),
            last_update: None,
            speed_target: None,
            quality_target: None,
            speed: INITIAL_TARGET,
            quality: INITIAL_TARGET,
        }
    }

    /// Post due video refreshes on `tx`
    pub fn attach_refresh_channel(&mut self, tx: UnboundedSender<RefreshRequest>) {
        self.detector.attach_refresh_channel(self.window_id, tx);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Window id
    pub fn window_id(&self) -> u32 {
        self.window_id
    }

    /// Window size
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Current batch delay (ms)
    pub fn batch_delay(&self) -> f64 {
        self.batch.delay()
    }

    /// Quality in use
    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Speed in use
    pub fn speed(&self) -> u8 {
        self.speed
    }

    /// Window statistics
    pub fn stats(&self) -> &WindowStats {
        &self.stats
    }

    /// Video region detector
    pub fn detector(&self) -> &VideoRegionDetector {
        &self.detector
    }

    /// Video region detector, for its control surface
    pub fn detector_mut(&mut self) -> &mut VideoRegionDetector {
        &mut self.detector
    }

    /// Pipeline selector
    pub fn selector(&self) -> &PipelineSelector {
        &self.selector
    }

    /// Pipeline selector, for registry and capability updates
    pub fn selector_mut(&mut self) -> &mut PipelineSelector {
        &mut self.selector
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Record a damaged rectangle, clipped to the window
    pub fn record_damage(&mut self, rect: Rectangle, now: Instant) {
        match rect.clip_to(self.width, self.height) {
            Some(clipped) => self.stats.record_damage(clipped, now),
            None => debug!(
                "window {}: damage {} outside {}x{}",
                self.window_id, rect, self.width, self.height
            ),
        }
    }

    /// The window changed size
    pub fn resize(&mut self, width: u32, height: u32, now: Instant) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        debug!(
            "window {} resized {}x{} -> {}x{}",
            self.window_id, self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        self.inputs.width = width;
        self.inputs.height = height;
        self.stats.record_resize(now);
    }

    /// A frame was encoded
    ///
    /// Lossy frames inside the video region are queued for a delayed
    /// refresh; lossless ones cancel refreshes they cover.
    pub fn record_encode(&mut self, rect: Rectangle, quality: u8, sample: EncodingSample) {
        self.stats.record_encoding(sample);
        if self.detector.rectangle().is_none() {
            return;
        }
        if quality >= 100 {
            self.detector.remove_refresh_region(&rect);
        } else {
            self.detector.add_video_refresh(rect);
        }
    }

    /// A frame was handed to the transport
    pub fn record_frame_sent(&mut self, sequence: u64, pixels: u64, bytes: u64, now: Instant) {
        self.stats.record_frame_sent(sequence, pixels, bytes, now);
    }

    /// The client acknowledged a frame
    ///
    /// Feeds the round-trip latency and decode time to both the window and
    /// the connection statistics. Returns false for unknown frames.
    pub fn record_client_ack(
        &mut self,
        sequence: u64,
        decode_secs: f64,
        global: &GlobalStats,
        now: Instant,
    ) -> bool {
        match self.stats.record_client_ack(sequence, decode_secs, now) {
            Some((pixels, latency)) => {
                global.record_client_latency(self.window_id, pixels, latency, now);
                if decode_secs > 0.0 {
                    global.record_decode_time(pixels, decode_secs, now);
                }
                true
            }
            None => {
                debug!("window {}: ack for unknown frame {}", self.window_id, sequence);
                false
            }
        }
    }

    /// Queued refreshes, once the refresh timer fired
    pub fn take_refresh(&mut self) -> Option<SubregionRefresh> {
        self.detector.take_refresh()
    }

    // =========================================================================
    // Recalculation
    // =========================================================================

    /// Recompute delay, targets and video region
    ///
    /// Calls closer together than the recalculation interval are ignored.
    /// Returns true when a recalculation ran.
    pub fn update(&mut self, global: &GlobalStats, now: Instant) -> bool {
        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) < self.recalculate_interval {
                return false;
            }
        }
        self.last_update = Some(now);

        self.controller
            .recompute(&mut self.batch, &self.inputs, global, &mut self.stats, now);

        let averages = global.averages();
        let ctx = TargetContext {
            width: self.width,
            height: self.height,
            window: &self.stats,
            global: &averages,
            batch: &self.batch,
            settings: &self.settings,
            current_speed: self.speed as f64,
            bandwidth_limit: self.inputs.bandwidth_limit,
            now,
        };
        let speed = target_speed(&ctx);
        let quality = target_quality(&ctx);
        self.speed = self.settings.fixed_speed().unwrap_or(speed.speed.round() as u8);
        self.quality = self
            .settings
            .fixed_quality()
            .unwrap_or(quality.quality.round() as u8);
        let caps = self.selector.capabilities();
        self.speed = caps.clamp_speed(self.speed);
        self.quality = caps.clamp_quality(self.quality);
        self.speed_target = Some(speed);
        self.quality_target = Some(quality);

        let changed = self.detector.identify(
            self.width,
            self.height,
            self.stats.damage_events_count(),
            self.stats.damage().iter(),
            now,
        );
        if changed {
            match self.detector.rectangle() {
                Some(rect) => info!("window {}: video region {}", self.window_id, rect),
                None => info!("window {}: video region cleared", self.window_id),
            }
        }

        debug!(
            "window {}: delay={:.1}ms speed={} quality={}",
            self.window_id,
            self.batch.delay(),
            self.speed,
            self.quality
        );
        true
    }

    fn region_hint(&self, rect: &Rectangle) -> RegionHint {
        if self.detector.rectangle() != Some(*rect) {
            return RegionHint::None;
        }
        match (self.detector.state(), self.detector.fps()) {
            (RegionState::Active, fps) if fps > 0 => RegionHint::Video { fps },
            _ => RegionHint::NonVideo,
        }
    }

    fn pipeline_targets(&self, rect: &Rectangle, now: Instant) -> PipelineTargets {
        let resizing = self
            .stats
            .last_resized()
            .is_some_and(|at| now.saturating_duration_since(at) < RESIZE_WINDOW);
        PipelineTargets {
            quality: self.quality,
            min_quality: self.settings.min_quality(),
            speed: self.speed,
            min_speed: self.settings.min_speed(),
            region: self.region_hint(rect),
            window: WindowHints {
                fullscreen: self.fullscreen,
                maximized: self.maximized,
                fps: self.detector.fps(),
                damage_events: self.stats.damage_events_count(),
                resizing,
                bandwidth_limit: self.inputs.bandwidth_limit,
            },
        }
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    /// Ranked pipelines for encoding `rect` of this window
    pub fn encode_options(
        &mut self,
        encoding: &str,
        src_format: &str,
        rect: Rectangle,
        now: Instant,
    ) -> Vec<PipelineCandidate> {
        let targets = self.pipeline_targets(&rect, now);
        self.selector
            .options(encoding, rect.width, rect.height, src_format, &targets, now)
    }

    /// Instantiate the first candidate that starts
    pub fn setup_pipeline(
        &mut self,
        candidates: &[PipelineCandidate],
        width: u32,
        height: u32,
    ) -> pipeline::Result<&ActivePipeline> {
        let params = SetupParams {
            width,
            height,
            quality: self.quality,
            speed: self.speed,
            min_converter_speed: self.min_converter_speed,
        };
        self.selector.setup(candidates, &params)
    }

    /// Reuse the running pipeline for `rect` or set up a new one
    pub fn ensure_pipeline(
        &mut self,
        encoding: &str,
        src_format: &str,
        rect: Rectangle,
        now: Instant,
    ) -> pipeline::Result<&ActivePipeline> {
        if !self
            .selector
            .check_pipeline(encoding, rect.width, rect.height, src_format)
        {
            let candidates = self.encode_options(encoding, src_format, rect, now);
            self.setup_pipeline(&candidates, rect.width, rect.height)?;
        }
        self.selector
            .active()
            .ok_or_else(|| PipelineError::NoViablePipeline {
                encoding: encoding.to_string(),
                reasons: vec!["pipeline torn down".to_string()],
            })
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    /// Fix the quality, or `None` for automatic
    pub fn set_quality(&mut self, quality: Option<u8>) -> performance::Result<()> {
        self.settings.set_quality(quality)?;
        if let Some(q) = quality {
            self.quality = q;
        }
        Ok(())
    }

    /// Quality floor
    pub fn set_min_quality(&mut self, min_quality: u8) -> performance::Result<()> {
        self.settings.set_min_quality(min_quality)
    }

    /// Fix the speed, or `None` for automatic
    pub fn set_speed(&mut self, speed: Option<u8>) -> performance::Result<()> {
        self.settings.set_speed(speed)?;
        if let Some(s) = speed {
            self.speed = s;
        }
        Ok(())
    }

    /// Speed floor
    pub fn set_min_speed(&mut self, min_speed: u8) -> performance::Result<()> {
        self.settings.set_min_speed(min_speed)
    }

    /// Pin the batch delay (ms)
    pub fn lock_batch_delay(&mut self, delay: f64) -> performance::Result<()> {
        self.batch.lock(delay)
    }

    /// Resume automatic batch delay control
    pub fn unlock_batch_delay(&mut self) {
        self.batch.unlock();
    }

    /// Keyboard focus changed
    pub fn set_focus(&mut self, focused: bool) {
        self.inputs.has_focus = focused;
    }

    /// Window is an override-redirect
    pub fn set_override_redirect(&mut self, override_redirect: bool) {
        self.inputs.override_redirect = override_redirect;
    }

    /// This window's own fullscreen and maximized state
    pub fn set_window_state(&mut self, fullscreen: bool, maximized: bool) {
        self.fullscreen = fullscreen;
        self.maximized = maximized;
    }

    /// Another window went fullscreen or maximized
    pub fn set_peer_state(&mut self, fullscreen: bool, maximized: bool) {
        self.inputs.peer_fullscreen = fullscreen;
        self.inputs.peer_maximized = maximized;
    }

    /// Soft refreshes that expired unsent
    pub fn set_soft_expired(&mut self, count: u32) {
        self.inputs.soft_expired = count;
    }

    /// Bandwidth cap in bits/s, 0 for none
    pub fn set_bandwidth_limit(&mut self, limit: u64) {
        self.inputs.bandwidth_limit = limit;
    }

    /// Frames travel through a zero-copy transport
    pub fn set_zero_copy(&mut self, zero_copy: bool) {
        self.inputs.zero_copy = zero_copy;
    }

    /// Fixed scaling, or `None` for automatic
    pub fn set_scaling(&mut self, ratio: Option<ScalingRatio>) -> pipeline::Result<()> {
        self.selector.scaling_mut().set_scaling(ratio)
    }

    /// Scaling aggressiveness 0..=100, or `None` for automatic
    pub fn set_scaling_control(&mut self, control: Option<u8>) -> performance::Result<()> {
        self.selector.scaling_mut().set_control(control)
    }

    /// Manual video region; disables detection
    pub fn set_video_region(&mut self, region: Option<Rectangle>) -> Result<(), GeometryError> {
        self.detector.set_region(region)
    }

    /// Areas where damage suspends detection
    pub fn set_exclusion_zones(&mut self, zones: Vec<Rectangle>) {
        self.detector.set_exclusion_zones(zones);
    }

    /// Tear down the pipeline and cancel pending refreshes
    pub fn clean(&mut self) {
        self.selector.clean();
        self.detector.cancel_refresh();
    }

    /// Diagnostics snapshot
    pub fn diagnostics(&self) -> WindowDiagnostics {
        WindowDiagnostics {
            window_id: self.window_id,
            width: self.width,
            height: self.height,
            batch: self.batch.diagnostics(),
            speed_target: self.speed_target,
            quality_target: self.quality_target,
            speed: self.speed,
            quality: self.quality,
            settings: self.settings,
            stats: self.stats.info(),
            video_region: self.detector.diagnostics(),
            pipeline: self.selector.diagnostics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::FakeFactory;

    const REGISTRY: &str = r#"
        [[encoders]]
        codec_type = "x264"
        encoding = "h264"
        input_formats = ["YUV420P"]
        output_colorspaces = ["YUV420P"]
        width_mask = 0xFFFE
        height_mask = 0xFFFE

        [[converters]]
        codec_type = "swscale"
        input_formats = ["BGRX"]
        output_formats = ["YUV420P"]
        can_scale = true
    "#;

    fn capabilities() -> ClientCapabilities {
        ClientCapabilities {
            scaling: true,
            subregion: true,
            batching: true,
            ..Default::default()
        }
        .with_colorspaces("h264", ["YUV420P"])
    }

    fn context(capabilities: ClientCapabilities) -> WindowEncodeContext {
        WindowEncodeContext::new(
            1,
            1024,
            768,
            &Config::default(),
            Arc::new(CodecRegistry::from_toml(REGISTRY).unwrap()),
            capabilities,
            Arc::new(FakeFactory::default()),
        )
    }

    fn feed(ctx: &mut WindowEncodeContext, rect: Rectangle, count: u32, start: Instant) -> Instant {
        let mut now = start;
        for i in 0..count {
            now = start + Duration::from_millis(20 * i as u64);
            ctx.record_damage(rect, now);
        }
        now
    }

    #[test]
    fn test_update_debounced() {
        let mut ctx = context(capabilities());
        let global = GlobalStats::new();
        let now = Instant::now();
        assert!(ctx.update(&global, now));
        assert!(!ctx.update(&global, now + Duration::from_millis(100)));
        assert!(ctx.update(&global, now + Duration::from_millis(300)));
    }

    #[test]
    fn test_update_finds_video_region() {
        let mut ctx = context(capabilities());
        let global = GlobalStats::new();
        let rect = Rectangle::new(100, 100, 320, 240);
        let now = feed(&mut ctx, rect, 50, Instant::now());

        assert!(ctx.update(&global, now));
        assert_eq!(ctx.detector().rectangle(), Some(rect));
        assert!(ctx.speed() <= 100);
        assert!(ctx.quality() <= 100);
    }

    #[test]
    fn test_full_window_damage_no_region() {
        let mut ctx = context(capabilities());
        let global = GlobalStats::new();
        let now = feed(&mut ctx, Rectangle::new(0, 0, 1024, 768), 50, Instant::now());
        ctx.update(&global, now);
        assert_eq!(ctx.detector().rectangle(), None);
    }

    #[test]
    fn test_no_subregion_support() {
        let mut ctx = context(ClientCapabilities {
            subregion: false,
            ..capabilities()
        });
        let global = GlobalStats::new();
        let now = feed(&mut ctx, Rectangle::new(100, 100, 320, 240), 50, Instant::now());
        ctx.update(&global, now);
        assert_eq!(ctx.detector().rectangle(), None);
    }

    #[test]
    fn test_no_batching_pins_delay() {
        let mut ctx = context(ClientCapabilities {
            batching: false,
            ..capabilities()
        });
        let global = GlobalStats::new();
        ctx.update(&global, Instant::now());
        assert_eq!(ctx.batch_delay(), 0.0);
    }

    #[test]
    fn test_damage_clipped() {
        let mut ctx = context(capabilities());
        let now = Instant::now();
        ctx.record_damage(Rectangle::new(1000, 700, 100, 100), now);
        ctx.record_damage(Rectangle::new(2000, 2000, 10, 10), now);
        assert_eq!(ctx.stats().damage_events_count(), 1);
        let last = ctx.stats().damage().last().unwrap();
        assert_eq!(last.rect, Rectangle::new(1000, 700, 24, 68));
    }

    #[test]
    fn test_fixed_targets_override() {
        let mut ctx = context(capabilities());
        let global = GlobalStats::new();
        ctx.set_quality(Some(90)).unwrap();
        ctx.set_speed(Some(20)).unwrap();
        ctx.update(&global, Instant::now());
        assert_eq!(ctx.quality(), 90);
        assert_eq!(ctx.speed(), 20);
        assert!(ctx.set_quality(Some(101)).is_err());
    }

    #[test]
    fn test_ensure_pipeline_reuses() {
        let mut ctx = context(capabilities());
        let now = Instant::now();
        let rect = Rectangle::new(0, 0, 1024, 768);
        let first = ctx.ensure_pipeline("h264", "BGRX", rect, now).unwrap().candidate().clone();
        assert_eq!(first.encoder.codec_type, "x264");
        let again = ctx
            .ensure_pipeline("h264", "BGRX", rect, now + Duration::from_millis(10))
            .unwrap();
        assert_eq!(again.candidate(), &first);
    }

    #[test]
    fn test_fixed_scaling_is_validated() {
        let mut ctx = context(capabilities());
        let half = ScalingRatio::new(1, 2).unwrap();
        ctx.set_scaling(Some(half)).unwrap();
        assert_eq!(ctx.diagnostics().pipeline.fixed_scaling, Some(half));

        let upscale: Result<ScalingRatio, _> = serde_json::from_str(r#"{"num":3,"den":2}"#);
        assert!(upscale.is_err());
        ctx.set_scaling(None).unwrap();
        assert_eq!(ctx.diagnostics().pipeline.fixed_scaling, None);
    }

    #[test]
    fn test_ensure_pipeline_unsupported_encoding() {
        let mut ctx = context(capabilities());
        let err = ctx
            .ensure_pipeline("vp9", "BGRX", Rectangle::new(0, 0, 640, 480), Instant::now())
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoViablePipeline { .. }));
    }

    #[test]
    fn test_lossy_encode_queues_refresh() {
        let mut ctx = context(capabilities());
        let rect = Rectangle::new(100, 100, 320, 240);
        ctx.set_video_region(Some(rect)).unwrap();
        let now = Instant::now();
        let sample = EncodingSample {
            at: now,
            encoding: "h264".into(),
            pixels: rect.area(),
            bpp: 32,
            compressed_size: 10_000,
            encode_time: 0.005,
        };
        ctx.record_encode(rect, 60, sample.clone());
        let refresh = ctx.take_refresh().unwrap();
        assert_eq!(refresh.video, vec![rect]);

        ctx.record_encode(rect, 60, sample.clone());
        ctx.record_encode(rect, 100, sample);
        assert!(ctx.take_refresh().is_none());
    }

    #[test]
    fn test_client_ack_feeds_global() {
        let mut ctx = context(capabilities());
        let global = GlobalStats::new();
        let now = Instant::now();
        ctx.record_frame_sent(7, 1024 * 768, 50_000, now);
        assert!(ctx.record_client_ack(7, 0.004, &global, now + Duration::from_millis(30)));
        assert!(!ctx.record_client_ack(7, 0.004, &global, now + Duration::from_millis(40)));
        assert_eq!(global.info().client_latency_samples, 1);
    }

    #[test]
    fn test_diagnostics_serialize() {
        let mut ctx = context(capabilities());
        let global = GlobalStats::new();
        ctx.update(&global, Instant::now());
        let json = serde_json::to_value(ctx.diagnostics()).unwrap();
        assert_eq!(json["window_id"], 1);
        assert_eq!(json["width"], 1024);
        assert!(json["batch"]["delay"].is_number());
        assert!(json["video_region"]["state"].is_string());
    }
}

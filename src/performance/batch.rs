//! Batch Delay Controller
//!
//! Maintains the adaptive per-window flush delay.
//!
//! # Algorithm
//!
//! Each recompute gathers weighted factors from the window statistics, the
//! connection statistics and the window's own state (focus, override-redirect,
//! pending soft refreshes). The new delay is a weighted blend of:
//!
//! ```text
//!   history: Σ d·w,  w = d_weight / (1 + (age/decay)²)
//!            d_weight = 0.25 for requested delays, 0.75 for actual delays
//!   factors: target = clamp(current × factor, 0, max_delay)
//!            w      = max(1, history_weight) × weight / Σ weights
//!
//!   delay = clamp(Σ value / Σ weight, min_delay, max_delay)
//! ```
//!
//! Factor weights are normalized before summing, so the factors together
//! never outweigh the history by more than the history's own weight.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, trace};

use super::{ControlError, Result};
use crate::config::BatchConfig;
use crate::stats::{
    logp, queue_inspect, Factor, FactorSet, GlobalStats, RingBuffer, Sample, Smoothing,
    WindowStats,
};

/// Weight of requested delays in the history blend
const REQUESTED_DELAY_WEIGHT: f64 = 0.25;

/// Weight of measured delays in the history blend
const ACTUAL_DELAY_WEIGHT: f64 = 0.75;

/// Smallest frame size used to normalize queued pixels
const MIN_LOW_LIMIT: u64 = 64;

/// Window state relevant to a delay recompute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchInputs {
    /// Window the delay belongs to
    pub window_id: u32,
    /// Window width
    pub width: u32,
    /// Window height
    pub height: u32,
    /// Pixels travel through a zero-copy transport
    pub zero_copy: bool,
    /// The window has keyboard focus
    pub has_focus: bool,
    /// The window is an override-redirect (menu, tooltip)
    pub override_redirect: bool,
    /// Another window is fullscreen
    pub peer_fullscreen: bool,
    /// Another window is maximized
    pub peer_maximized: bool,
    /// Soft refreshes that expired without being sent
    pub soft_expired: u32,
    /// Bandwidth cap in bits per second (0 = none)
    pub bandwidth_limit: u64,
}

impl BatchInputs {
    /// Pixels in one frame, at least [`MIN_LOW_LIMIT`]; ×4 for zero-copy
    pub fn low_limit(&self) -> u64 {
        let pixels = (self.width as u64 * self.height as u64).max(MIN_LOW_LIMIT);
        if self.zero_copy {
            pixels * 4
        } else {
            pixels
        }
    }
}

/// Serializable view of a [`BatchState`]
#[derive(Debug, Clone, Serialize)]
pub struct BatchDiagnostics {
    /// Current delay (ms)
    pub delay: f64,
    /// Configured minimum (ms)
    pub min_delay: f64,
    /// Floor applied by the last recompute (ms)
    pub effective_min_delay: f64,
    /// Configured maximum (ms)
    pub max_delay: f64,
    /// Delay pinned by a manual lock
    pub locked: bool,
    /// Factors used by the last recompute
    pub factors: Vec<Factor>,
    /// Malformed factors dropped by the last recompute
    pub dropped_factors: usize,
    /// Average measured delay (ms)
    pub avg_actual_delay: Option<f64>,
}

/// Per-window batching state
#[derive(Debug, Clone)]
pub struct BatchState {
    delay: f64,
    min_delay: f64,
    max_delay: f64,
    start_delay: f64,
    effective_min_delay: f64,
    always: bool,
    locked: bool,
    max_events: u32,
    max_pixels: u64,
    last_delays: RingBuffer<Sample>,
    last_actual_delays: RingBuffer<Sample>,
    last_updated: Option<Instant>,
    factors: Vec<Factor>,
    dropped_factors: usize,
}

impl BatchState {
    /// Create the state for a new window
    pub fn new(config: &BatchConfig) -> Self {
        let min_delay = config.min_delay_ms.max(0.0);
        let max_delay = config.max_delay_ms.max(min_delay);
        Self {
            delay: config.start_delay_ms.clamp(min_delay, max_delay),
            min_delay,
            max_delay,
            start_delay: config.start_delay_ms.clamp(min_delay, max_delay),
            effective_min_delay: min_delay,
            always: config.always,
            locked: false,
            max_events: config.max_events,
            max_pixels: config.max_pixels,
            last_delays: RingBuffer::new(config.delay_history),
            last_actual_delays: RingBuffer::new(config.delay_history),
            last_updated: None,
            factors: Vec::new(),
            dropped_factors: 0,
        }
    }

    /// Back to the start delay, forgetting history (full-quality refresh)
    ///
    /// A locked delay stays locked.
    pub fn reset(&mut self) {
        if !self.locked {
            self.delay = self.start_delay;
        }
        self.effective_min_delay = self.min_delay;
        self.last_delays.clear();
        self.last_actual_delays.clear();
        self.last_updated = None;
        self.factors.clear();
        self.dropped_factors = 0;
    }

    /// Current delay (ms)
    pub fn delay(&self) -> f64 {
        self.delay
    }

    /// Configured minimum delay (ms)
    pub fn min_delay(&self) -> f64 {
        self.min_delay
    }

    /// Configured maximum delay (ms)
    pub fn max_delay(&self) -> f64 {
        self.max_delay
    }

    /// Delay a new window starts with (ms)
    pub fn start_delay(&self) -> f64 {
        self.start_delay
    }

    /// Batch even when the delay is below the minimum
    pub fn always(&self) -> bool {
        self.always
    }

    /// Damage events that trigger an early flush
    pub fn max_events(&self) -> u32 {
        self.max_events
    }

    /// Pixels that trigger an early flush (0 = one frame)
    pub fn max_pixels(&self) -> u64 {
        self.max_pixels
    }

    /// True while a manual lock pins the delay
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Factors used by the last recompute
    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// When the delay was last recomputed
    pub fn last_updated(&self) -> Option<Instant> {
        self.last_updated
    }

    /// Number of measured delays held
    pub fn actual_delay_count(&self) -> usize {
        self.last_actual_delays.len()
    }

    /// Mean of the measured delays (ms)
    pub fn avg_actual_delay(&self) -> Option<f64> {
        if self.last_actual_delays.is_empty() {
            return None;
        }
        let sum: f64 = self.last_actual_delays.iter().map(|s| s.value).sum();
        Some(sum / self.last_actual_delays.len() as f64)
    }

    /// A batch was scheduled with `delay` ms
    pub fn record_delay(&mut self, delay: f64, now: Instant) -> Result<()> {
        self.check_delay("delay", delay)?;
        self.last_delays.push(Sample::new(now, delay));
        Ok(())
    }

    /// A batch was actually flushed `delay` ms after its first damage
    pub fn record_actual_delay(&mut self, delay: f64, now: Instant) -> Result<()> {
        if !delay.is_finite() || delay < 0.0 {
            return Err(ControlError::InvalidValue {
                name: "actual delay",
                value: delay,
            });
        }
        self.last_actual_delays.push(Sample::new(now, delay));
        Ok(())
    }

    /// Pin the delay until [`BatchState::unlock`]
    pub fn lock(&mut self, delay: f64) -> Result<()> {
        self.check_delay("locked delay", delay)?;
        debug!("batch delay locked at {:.1}ms", delay);
        self.delay = delay;
        self.locked = true;
        Ok(())
    }

    /// Resume automatic delay control
    pub fn unlock(&mut self) {
        if self.locked {
            debug!("batch delay unlocked at {:.1}ms", self.delay);
        }
        self.locked = false;
    }

    fn check_delay(&self, name: &'static str, delay: f64) -> Result<()> {
        if !delay.is_finite() || delay < 0.0 || delay > self.max_delay {
            return Err(ControlError::OutOfRange {
                name,
                value: delay,
                min: 0.0,
                max: self.max_delay,
            });
        }
        Ok(())
    }

    /// Blend the delay history with `factors` into a new delay
    ///
    /// `floor` raises the minimum for this update (fullscreen peers). Returns
    /// false, leaving the state untouched, when locked or when the factors
    /// carry no weight.
    pub fn update_delay(&mut self, factors: Vec<Factor>, floor: f64, now: Instant) -> bool {
        if self.locked {
            return false;
        }
        let max_weight = factors.iter().map(Factor::weight).fold(0.0, f64::max);
        if !(max_weight > 0.0) {
            trace!("no weighted factors, delay unchanged at {:.1}ms", self.delay);
            return false;
        }

        let max_delay = self.max_delay;
        let min_delay = self.min_delay.max(floor).min(max_delay);
        let current = self.delay;
        let decay = (logp(current / self.min_delay.max(1.0)) / 5.0).max(1.0);

        let (mut hist_v, mut hist_w) = (0.0, 0.0);
        for (series, d_weight) in [
            (&self.last_delays, REQUESTED_DELAY_WEIGHT),
            (&self.last_actual_delays, ACTUAL_DELAY_WEIGHT),
        ] {
            for s in series.iter() {
                let age = now.saturating_duration_since(s.at).as_secs_f64() / decay;
                let w = d_weight / (1.0 + age * age);
                hist_v += s.value.clamp(0.0, max_delay) * w;
                hist_w += w;
            }
        }

        let total: f64 = factors.iter().map(|f| f.weight() / max_weight).sum();
        let (mut tv, mut tw) = (hist_v, hist_w);
        for f in &factors {
            let target = (current * f.factor()).clamp(0.0, max_delay);
            let w = hist_w.max(1.0) * (f.weight() / max_weight) / total;
            tv += target * w;
            tw += w;
        }

        let delay = tv / tw;
        if !delay.is_finite() {
            return false;
        }
        self.delay = delay.clamp(min_delay, max_delay);
        self.effective_min_delay = min_delay;
        self.last_updated = Some(now);
        debug!(
            "batch delay {:.1}ms -> {:.1}ms from {} factors",
            current,
            self.delay,
            factors.len()
        );
        self.factors = factors;
        true
    }

    /// Diagnostics snapshot
    pub fn diagnostics(&self) -> BatchDiagnostics {
        BatchDiagnostics {
            delay: self.delay,
            min_delay: self.min_delay,
            effective_min_delay: self.effective_min_delay,
            max_delay: self.max_delay,
            locked: self.locked,
            factors: self.factors.clone(),
            dropped_factors: self.dropped_factors,
            avg_actual_delay: self.avg_actual_delay(),
        }
    }
}

/// Recomputes [`BatchState`] delays from window and connection statistics
#[derive(Debug, Clone)]
pub struct BatchController {
    config: BatchConfig,
}

impl BatchController {
    /// Create a controller
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Configuration in use
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Fresh state for a new window
    pub fn new_state(&self) -> BatchState {
        BatchState::new(&self.config)
    }

    /// Recompute the delay for one window
    ///
    /// Refreshes the window's averages and target latency as a side effect.
    /// Returns true when the delay was updated.
    pub fn recompute(
        &self,
        batch: &mut BatchState,
        inputs: &BatchInputs,
        global: &GlobalStats,
        window: &mut WindowStats,
        now: Instant,
    ) -> bool {
        if batch.is_locked() {
            return false;
        }

        let low_limit = inputs.low_limit();
        let averages = global.averages();
        window.update_averages(now);
        window.update_target_latency(
            averages.min_client_latency,
            averages.avg_client_latency,
            inputs.width as u64 * inputs.height as u64,
        );

        let factors = self.gather_factors(inputs, global, window, low_limit, now);
        let dropped = factors.dropped();

        let floor = if inputs.peer_fullscreen || inputs.peer_maximized {
            self.config.peer_min_delay_ms
        } else {
            0.0
        };
        let updated = batch.update_delay(factors.into_vec(), floor, now);
        if updated {
            batch.dropped_factors = dropped;
        }
        updated
    }

    fn gather_factors(
        &self,
        inputs: &BatchInputs,
        global: &GlobalStats,
        window: &WindowStats,
        low_limit: u64,
        now: Instant,
    ) -> FactorSet {
        let mut factors = FactorSet::new();
        factors.extend(window.get_factors(inputs.bandwidth_limit, now));
        factors.extend(global.get_factors(low_limit, now));
        factors.add(queue_inspect(
            "damage-packet-queue-pixels",
            &global.damage_packet_pixels(inputs.window_id),
            now,
            low_limit as f64,
            Smoothing::Sqrt,
        ));

        // focused and override-redirect windows want the lowest delay
        let boost = |name: &str, active: bool| {
            Factor::new(
                name,
                "",
                if active { 0.0 } else { 1.0 },
                if active { 1.0 } else { 0.0 },
            )
        };
        factors.add(boost("focus", inputs.has_focus));
        factors.add(boost("override-redirect", inputs.override_redirect));

        if inputs.soft_expired > 0 {
            factors.add(Factor::new(
                "soft-expired",
                format!("count={}", inputs.soft_expired),
                inputs.soft_expired as f64,
                1.0,
            ));
        }
        factors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn state() -> BatchState {
        BatchState::new(&BatchConfig::default())
    }

    fn factor(f: f64, w: f64) -> Factor {
        Factor::new("test", "", f, w).unwrap()
    }

    #[test]
    fn test_initial_delay() {
        let batch = state();
        assert_eq!(batch.delay(), 50.0);
        assert!(!batch.is_locked());
    }

    #[test]
    fn test_zero_factors_is_noop() {
        let mut batch = state();
        assert!(!batch.update_delay(Vec::new(), 0.0, Instant::now()));
        assert_eq!(batch.delay(), 50.0);
        assert!(batch.delay().is_finite());
    }

    #[test]
    fn test_zero_weight_is_noop() {
        let mut batch = state();
        let factors = vec![Factor::neutral("a"), factor(100.0, 0.0)];
        assert!(!batch.update_delay(factors, 0.0, Instant::now()));
        assert_eq!(batch.delay(), 50.0);
    }

    #[test]
    fn test_factor_raises_delay() {
        let mut batch = state();
        assert!(batch.update_delay(vec![factor(2.0, 1.0)], 0.0, Instant::now()));
        assert!((batch.delay() - 100.0).abs() < 1e-9);
        assert_eq!(batch.factors().len(), 1);
    }

    #[test]
    fn test_history_damps_changes() {
        let mut batch = state();
        let now = Instant::now();
        for _ in 0..10 {
            batch.record_actual_delay(50.0, now).unwrap();
        }
        batch.update_delay(vec![factor(4.0, 1.0)], 0.0, now);
        // history (50) and the factor target (200) weigh equally
        assert!((batch.delay() - 125.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_factors_stay_in_bounds() {
        let now = Instant::now();
        for (f, w) in [
            (0.0, 1.0),
            (1e300, 1.0),
            (f64::MAX, f64::MAX),
            (1e-300, 1e300),
            (5.0, 1e-300),
        ] {
            let mut batch = state();
            batch.update_delay(vec![factor(f, w), factor(1.0, w)], 0.0, now);
            let d = batch.delay();
            assert!(d.is_finite());
            assert!(d >= batch.min_delay() && d <= batch.max_delay(), "delay {}", d);
        }
    }

    #[test]
    fn test_peer_floor() {
        let mut batch = state();
        batch.update_delay(vec![factor(0.0, 1.0)], 40.0, Instant::now());
        assert_eq!(batch.delay(), 40.0);
    }

    #[test]
    fn test_lock_and_unlock() {
        let mut batch = state();
        batch.lock(20.0).unwrap();
        assert!(!batch.update_delay(vec![factor(10.0, 1.0)], 0.0, Instant::now()));
        assert_eq!(batch.delay(), 20.0);

        batch.reset();
        assert_eq!(batch.delay(), 20.0);

        batch.unlock();
        assert!(batch.update_delay(vec![factor(2.0, 1.0)], 0.0, Instant::now()));
        assert_eq!(batch.delay(), 40.0);
    }

    #[test]
    fn test_lock_rejects_out_of_range() {
        let mut batch = state();
        assert!(batch.lock(-1.0).is_err());
        assert!(batch.lock(f64::NAN).is_err());
        assert!(batch.lock(1e9).is_err());
        assert!(!batch.is_locked());
    }

    #[test]
    fn test_reset_restores_start_delay() {
        let mut batch = state();
        batch.update_delay(vec![factor(10.0, 1.0)], 0.0, Instant::now());
        assert!(batch.delay() > 50.0);
        batch.reset();
        assert_eq!(batch.delay(), 50.0);
        assert!(batch.factors().is_empty());
    }

    #[test]
    fn test_low_limit() {
        let mut inputs = BatchInputs {
            width: 4,
            height: 4,
            ..Default::default()
        };
        assert_eq!(inputs.low_limit(), 64);
        inputs.width = 100;
        inputs.height = 100;
        inputs.zero_copy = true;
        assert_eq!(inputs.low_limit(), 40_000);
    }

    // -------------------------------------------------------------------------
    // Controller
    // -------------------------------------------------------------------------

    #[test]
    fn test_focused_window_lowers_delay() {
        let controller = BatchController::new(BatchConfig::default());
        let mut batch = controller.new_state();
        let global = GlobalStats::new();
        let mut window = WindowStats::default();
        let now = Instant::now();

        let inputs = BatchInputs {
            window_id: 1,
            width: 800,
            height: 600,
            has_focus: true,
            ..Default::default()
        };
        assert!(controller.recompute(&mut batch, &inputs, &global, &mut window, now));
        assert!(batch.delay() < 50.0);
        assert!(batch.factors().iter().any(|f| f.name() == "focus"));
    }

    #[test]
    fn test_starved_unfocused_window_unchanged() {
        let controller = BatchController::new(BatchConfig::default());
        let mut batch = controller.new_state();
        let global = GlobalStats::new();
        let mut window = WindowStats::default();

        let inputs = BatchInputs {
            window_id: 1,
            width: 800,
            height: 600,
            ..Default::default()
        };
        assert!(!controller.recompute(&mut batch, &inputs, &global, &mut window, Instant::now()));
        assert_eq!(batch.delay(), 50.0);
    }

    #[test]
    fn test_noop_recompute_keeps_dropped_count() {
        let controller = BatchController::new(BatchConfig::default());
        let mut batch = controller.new_state();
        let global = GlobalStats::new();
        let mut window = WindowStats::default();
        // count left by the last applied update
        batch.dropped_factors = 2;

        let inputs = BatchInputs {
            window_id: 1,
            width: 800,
            height: 600,
            ..Default::default()
        };
        assert!(!controller.recompute(&mut batch, &inputs, &global, &mut window, Instant::now()));
        assert_eq!(batch.diagnostics().dropped_factors, 2);

        // an applied update replaces it
        let focused = BatchInputs {
            has_focus: true,
            ..inputs
        };
        assert!(controller.recompute(&mut batch, &focused, &global, &mut window, Instant::now()));
        assert_eq!(batch.diagnostics().dropped_factors, 0);
    }

    #[test]
    fn test_queued_pixels_raise_delay() {
        let controller = BatchController::new(BatchConfig::default());
        let mut batch = controller.new_state();
        let global = GlobalStats::new();
        let mut window = WindowStats::default();
        let base = Instant::now();
        for i in 0..20 {
            global.record_damage_packet_pixels(1, 800 * 600 * 8, base + Duration::from_millis(i * 10));
        }
        let now = base + Duration::from_millis(200);

        let inputs = BatchInputs {
            window_id: 1,
            width: 800,
            height: 600,
            ..Default::default()
        };
        assert!(controller.recompute(&mut batch, &inputs, &global, &mut window, now));
        assert!(batch.delay() > 50.0);
    }
}

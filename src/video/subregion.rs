//! Video Region Detection
//!
//! Finds the part of a window that behaves like video (a player inside a
//! browser, a game inside a launcher) so it can be handed to a video
//! encoder while the rest of the window keeps lossless updates.
//!
//! # Algorithm
//!
//! ```text
//!   damage history (last 5s)
//!     ├─> existing region scores ≥ keep?            → keep (hysteresis)
//!     ├─> exact-shape buckets   (one shape, or a clear leader) ≥ shortcut
//!     ├─> (width, x) buckets    ─┐
//!     ├─> (height, y) buckets   ─┴─> merged candidates
//!     │      best ≥ shortcut                         → adopt
//!     │      existing ≥ retain and not beaten        → keep
//!     │      best ≥ adopt                            → adopt
//!     ├─> bounding box of all damage ≥ union         → adopt
//!     └─> otherwise                                  → no region
//! ```
//!
//! A candidate's score rewards the share of damage pixels falling inside it
//! and penalizes its size relative to the window:
//!
//! ```text
//!   score = in_fraction × 100 × 2·window_area / (window_area + region_area)
//!         × sqrt(share of the region actually damaged)
//! ```
//!
//! 100 is neutral; identical repeated damage on a small rectangle scores
//! close to 200.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use super::refresh::{RefreshRequest, RefreshTimer};
use crate::config::VideoRegionConfig;
use crate::damage::{
    add_rectangle, merge_all, remove_rectangle, total_area, DamageEvent, GeometryError, Rectangle,
};

/// Minimum events in the region before an fps estimate is made
const MIN_FPS_EVENTS: usize = 10;

/// Candidate scores kept for diagnostics
const MAX_SCORES_KEPT: usize = 8;

/// Logical detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionState {
    /// No region
    None,
    /// A region was adopted recently and has not been confirmed yet
    Candidate,
    /// A region has survived long enough to be trusted
    Active,
}

/// A scored candidate rectangle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredRegion {
    /// Candidate
    pub rect: Rectangle,
    /// Its score
    pub score: f64,
}

/// Serializable view of the detector
#[derive(Debug, Clone, Serialize)]
pub struct RegionDiagnostics {
    /// Master switch
    pub enabled: bool,
    /// Automatic detection
    pub detection: bool,
    /// Logical state
    pub state: RegionState,
    /// Current region
    pub rectangle: Option<Rectangle>,
    /// Score of the current region at the last evaluation
    pub score: f64,
    /// Estimated frame rate inside the region
    pub fps: u32,
    /// Damage event count when the region was set
    pub set_at: u64,
    /// Damage event count at the last evaluation
    pub counter: u64,
    /// Why the region was last cleared
    pub last_reset_reason: Option<String>,
    /// Exclusion zones in effect
    pub exclusion_zones: Vec<Rectangle>,
    /// Queued refreshes inside the region
    pub pending_refresh: usize,
    /// Queued refreshes just outside the region
    pub pending_non_video_refresh: usize,
    /// Best candidates of the last evaluation
    pub last_scores: Vec<ScoredRegion>,
}

/// Regions due for a refresh once the delayed timer fires
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubregionRefresh {
    /// Areas inside the video region
    pub video: Vec<Rectangle>,
    /// Areas outside it that were queued with them
    pub non_video: Vec<Rectangle>,
}

/// Per-window video region detector
#[derive(Debug)]
pub struct VideoRegionDetector {
    config: VideoRegionConfig,
    enabled: bool,
    detection: bool,
    rectangle: Option<Rectangle>,
    set_at: u64,
    counter: u64,
    time: Option<Instant>,
    score: f64,
    fps: u32,
    exclusion_zones: Vec<Rectangle>,
    last_scores: Vec<ScoredRegion>,
    last_reset_reason: Option<String>,
    auto_refresh_delay: Duration,
    refresh_regions: Vec<Rectangle>,
    non_video_regions: Vec<Rectangle>,
    refresh_timer: Option<RefreshTimer>,
}

impl VideoRegionDetector {
    /// Create a detector
    pub fn new(config: VideoRegionConfig) -> Self {
        Self {
            enabled: config.enabled,
            detection: config.detection,
            config,
            rectangle: None,
            set_at: 0,
            counter: 0,
            time: None,
            score: 0.0,
            fps: 0,
            exclusion_zones: Vec::new(),
            last_scores: Vec::new(),
            last_reset_reason: None,
            auto_refresh_delay: Duration::ZERO,
            refresh_regions: Vec::new(),
            non_video_regions: Vec::new(),
            refresh_timer: None,
        }
    }

    /// Post due refreshes for `window_id` on `tx` instead of waiting to be polled
    pub fn attach_refresh_channel(&mut self, window_id: u32, tx: UnboundedSender<RefreshRequest>) {
        self.refresh_timer = Some(RefreshTimer::new(window_id, tx));
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current region
    pub fn rectangle(&self) -> Option<Rectangle> {
        self.rectangle
    }

    /// Logical state
    pub fn state(&self) -> RegionState {
        match self.rectangle {
            None => RegionState::None,
            Some(_) if self.counter.saturating_sub(self.set_at) < self.config.min_events => {
                RegionState::Candidate
            }
            Some(_) => RegionState::Active,
        }
    }

    /// Estimated frame rate inside the region
    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Score of the current region
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Master switch
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Automatic detection
    pub fn is_detecting(&self) -> bool {
        self.detection
    }

    /// True when `rect` lies inside the current region
    pub fn is_video(&self, rect: &Rectangle) -> bool {
        self.rectangle.is_some_and(|r| r.contains_rect(rect))
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    /// Forget the region and all counters
    pub fn reset(&mut self) {
        self.cancel_refresh();
        self.rectangle = None;
        self.set_at = 0;
        self.counter = 0;
        self.time = None;
        self.score = 0.0;
        self.fps = 0;
        self.last_scores.clear();
    }

    /// Master switch; disabling clears the region
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear_region("disabled");
        }
    }

    /// Turn automatic detection on or off; either way starts from scratch
    pub fn set_detection(&mut self, detection: bool) {
        self.detection = detection;
        self.reset();
    }

    /// Set the region manually, disabling automatic detection
    pub fn set_region(&mut self, region: Option<Rectangle>) -> Result<(), GeometryError> {
        if let Some(r) = region {
            if r.is_empty() {
                return Err(GeometryError::InvalidSize {
                    width: r.width as i64,
                    height: r.height as i64,
                });
            }
        }
        self.detection = false;
        match region {
            Some(r) => self.adopt(r, 0.0, "set manually"),
            None => self.clear_region("cleared manually"),
        }
        Ok(())
    }

    /// Areas that must never be part of a video region
    pub fn set_exclusion_zones(&mut self, zones: Vec<Rectangle>) {
        self.exclusion_zones = zones;
    }

    /// Window-level auto refresh delay; region refreshes never fire sooner
    pub fn set_auto_refresh_delay(&mut self, delay: Duration) {
        self.auto_refresh_delay = delay;
    }

    fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.config.refresh_delay_ms).max(self.auto_refresh_delay)
    }

    // =========================================================================
    // Refresh queue
    // =========================================================================

    /// Queue a refresh for `region` and (re)arm the delayed timer
    ///
    /// Only the part inside the video region is refreshed on the region's
    /// own cadence; the rest is carried along as non-video area. Returns
    /// false when there is no region.
    pub fn add_video_refresh(&mut self, region: Rectangle) -> bool {
        let Some(video) = self.rectangle else {
            return false;
        };
        let Some(inside) = region.intersection(&video) else {
            return false;
        };
        add_rectangle(&mut self.refresh_regions, inside);
        for outside in region.subtract(&video) {
            add_rectangle(&mut self.non_video_regions, outside);
        }
        let delay = self.refresh_delay();
        if let Some(timer) = self.refresh_timer.as_mut() {
            timer.schedule(delay);
        }
        true
    }

    /// Drop queued refreshes covered by a fresh lossless update
    pub fn remove_refresh_region(&mut self, region: &Rectangle) {
        remove_rectangle(&mut self.refresh_regions, region);
        remove_rectangle(&mut self.non_video_regions, region);
        if self.refresh_regions.is_empty() && self.non_video_regions.is_empty() {
            self.cancel_refresh();
        }
    }

    /// Take the queued refreshes
    ///
    /// With two or more queued areas the whole region is refreshed at once.
    pub fn take_refresh(&mut self) -> Option<SubregionRefresh> {
        if self.refresh_regions.is_empty() && self.non_video_regions.is_empty() {
            return None;
        }
        let mut video = std::mem::take(&mut self.refresh_regions);
        if video.len() >= 2 {
            if let Some(r) = self.rectangle {
                video = vec![r];
            }
        }
        Some(SubregionRefresh {
            video,
            non_video: std::mem::take(&mut self.non_video_regions),
        })
    }

    /// Cancel the pending timer and drop every queued refresh
    pub fn cancel_refresh(&mut self) {
        if let Some(timer) = self.refresh_timer.as_mut() {
            timer.cancel();
        }
        self.refresh_regions.clear();
        self.non_video_regions.clear();
    }

    /// True while the delayed refresh timer is armed
    pub fn refresh_pending(&self) -> bool {
        self.refresh_timer.as_ref().is_some_and(RefreshTimer::is_pending)
    }

    // =========================================================================
    // Detection
    // =========================================================================

    fn adopt(&mut self, rect: Rectangle, score: f64, reason: &str) {
        self.score = score;
        if self.rectangle == Some(rect) {
            return;
        }
        info!("video region {} adopted: {}", rect, reason);
        self.cancel_refresh();
        self.rectangle = Some(rect);
        self.set_at = self.counter;
        self.last_reset_reason = None;
    }

    fn clear_region(&mut self, reason: &str) {
        if let Some(r) = self.rectangle.take() {
            info!("video region {} cleared: {}", r, reason);
            self.cancel_refresh();
        } else {
            debug!("no video region: {}", reason);
        }
        self.score = 0.0;
        self.fps = 0;
        self.set_at = 0;
        self.last_reset_reason = Some(reason.to_string());
    }

    /// Re-evaluate the region from the window's damage history
    ///
    /// `event_count` is the total number of damage events ever recorded for
    /// the window; `recent_events` the events still held. Returns true when
    /// the region changed.
    pub fn identify<'a, I>(
        &mut self,
        width: u32,
        height: u32,
        event_count: u64,
        recent_events: I,
        now: Instant,
    ) -> bool
    where
        I: IntoIterator<Item = &'a DamageEvent>,
    {
        let before = self.rectangle;
        self.evaluate(width, height, event_count, recent_events, now);
        before != self.rectangle
    }

    fn evaluate<'a, I>(
        &mut self,
        width: u32,
        height: u32,
        event_count: u64,
        recent_events: I,
        now: Instant,
    ) where
        I: IntoIterator<Item = &'a DamageEvent>,
    {
        if !self.enabled {
            self.clear_region("disabled");
            return;
        }
        if !self.detection {
            return;
        }
        if event_count < self.set_at {
            // window statistics were reset
            self.set_at = 0;
        }
        if event_count < self.counter {
            self.counter = 0;
        }
        if let Some(r) = self.rectangle {
            if r.right() > width as u64 || r.bottom() > height as u64 {
                self.clear_region("window is now smaller than current region");
                return;
            }
        }
        if width < self.config.min_width || height < self.config.min_height {
            self.clear_region("window is too small");
            return;
        }

        if self.counter + self.config.debounce_events > event_count {
            // not enough new damage: only check whether the region went quiet
            if let (Some(_), Some(time)) = (self.rectangle, self.time) {
                let since_set = event_count.saturating_sub(self.set_at);
                let timeout = 2.0 + (2.0 + since_set as f64).ln() / 1.5f64.ln();
                let elapsed = now.saturating_duration_since(time).as_secs_f64();
                if elapsed >= timeout {
                    self.counter = event_count;
                    self.time = Some(now);
                    self.clear_region(&format!("no damage for {:.0}s", elapsed));
                }
            }
            return;
        }
        if event_count < self.config.min_events {
            return;
        }
        self.counter = event_count;
        self.time = Some(now);

        let cutoff = now.checked_sub(Duration::from_millis(self.config.max_time_ms));
        let recent: Vec<&DamageEvent> = recent_events
            .into_iter()
            .filter(|e| cutoff.map_or(true, |c| e.at >= c))
            .collect();
        let elapsed = recent
            .iter()
            .map(|e| e.at)
            .min()
            .map_or(0.0, |oldest| now.saturating_duration_since(oldest).as_secs_f64());
        let events: Vec<Rectangle> = recent
            .iter()
            .filter_map(|e| e.rect.clip_to(width, height))
            .collect();
        if (events.len() as u64) < self.config.min_events {
            self.clear_region("not enough recent damage events");
            return;
        }
        if !self.exclusion_zones.is_empty()
            && events
                .iter()
                .any(|e| self.exclusion_zones.iter().any(|z| z.intersects(e)))
        {
            self.clear_region("damage in exclusion zone");
            return;
        }

        let eval = Evaluation::new(width, height, &events, elapsed);
        self.last_scores.clear();

        // hysteresis: a region that still scores well is not questioned
        let mut current_score = None;
        if let Some(cur) = self.rectangle {
            let score = eval.score(&cur);
            if score >= self.config.thresholds.keep {
                self.score = score;
                self.fps = eval.fps(&cur, &Self::inside(cur, &events));
                return;
            }
            current_score = Some(score);
        }

        if self.try_exact_shapes(&eval) == Some(true) {
            if let Some(r) = self.rectangle {
                self.fps = eval.fps(&r, &Self::inside(r, &events));
            }
            return;
        }

        // merge buckets of rectangles sharing a width/x or a height/y
        let distinct = eval.distinct.len();
        let merge_min = 2.max(distinct / 25);
        let mut by_width: BTreeMap<(u32, u32), Vec<Rectangle>> = BTreeMap::new();
        let mut by_height: BTreeMap<(u32, u32), Vec<Rectangle>> = BTreeMap::new();
        for r in eval.distinct.keys() {
            if r.width >= self.config.min_width {
                by_width.entry((r.width, r.x)).or_default().push(*r);
            }
            if r.height >= self.config.min_height {
                by_height.entry((r.height, r.y)).or_default().push(*r);
            }
        }
        let mut best: Option<ScoredRegion> = None;
        for rects in by_width.values().chain(by_height.values()) {
            if rects.len() < merge_min {
                continue;
            }
            let Some(merged) = merge_all(rects) else {
                continue;
            };
            if !self.is_valid_region(&merged, width, height) {
                continue;
            }
            let candidate = ScoredRegion {
                rect: merged,
                score: eval.score(&merged),
            };
            self.note_score(candidate);
            if best.map_or(true, |b| candidate.score > b.score) {
                best = Some(candidate);
            }
        }

        let t = self.config.thresholds;
        let best_score = best.map_or(0.0, |b| b.score);
        if let Some(b) = best.filter(|b| b.score >= t.shortcut) {
            self.adopt(b.rect, b.score, "merged damage");
        } else if let (Some(cur), Some(score)) = (self.rectangle, current_score) {
            if score >= t.retain && (best_score < t.adopt || score >= best_score) {
                self.score = score;
                self.fps = eval.fps(&cur, &Self::inside(cur, &events));
                return;
            }
            self.adopt_or_fallback(&eval, best, width, height);
        } else {
            self.adopt_or_fallback(&eval, best, width, height);
        }

        if let Some(r) = self.rectangle {
            self.fps = eval.fps(&r, &Self::inside(r, &events));
        }
    }

    /// Exact-shape shortcuts; `Some(true)` when a decision was made
    fn try_exact_shapes(&mut self, eval: &Evaluation<'_>) -> Option<bool> {
        let t = self.config.thresholds;
        let (width, height) = (eval.window.width, eval.window.height);

        if eval.distinct.len() == 1 {
            let (&only, _) = eval.distinct.iter().next()?;
            if self.is_valid_region(&only, width, height) {
                let score = eval.score(&only);
                self.note_score(ScoredRegion { rect: only, score });
                if score >= t.shortcut {
                    self.adopt(only, score, "only damaged region");
                    return Some(true);
                }
            }
            self.clear_region("single damaged region is not video");
            return Some(true);
        }

        // a single rectangle receiving more damage than any other
        let min_count = 2.max(eval.events.len() / 40);
        let top = eval.distinct.values().copied().max()?;
        let mut leaders = eval.distinct.iter().filter(|(_, &c)| c == top);
        let (&leader, _) = leaders.next()?;
        if leaders.next().is_none()
            && top >= min_count
            && self.is_valid_region(&leader, width, height)
        {
            let score = eval.score(&leader);
            self.note_score(ScoredRegion {
                rect: leader,
                score,
            });
            if score >= t.shortcut {
                self.adopt(leader, score, "most damaged region");
                return Some(true);
            }
        }
        Some(false)
    }

    fn adopt_or_fallback(
        &mut self,
        eval: &Evaluation<'_>,
        best: Option<ScoredRegion>,
        width: u32,
        height: u32,
    ) {
        let t = self.config.thresholds;
        if let Some(b) = best.filter(|b| b.score >= t.adopt) {
            self.adopt(b.rect, b.score, "best merged candidate");
            return;
        }
        if let Some(all) = merge_all(eval.distinct.keys()) {
            if self.is_valid_region(&all, width, height) {
                let score = eval.score(&all);
                self.note_score(ScoredRegion { rect: all, score });
                if score >= t.union {
                    self.adopt(all, score, "union of damage");
                    return;
                }
            }
        }
        self.clear_region("no matching region");
    }

    fn is_valid_region(&self, r: &Rectangle, width: u32, height: u32) -> bool {
        r.width >= self.config.min_width
            && r.height >= self.config.min_height
            && r.right() <= width as u64
            && r.bottom() <= height as u64
            && !r.contains_rect(&Rectangle::full(width, height))
            && !self.exclusion_zones.iter().any(|z| z.intersects(r))
    }

    fn note_score(&mut self, candidate: ScoredRegion) {
        self.last_scores.push(candidate);
        self.last_scores.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.last_scores.truncate(MAX_SCORES_KEPT);
    }

    fn inside(region: Rectangle, events: &[Rectangle]) -> Vec<Rectangle> {
        events
            .iter()
            .filter_map(|e| e.intersection(&region))
            .collect()
    }

    /// Diagnostics snapshot
    pub fn diagnostics(&self) -> RegionDiagnostics {
        RegionDiagnostics {
            enabled: self.enabled,
            detection: self.detection,
            state: self.state(),
            rectangle: self.rectangle,
            score: self.score,
            fps: self.fps,
            set_at: self.set_at,
            counter: self.counter,
            last_reset_reason: self.last_reset_reason.clone(),
            exclusion_zones: self.exclusion_zones.clone(),
            pending_refresh: self.refresh_regions.len(),
            pending_non_video_refresh: self.non_video_regions.len(),
            last_scores: self.last_scores.clone(),
        }
    }
}

// =============================================================================
// Scoring
// =============================================================================

/// Damage of one evaluation pass, indexed for scoring
struct Evaluation<'a> {
    window: Rectangle,
    events: &'a [Rectangle],
    distinct: BTreeMap<Rectangle, usize>,
    /// Seconds since the oldest event considered
    elapsed: f64,
}

impl<'a> Evaluation<'a> {
    fn new(width: u32, height: u32, events: &'a [Rectangle], elapsed: f64) -> Self {
        let mut distinct = BTreeMap::new();
        for e in events {
            *distinct.entry(*e).or_insert(0) += 1;
        }
        Self {
            window: Rectangle::full(width, height),
            events,
            distinct,
            elapsed,
        }
    }

    /// Damage pixels inside and outside `r`
    fn in_out(&self, r: &Rectangle) -> (u64, u64) {
        self.events.iter().fold((0, 0), |(inside, outside), e| {
            let i = e.intersection(r).map_or(0, |x| x.area());
            (inside + i, outside + e.area() - i)
        })
    }

    /// Share of `r` covered by at least one damage rectangle
    fn damaged_ratio(&self, r: &Rectangle) -> f64 {
        if r.area() == 0 {
            return 0.0;
        }
        let mut uncovered = vec![*r];
        for d in self.distinct.keys() {
            if d.intersects(r) {
                remove_rectangle(&mut uncovered, d);
                if uncovered.is_empty() {
                    break;
                }
            }
        }
        1.0 - total_area(&uncovered) as f64 / r.area() as f64
    }

    fn score(&self, r: &Rectangle) -> f64 {
        let (inside, outside) = self.in_out(r);
        let total = inside + outside;
        if total == 0 {
            return 0.0;
        }
        let in_fraction = inside as f64 / total as f64;
        let window_area = self.window.area() as f64;
        let region_area = r.area() as f64;
        let base = in_fraction * 100.0 * 2.0 * window_area / (window_area + region_area);
        base * self.damaged_ratio(r).sqrt()
    }

    /// Frames per second inside `r`, from the damage that fell inside it
    fn fps(&self, r: &Rectangle, inside: &[Rectangle]) -> u32 {
        if inside.len() < MIN_FPS_EVENTS || r.area() == 0 || self.elapsed <= 0.0 {
            return 0;
        }
        let pixels: u64 = inside.iter().map(Rectangle::area).sum();
        (pixels as f64 / r.area() as f64 / self.elapsed) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 1024;
    const H: u32 = 768;

    fn detector() -> VideoRegionDetector {
        VideoRegionDetector::new(VideoRegionConfig::default())
    }

    fn events(base: Instant, rects: &[Rectangle], count: usize) -> Vec<DamageEvent> {
        (0..count)
            .map(|i| {
                DamageEvent::new(
                    base + Duration::from_millis(i as u64 * 20),
                    rects[i % rects.len()],
                )
            })
            .collect()
    }

    fn run(det: &mut VideoRegionDetector, evs: &[DamageEvent], total: u64) -> Option<Rectangle> {
        let now = evs.last().map(|e| e.at).unwrap_or_else(Instant::now);
        det.identify(W, H, total, evs, now);
        det.rectangle()
    }

    #[test]
    fn test_too_few_events() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let evs = events(Instant::now(), &[rect], 15);
        assert_eq!(run(&mut det, &evs, 15), None);
        assert_eq!(det.state(), RegionState::None);
    }

    #[test]
    fn test_identical_rects_detected() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let evs = events(Instant::now(), &[rect], 50);
        assert_eq!(run(&mut det, &evs, 50), Some(rect));
        assert_eq!(det.state(), RegionState::Candidate);
        assert!(det.score() >= 120.0);
    }

    #[test]
    fn test_full_window_never_selected() {
        let mut det = detector();
        let evs = events(Instant::now(), &[Rectangle::full(W, H)], 50);
        assert_eq!(run(&mut det, &evs, 50), None);
        assert!(det.diagnostics().last_reset_reason.is_some());
    }

    #[test]
    fn test_small_rect_never_selected() {
        let mut det = detector();
        let evs = events(Instant::now(), &[Rectangle::new(10, 10, 100, 80)], 50);
        assert_eq!(run(&mut det, &evs, 50), None);
    }

    #[test]
    fn test_close_regions_merge() {
        let mut det = detector();
        let a = Rectangle::new(100, 100, 320, 240);
        let b = Rectangle::new(100, 340, 320, 240);
        let evs = events(Instant::now(), &[a, b], 50);
        assert_eq!(run(&mut det, &evs, 50), Some(a.union(&b)));
    }

    #[test]
    fn test_distant_regions_do_not_merge() {
        let mut det = detector();
        let a = Rectangle::new(0, 0, 200, 150);
        let b = Rectangle::new(800, 600, 200, 150);
        let evs = events(Instant::now(), &[a, b], 50);
        let region = run(&mut det, &evs, 50);
        assert_ne!(region, Some(a.union(&b)));
        assert_eq!(region, None);
    }

    #[test]
    fn test_debounce() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let base = Instant::now();
        let evs = events(base, &[rect], 50);
        assert_eq!(run(&mut det, &evs, 50), Some(rect));

        // fewer than 10 new events: nothing re-evaluated
        let other = Rectangle::new(500, 400, 300, 200);
        let mut more = evs.clone();
        more.extend(events(base + Duration::from_secs(1), &[other], 5));
        assert!(!det.identify(W, H, 55, &more, base + Duration::from_secs(2)));
        assert_eq!(det.rectangle(), Some(rect));
    }

    #[test]
    fn test_quiet_region_timeout_counts_events_since_adoption() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let evs = events(Instant::now(), &[rect], 50);
        assert_eq!(run(&mut det, &evs, 10_000), Some(rect));
        assert_eq!(det.diagnostics().set_at, 10_000);

        // no new damage since adoption: 2 + log1.5(2) ≈ 3.7s
        let last = evs[evs.len() - 1].at;
        assert!(!det.identify(W, H, 10_000, &evs, last + Duration::from_secs(3)));
        assert_eq!(det.rectangle(), Some(rect));
        assert!(det.identify(W, H, 10_000, &evs, last + Duration::from_secs(6)));
        assert_eq!(det.rectangle(), None);
    }

    #[test]
    fn test_stats_reset_rebases_adoption_marker() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let evs = events(Instant::now(), &[rect], 50);
        assert_eq!(run(&mut det, &evs, 10_000), Some(rect));

        // total went backwards: 5 events since the reset, 2 + log1.5(7) ≈ 6.8s
        let last = evs[evs.len() - 1].at;
        assert!(!det.identify(W, H, 5, &evs, last + Duration::from_secs(5)));
        assert_eq!(det.diagnostics().set_at, 0);
        assert_eq!(det.diagnostics().counter, 0);
        assert_eq!(det.rectangle(), Some(rect));
        assert!(det.identify(W, H, 5, &evs, last + Duration::from_secs(8)));
        assert_eq!(det.rectangle(), None);
    }

    #[test]
    fn test_hysteresis_keeps_region() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let base = Instant::now();
        let mut evs = events(base, &[rect], 50);
        run(&mut det, &evs, 50);

        // a little stray damage does not move the region
        evs.extend(events(base + Duration::from_secs(1), &[Rectangle::new(700, 500, 50, 50)], 3));
        evs.extend(events(base + Duration::from_secs(2), &[rect], 20));
        assert!(!det.identify(W, H, 73, &evs, base + Duration::from_secs(3)));
        assert_eq!(det.rectangle(), Some(rect));
        assert_eq!(det.state(), RegionState::Active);
    }

    #[test]
    fn test_resize_resets() {
        let mut det = detector();
        let rect = Rectangle::new(500, 400, 320, 240);
        let evs = events(Instant::now(), &[rect], 50);
        run(&mut det, &evs, 50);
        assert_eq!(det.rectangle(), Some(rect));

        let now = evs[49].at;
        assert!(det.identify(640, 480, 50, &evs, now));
        assert_eq!(det.rectangle(), None);
        assert_eq!(
            det.diagnostics().last_reset_reason.as_deref(),
            Some("window is now smaller than current region")
        );
    }

    #[test]
    fn test_slow_region_timeout() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let base = Instant::now();
        let evs = events(base, &[rect], 50);
        run(&mut det, &evs, 50);

        assert!(det.identify(W, H, 50, &evs, base + Duration::from_secs(30)));
        assert_eq!(det.rectangle(), None);
    }

    #[test]
    fn test_exclusion_zone() {
        let mut det = detector();
        det.set_exclusion_zones(vec![Rectangle::new(150, 150, 10, 10)]);
        let rect = Rectangle::new(100, 100, 320, 240);
        let evs = events(Instant::now(), &[rect], 50);
        assert_eq!(run(&mut det, &evs, 50), None);
    }

    #[test]
    fn test_disabled() {
        let mut det = detector();
        det.set_enabled(false);
        let rect = Rectangle::new(100, 100, 320, 240);
        let evs = events(Instant::now(), &[rect], 50);
        assert_eq!(run(&mut det, &evs, 50), None);
    }

    #[test]
    fn test_manual_region() {
        let mut det = detector();
        let rect = Rectangle::new(0, 0, 200, 200);
        det.set_region(Some(rect)).unwrap();
        assert!(!det.is_detecting());
        assert_eq!(det.rectangle(), Some(rect));

        // detection is off, damage elsewhere changes nothing
        let evs = events(Instant::now(), &[Rectangle::new(500, 400, 320, 240)], 50);
        assert_eq!(run(&mut det, &evs, 50), Some(rect));

        assert!(det.set_region(Some(Rectangle::new(0, 0, 0, 10))).is_err());
        det.set_region(None).unwrap();
        assert_eq!(det.rectangle(), None);
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let evs = events(Instant::now(), &[rect], 50);
        run(&mut det, &evs, 50);
        det.reset();
        let d = det.diagnostics();
        assert_eq!(d.rectangle, None);
        assert_eq!(d.counter, 0);
        assert_eq!(d.set_at, 0);
    }

    #[test]
    fn test_fps_estimate() {
        let mut det = detector();
        let rect = Rectangle::new(100, 100, 320, 240);
        let evs = events(Instant::now(), &[rect], 100);
        run(&mut det, &evs, 100);
        // 100 full-region frames 20ms apart
        assert_eq!(det.fps(), 50);
    }

    // -------------------------------------------------------------------------
    // Refresh queue
    // -------------------------------------------------------------------------

    #[test]
    fn test_refresh_requires_region() {
        let mut det = detector();
        assert!(!det.add_video_refresh(Rectangle::new(0, 0, 10, 10)));
        assert!(det.take_refresh().is_none());
    }

    #[test]
    fn test_refresh_split_inside_outside() {
        let mut det = detector();
        det.set_region(Some(Rectangle::new(100, 100, 200, 200))).unwrap();
        assert!(det.add_video_refresh(Rectangle::new(50, 100, 100, 50)));

        let refresh = det.take_refresh().unwrap();
        assert_eq!(refresh.video, vec![Rectangle::new(100, 100, 50, 50)]);
        assert_eq!(refresh.non_video, vec![Rectangle::new(50, 100, 50, 50)]);
        assert!(det.take_refresh().is_none());
    }

    #[test]
    fn test_refresh_coalesces_to_whole_region() {
        let mut det = detector();
        let region = Rectangle::new(100, 100, 200, 200);
        det.set_region(Some(region)).unwrap();
        det.add_video_refresh(Rectangle::new(100, 100, 10, 10));
        det.add_video_refresh(Rectangle::new(200, 200, 10, 10));

        let refresh = det.take_refresh().unwrap();
        assert_eq!(refresh.video, vec![region]);
    }

    #[test]
    fn test_remove_refresh_region() {
        let mut det = detector();
        det.set_region(Some(Rectangle::new(100, 100, 200, 200))).unwrap();
        det.add_video_refresh(Rectangle::new(100, 100, 50, 50));
        det.remove_refresh_region(&Rectangle::new(0, 0, 1000, 1000));
        assert!(det.take_refresh().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timer_single_outstanding() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut det = detector();
        det.attach_refresh_channel(9, tx);
        det.set_region(Some(Rectangle::new(100, 100, 200, 200))).unwrap();

        det.add_video_refresh(Rectangle::new(100, 100, 10, 10));
        det.add_video_refresh(Rectangle::new(150, 150, 10, 10));
        assert!(det.refresh_pending());

        let request = rx.recv().await.unwrap();
        assert_eq!(request.window_id, 9);
        assert_eq!(request.delay, Duration::from_millis(150));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert!(det.take_refresh().is_some());
    }
}

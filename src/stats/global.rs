//! Connection-level statistics
//!
//! Written concurrently by the network path (pings, acks, queue depths) and
//! the damage path (queued pixels); read by every window's controller.
//! Each series has its own lock. Derived values are only refreshed by an
//! explicit [`GlobalStats::update_averages`], usually driven by
//! [`GlobalStats::spawn_refresher`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::factor::Factor;
use super::primitives::{
    for_target, log2p, queue_inspect, time_weighted_average, timesize_weighted_average,
    Smoothing, TargetParams,
};
use super::series::{
    LatencySample, Sample, SampleSeries, SizedSample, WindowSample, GLOBAL_SERIES_CAPACITY,
};
use super::Result;

/// Latency assumed until the client has reported anything (seconds)
pub const DEFAULT_LATENCY: f64 = 0.1;

/// Congestion events older than this are ignored
const CONGESTION_WINDOW: Duration = Duration::from_secs(10);

/// Derived values recomputed by [`GlobalStats::update_averages`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalAverages {
    /// Lowest client latency seen (s)
    pub min_client_latency: f64,
    /// Time-weighted client latency (s)
    pub avg_client_latency: f64,
    /// Recent client latency (s)
    pub recent_client_latency: f64,
    /// Lowest client ping round trip (s)
    pub min_client_ping_latency: f64,
    /// Time-weighted client ping (s)
    pub avg_client_ping_latency: f64,
    /// Recent client ping (s)
    pub recent_client_ping_latency: f64,
    /// Lowest server ping round trip (s)
    pub min_server_ping_latency: f64,
    /// Time-weighted server ping (s)
    pub avg_server_ping_latency: f64,
    /// Recent server ping (s)
    pub recent_server_ping_latency: f64,
    /// Send speed observed while congested (bytes/s), 0 when unknown
    pub avg_congestion_send_speed: f64,
    /// 0 (idle) to 1 (heavily congested)
    pub congestion_value: f64,
    /// Time-weighted end-to-end frame latency (s)
    pub avg_frame_total_latency: f64,
    /// Client decode throughput (pixels/s), 0 when unknown
    pub avg_decode_speed: f64,
    /// Recent client decode throughput (pixels/s)
    pub recent_decode_speed: f64,
    /// Raw to compressed size ratio, 0 when unknown
    pub avg_compression_ratio: f64,
}

impl Default for GlobalAverages {
    fn default() -> Self {
        Self {
            min_client_latency: DEFAULT_LATENCY,
            avg_client_latency: DEFAULT_LATENCY,
            recent_client_latency: DEFAULT_LATENCY,
            min_client_ping_latency: DEFAULT_LATENCY,
            avg_client_ping_latency: DEFAULT_LATENCY,
            recent_client_ping_latency: DEFAULT_LATENCY,
            min_server_ping_latency: DEFAULT_LATENCY,
            avg_server_ping_latency: DEFAULT_LATENCY,
            recent_server_ping_latency: DEFAULT_LATENCY,
            avg_congestion_send_speed: 0.0,
            congestion_value: 0.0,
            avg_frame_total_latency: 0.0,
            avg_decode_speed: 0.0,
            recent_decode_speed: 0.0,
            avg_compression_ratio: 0.0,
        }
    }
}

/// Zero-copy transport area usage
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ZeroCopyArea {
    /// Total size in bytes
    pub size: u64,
    /// Free bytes
    pub free: u64,
}

/// Serializable diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatsInfo {
    /// Derived averages at the last refresh
    pub averages: GlobalAverages,
    /// Client latency samples held
    pub client_latency_samples: usize,
    /// Ping samples held (client + server)
    pub ping_samples: usize,
    /// Congestion events held
    pub congestion_events: usize,
    /// Zero-copy area, if the transport has one
    pub zero_copy: Option<ZeroCopyArea>,
}

/// Per-connection statistics aggregator
#[derive(Debug)]
pub struct GlobalStats {
    client_latency: SampleSeries<LatencySample>,
    client_ping_latency: SampleSeries<Sample>,
    server_ping_latency: SampleSeries<Sample>,
    packet_qsizes: SampleSeries<Sample>,
    damage_packet_qpixels: SampleSeries<WindowSample>,
    compression_work_qsizes: SampleSeries<Sample>,
    congestion_events: SampleSeries<Sample>,
    congestion_send_speed: SampleSeries<SizedSample>,
    frame_total_latency: SampleSeries<LatencySample>,
    client_decode_time: SampleSeries<SizedSample>,
    compression_ratios: SampleSeries<SizedSample>,
    zero_copy: RwLock<Option<ZeroCopyArea>>,
    averages: RwLock<GlobalAverages>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

fn global_series<T: Clone>() -> SampleSeries<T> {
    SampleSeries::new(GLOBAL_SERIES_CAPACITY)
}

impl GlobalStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self {
            client_latency: global_series(),
            client_ping_latency: global_series(),
            server_ping_latency: global_series(),
            packet_qsizes: global_series(),
            damage_packet_qpixels: global_series(),
            compression_work_qsizes: global_series(),
            congestion_events: global_series(),
            congestion_send_speed: global_series(),
            frame_total_latency: global_series(),
            client_decode_time: global_series(),
            compression_ratios: global_series(),
            zero_copy: RwLock::new(None),
            averages: RwLock::new(GlobalAverages::default()),
        }
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Client acknowledged a frame `latency` seconds after it was sent
    pub fn record_client_latency(&self, window_id: u32, pixels: u64, latency: f64, now: Instant) {
        trace!("client latency wid={} pixels={} {:.1}ms", window_id, pixels, latency * 1000.0);
        self.client_latency.push(LatencySample {
            at: now,
            window_id,
            pixels,
            latency,
        });
    }

    /// Round trip of a ping initiated by the server
    pub fn record_client_ping(&self, latency: f64, now: Instant) {
        self.client_ping_latency.push(Sample::new(now, latency));
    }

    /// Round trip of a ping initiated by the client
    pub fn record_server_ping(&self, latency: f64, now: Instant) {
        self.server_ping_latency.push(Sample::new(now, latency));
    }

    /// Depth of the outgoing packet queue
    pub fn record_packet_queue_size(&self, size: usize, now: Instant) {
        self.packet_qsizes.push(Sample::new(now, size as f64));
    }

    /// Pixels waiting in the outgoing queue for one window
    pub fn record_damage_packet_pixels(&self, window_id: u32, pixels: u64, now: Instant) {
        self.damage_packet_qpixels.push(WindowSample {
            at: now,
            window_id,
            value: pixels as f64,
        });
    }

    /// Depth of the compression work queue
    pub fn record_compression_queue_size(&self, size: usize, now: Instant) {
        self.compression_work_qsizes.push(Sample::new(now, size as f64));
    }

    /// The transport reported a late send; `lateness` is a 0..1 ratio
    pub fn record_congestion_event(&self, lateness: f64, now: Instant) {
        debug!("congestion event, lateness={:.2}", lateness);
        self.congestion_events.push(Sample::new(now, lateness));
    }

    /// `bytes` were sent in `elapsed` seconds while congested
    pub fn record_congestion_send(&self, bytes: u64, elapsed: f64, now: Instant) {
        self.congestion_send_speed
            .push(SizedSample::new(now, bytes as f64, elapsed));
    }

    /// End-to-end latency of a frame, from damage to client paint
    pub fn record_frame_latency(&self, window_id: u32, pixels: u64, latency: f64, now: Instant) {
        self.frame_total_latency.push(LatencySample {
            at: now,
            window_id,
            pixels,
            latency,
        });
    }

    /// Client decoded `pixels` in `decode_secs`
    pub fn record_decode_time(&self, pixels: u64, decode_secs: f64, now: Instant) {
        self.client_decode_time
            .push(SizedSample::new(now, pixels as f64, decode_secs));
    }

    /// An encoder turned `raw_bytes` into `compressed_bytes`
    pub fn record_compression(&self, raw_bytes: u64, compressed_bytes: u64, now: Instant) {
        self.compression_ratios
            .push(SizedSample::new(now, raw_bytes as f64, compressed_bytes as f64));
    }

    /// Update zero-copy area usage (`None` when the transport has none)
    pub fn set_zero_copy_area(&self, area: Option<ZeroCopyArea>) {
        *self.zero_copy.write() = area;
    }

    /// Queued pixel samples for one window
    pub fn damage_packet_pixels(&self, window_id: u32) -> Vec<Sample> {
        self.damage_packet_qpixels
            .snapshot()
            .into_iter()
            .filter(|s| s.window_id == window_id)
            .map(Sample::from)
            .collect()
    }

    // =========================================================================
    // Derived values
    // =========================================================================

    /// Snapshot of the derived values from the last refresh
    pub fn averages(&self) -> GlobalAverages {
        self.averages.read().clone()
    }

    /// Recompute every derived value from the current samples
    pub fn update_averages(&self, now: Instant) {
        let mut averages = GlobalAverages::default();

        let latencies: Vec<Sample> = self
            .client_latency
            .snapshot()
            .into_iter()
            .map(Sample::from)
            .collect();
        if let Some((min, avg, recent)) = min_avg_recent(&latencies, now) {
            averages.min_client_latency = min;
            averages.avg_client_latency = avg;
            averages.recent_client_latency = recent;
        }

        if let Some((min, avg, recent)) = min_avg_recent(&self.client_ping_latency.snapshot(), now)
        {
            averages.min_client_ping_latency = min;
            averages.avg_client_ping_latency = avg;
            averages.recent_client_ping_latency = recent;
        }

        if let Some((min, avg, recent)) = min_avg_recent(&self.server_ping_latency.snapshot(), now)
        {
            averages.min_server_ping_latency = min;
            averages.avg_server_ping_latency = avg;
            averages.recent_server_ping_latency = recent;
        }

        if let Ok((avg, _)) =
            timesize_weighted_average(&self.congestion_send_speed.snapshot(), now, 1.0)
        {
            averages.avg_congestion_send_speed = avg;
        }
        averages.congestion_value = self.congestion_value(now);

        let frame: Vec<Sample> = self
            .frame_total_latency
            .snapshot()
            .into_iter()
            .map(Sample::from)
            .collect();
        if let Ok((avg, _)) = time_weighted_average(&frame, now) {
            averages.avg_frame_total_latency = avg;
        }

        if let Ok((avg, recent)) =
            timesize_weighted_average(&self.client_decode_time.snapshot(), now, 1.0)
        {
            averages.avg_decode_speed = avg;
            averages.recent_decode_speed = recent;
        }

        if let Ok((avg, _)) = timesize_weighted_average(&self.compression_ratios.snapshot(), now, 1.0)
        {
            averages.avg_compression_ratio = avg;
        }

        debug!(
            "global averages: latency min={:.1}ms avg={:.1}ms recent={:.1}ms congestion={:.2}",
            averages.min_client_latency * 1000.0,
            averages.avg_client_latency * 1000.0,
            averages.recent_client_latency * 1000.0,
            averages.congestion_value
        );
        *self.averages.write() = averages;
    }

    /// Decaying count of recent congestion events, capped at 1
    fn congestion_value(&self, now: Instant) -> f64 {
        let total: f64 = self
            .congestion_events
            .snapshot()
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) <= CONGESTION_WINDOW)
            .map(|s| {
                let age = now.saturating_duration_since(s.at).as_secs_f64();
                s.value.clamp(0.0, 1.0).max(0.1) / (1.0 + age)
            })
            .sum();
        (total / CONGESTION_WINDOW.as_secs_f64()).min(1.0)
    }

    /// Factors describing connection-wide pressure
    ///
    /// `pixel_count` is the size of one frame of the window asking, used to
    /// normalize queued pixel counts.
    pub fn get_factors(&self, pixel_count: u64, now: Instant) -> Vec<Result<Factor>> {
        let avg = self.averages();
        let mut factors = Vec::with_capacity(8);

        if !self.client_latency.is_empty() {
            let l = 0.005 + avg.min_client_latency;
            let wm = log2p(l / 0.020);
            factors.push(for_target(
                "client-latency",
                l,
                avg.avg_client_latency,
                avg.recent_client_latency,
                TargetParams::default()
                    .aim(0.8)
                    .slope(0.005)
                    .smoothing(Smoothing::Sqrt)
                    .weight_multiplier(wm),
            ));
        }
        if !self.client_ping_latency.is_empty() {
            let l = 0.005 + avg.min_client_ping_latency;
            factors.push(for_target(
                "client-ping-latency",
                l,
                avg.avg_client_ping_latency,
                avg.recent_client_ping_latency,
                TargetParams::default()
                    .aim(0.95)
                    .slope(0.005)
                    .smoothing(Smoothing::Sqrt)
                    .weight_multiplier(log2p(l / 0.050)),
            ));
        }
        if !self.server_ping_latency.is_empty() {
            let l = 0.005 + avg.min_server_ping_latency;
            factors.push(for_target(
                "server-ping-latency",
                l,
                avg.avg_server_ping_latency,
                avg.recent_server_ping_latency,
                TargetParams::default()
                    .aim(0.95)
                    .slope(0.005)
                    .smoothing(Smoothing::Sqrt)
                    .weight_multiplier(log2p(l / 0.050)),
            ));
        }

        factors.push(queue_inspect(
            "packet-queue-size",
            &self.packet_qsizes.snapshot(),
            now,
            1.0,
            Smoothing::Log,
        ));
        let queued_pixels: Vec<Sample> = self
            .damage_packet_qpixels
            .snapshot()
            .into_iter()
            .map(Sample::from)
            .collect();
        factors.push(queue_inspect(
            "packet-queue-pixels",
            &queued_pixels,
            now,
            pixel_count.max(1) as f64,
            Smoothing::Sqrt,
        ));
        factors.push(queue_inspect(
            "compression-work-queue",
            &self.compression_work_qsizes.snapshot(),
            now,
            1.0,
            Smoothing::Log,
        ));

        if let Some(area) = *self.zero_copy.read() {
            if area.size > 0 {
                let full = 1.0 - area.free.min(area.size) as f64 / area.size as f64;
                factors.push(Factor::new(
                    "zero-copy-area",
                    format!("{}% full", (full * 100.0) as u32),
                    log2p(3.0 * full),
                    (3.0 * full).powi(2),
                ));
            }
        }

        if avg.congestion_value > 0.0 {
            factors.push(Factor::new(
                "congestion",
                format!("value={:.3}", avg.congestion_value),
                1.0 + avg.congestion_value,
                avg.congestion_value * 10.0,
            ));
        }

        factors
    }

    /// Diagnostics snapshot
    pub fn info(&self) -> GlobalStatsInfo {
        GlobalStatsInfo {
            averages: self.averages(),
            client_latency_samples: self.client_latency.len(),
            ping_samples: self.client_ping_latency.len() + self.server_ping_latency.len(),
            congestion_events: self.congestion_events.len(),
            zero_copy: *self.zero_copy.read(),
        }
    }

    /// Refresh the derived values every `interval` until the handle is aborted
    pub fn spawn_refresher(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.update_averages(Instant::now());
            }
        })
    }
}

fn min_avg_recent(samples: &[Sample], now: Instant) -> Option<(f64, f64, f64)> {
    let (avg, recent) = time_weighted_average(samples, now).ok()?;
    let min = samples
        .iter()
        .map(|s| s.value)
        .fold(f64::INFINITY, f64::min);
    Some((min, avg, recent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FactorSet;

    fn weighted(stats: &GlobalStats, now: Instant) -> FactorSet {
        let mut set = FactorSet::new();
        set.extend(stats.get_factors(1024 * 768, now));
        set
    }

    #[test]
    fn test_defaults_without_samples() {
        let stats = GlobalStats::new();
        stats.update_averages(Instant::now());
        let avg = stats.averages();
        assert_eq!(avg.min_client_latency, DEFAULT_LATENCY);
        assert_eq!(avg.congestion_value, 0.0);
    }

    #[test]
    fn test_series_bounded_per_kind() {
        let stats = GlobalStats::new();
        let base = Instant::now();
        for i in 0..(GLOBAL_SERIES_CAPACITY as u64 + 20) {
            let now = base + Duration::from_millis(i);
            stats.record_client_latency(1, 1000, 0.020, now);
            stats.record_decode_time(1000, 0.002, now);
            stats.record_compression(4000, 400, now);
        }
        stats.record_client_ping(0.010, base);

        let info = stats.info();
        assert_eq!(info.client_latency_samples, GLOBAL_SERIES_CAPACITY);
        assert_eq!(info.ping_samples, 1);
        assert_eq!(stats.client_decode_time.len(), GLOBAL_SERIES_CAPACITY);
        assert_eq!(stats.compression_ratios.len(), GLOBAL_SERIES_CAPACITY);
    }

    #[test]
    fn test_starved_stats_produce_no_weighted_factors() {
        let stats = GlobalStats::new();
        let now = Instant::now();
        stats.update_averages(now);
        assert!(weighted(&stats, now).is_empty());
    }

    #[test]
    fn test_latency_averages() {
        let stats = GlobalStats::new();
        let base = Instant::now();
        for i in 0..10 {
            stats.record_client_latency(1, 1000, 0.020, base + Duration::from_millis(i * 100));
        }
        stats.record_client_latency(1, 1000, 0.200, base + Duration::from_secs(1));
        let now = base + Duration::from_secs(1);
        stats.update_averages(now);

        let avg = stats.averages();
        assert!((avg.min_client_latency - 0.020).abs() < 1e-9);
        assert!(avg.recent_client_latency > avg.avg_client_latency);
    }

    #[test]
    fn test_rising_latency_pushes_factor_up() {
        let stats = GlobalStats::new();
        let base = Instant::now();
        for i in 0..20 {
            stats.record_client_latency(1, 1000, 0.010, base + Duration::from_millis(i * 50));
        }
        for i in 0..5 {
            stats.record_client_latency(1, 1000, 0.300, base + Duration::from_millis(1000 + i * 10));
        }
        let now = base + Duration::from_millis(1050);
        stats.update_averages(now);

        let set = weighted(&stats, now);
        let latency = set
            .factors()
            .iter()
            .find(|f| f.name() == "client-latency")
            .expect("client-latency factor");
        assert!(latency.factor() > 1.0);
    }

    #[test]
    fn test_congestion_factor() {
        let stats = GlobalStats::new();
        let now = Instant::now();
        for _ in 0..5 {
            stats.record_congestion_event(1.0, now);
        }
        stats.update_averages(now);
        assert!(stats.averages().congestion_value > 0.0);

        let set = weighted(&stats, now);
        assert!(set.factors().iter().any(|f| f.name() == "congestion"));
    }

    #[test]
    fn test_zero_copy_area_factor() {
        let stats = GlobalStats::new();
        stats.set_zero_copy_area(Some(ZeroCopyArea {
            size: 1000,
            free: 100,
        }));
        let set = weighted(&stats, Instant::now());
        let f = set
            .factors()
            .iter()
            .find(|f| f.name() == "zero-copy-area")
            .expect("zero-copy factor");
        assert!(f.factor() > 1.0);
    }

    #[test]
    fn test_damage_packet_pixels_per_window() {
        let stats = GlobalStats::new();
        let now = Instant::now();
        stats.record_damage_packet_pixels(1, 100, now);
        stats.record_damage_packet_pixels(2, 200, now);
        stats.record_damage_packet_pixels(1, 300, now);
        let w1 = stats.damage_packet_pixels(1);
        assert_eq!(w1.len(), 2);
        assert_eq!(w1[1].value, 300.0);
    }

    #[test]
    fn test_decode_speed() {
        let stats = GlobalStats::new();
        let now = Instant::now();
        stats.record_decode_time(1_000_000, 0.1, now);
        stats.update_averages(now);
        assert!((stats.averages().avg_decode_speed - 10_000_000.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_updates_averages() {
        let stats = Arc::new(GlobalStats::new());
        stats.record_client_ping(0.040, Instant::now());

        let handle = Arc::clone(&stats).spawn_refresher(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.abort();

        assert!((stats.averages().min_client_ping_latency - 0.040).abs() < 1e-9);
    }
}

//! Per-window statistics
//!
//! Owned by a single window encode context; no internal locking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, trace};

use super::factor::Factor;
use super::primitives::{for_average, log2p, time_weighted_average, timesize_weighted_average};
use super::series::{RingBuffer, Sample, SizedSample, WINDOW_SERIES_CAPACITY};
use super::Result;
use crate::damage::{DamageEvent, DamageHistory, Rectangle, DEFAULT_HISTORY_CAPACITY};

/// Latency assumed for a window that has not encoded anything yet (s)
pub const DEFAULT_WINDOW_LATENCY: f64 = 0.1;

/// Lowest target latency we will ever aim for (s)
pub const ABS_MIN_LATENCY: f64 = 0.010;

/// Bytes sent within this window count towards the bandwidth estimate
const BANDWIDTH_WINDOW: Duration = Duration::from_secs(2);

/// One encoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingSample {
    /// When the encode finished
    pub at: Instant,
    /// Encoding name
    pub encoding: String,
    /// Pixels encoded
    pub pixels: u64,
    /// Bits per pixel of the raw input
    pub bpp: u32,
    /// Output size in bytes
    pub compressed_size: u64,
    /// Encode duration (s)
    pub encode_time: f64,
}

#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    sent_at: Instant,
    pixels: u64,
    bytes: u64,
}

/// Frames sent but not yet acknowledged by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientBacklog {
    /// Number of frames
    pub packets: usize,
    /// Pixels in those frames
    pub pixels: u64,
    /// Bytes in those frames
    pub bytes: u64,
}

/// Serializable diagnostics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct WindowStatsInfo {
    /// Damage events ever recorded
    pub damage_events: u64,
    /// Frames sent
    pub packets_sent: u64,
    /// Average damage-to-encode latency (s)
    pub avg_damage_in_latency: f64,
    /// Average encode-to-send latency (s)
    pub avg_damage_out_latency: f64,
    /// Client decode throughput (pixels/s)
    pub avg_decode_speed: f64,
    /// Raw to compressed ratio, averaged
    pub avg_compression_ratio: f64,
    /// Raw to compressed ratio, recent
    pub recent_compression_ratio: f64,
    /// Latency the controller aims for (s)
    pub target_latency: f64,
    /// Unacknowledged frames
    pub backlog: ClientBacklog,
}

/// Statistics for one window
#[derive(Debug, Clone)]
pub struct WindowStats {
    damage_in_latency: RingBuffer<SizedSample>,
    damage_out_latency: RingBuffer<SizedSample>,
    client_decode_time: RingBuffer<SizedSample>,
    encoding_stats: RingBuffer<EncodingSample>,
    sent_bytes: RingBuffer<Sample>,
    damage: DamageHistory,
    pending_acks: HashMap<u64, PendingFrame>,
    packets_sent: u64,
    last_resized: Option<Instant>,

    avg_damage_in_latency: f64,
    recent_damage_in_latency: f64,
    avg_damage_out_latency: f64,
    recent_damage_out_latency: f64,
    avg_decode_speed: f64,
    recent_decode_speed: f64,
    avg_compression_ratio: f64,
    recent_compression_ratio: f64,
    target_latency: f64,
}

impl Default for WindowStats {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

fn window_series<T: Clone>() -> RingBuffer<T> {
    RingBuffer::new(WINDOW_SERIES_CAPACITY)
}

impl WindowStats {
    /// Create empty statistics keeping `damage_capacity` damage events
    pub fn new(damage_capacity: usize) -> Self {
        Self {
            damage_in_latency: window_series(),
            damage_out_latency: window_series(),
            client_decode_time: window_series(),
            encoding_stats: window_series(),
            sent_bytes: RingBuffer::new(WINDOW_SERIES_CAPACITY * 2),
            damage: DamageHistory::with_capacity(damage_capacity),
            pending_acks: HashMap::new(),
            packets_sent: 0,
            last_resized: None,
            avg_damage_in_latency: DEFAULT_WINDOW_LATENCY,
            recent_damage_in_latency: DEFAULT_WINDOW_LATENCY,
            avg_damage_out_latency: DEFAULT_WINDOW_LATENCY,
            recent_damage_out_latency: DEFAULT_WINDOW_LATENCY,
            avg_decode_speed: 0.0,
            recent_decode_speed: 0.0,
            avg_compression_ratio: 0.0,
            recent_compression_ratio: 0.0,
            target_latency: DEFAULT_WINDOW_LATENCY,
        }
    }

    /// Forget everything except the damage event total
    pub fn reset(&mut self) {
        let capacity = self.damage.capacity();
        let total_damage = std::mem::take(&mut self.damage);
        *self = Self::new(capacity);
        self.damage = total_damage;
        self.damage.clear();
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Record a damage event
    pub fn record_damage(&mut self, rect: Rectangle, now: Instant) {
        self.damage.push(DamageEvent::new(now, rect));
    }

    /// Record a window resize
    pub fn record_resize(&mut self, now: Instant) {
        self.last_resized = Some(now);
    }

    /// Time between damage and the start of compression
    pub fn record_damage_in_latency(&mut self, pixels: u64, latency: f64, now: Instant) {
        self.damage_in_latency
            .push(SizedSample::new(now, pixels as f64, latency));
    }

    /// Time between the end of compression and the frame leaving the socket
    pub fn record_damage_out_latency(&mut self, pixels: u64, latency: f64, now: Instant) {
        self.damage_out_latency
            .push(SizedSample::new(now, pixels as f64, latency));
    }

    /// An encoder produced a frame
    pub fn record_encoding(&mut self, sample: EncodingSample) {
        trace!(
            "encoded {} {} pixels -> {} bytes in {:.1}ms",
            sample.encoding,
            sample.pixels,
            sample.compressed_size,
            sample.encode_time * 1000.0
        );
        self.encoding_stats.push(sample);
    }

    /// A frame was handed to the transport
    pub fn record_frame_sent(&mut self, sequence: u64, pixels: u64, bytes: u64, now: Instant) {
        self.packets_sent += 1;
        self.sent_bytes.push(Sample::new(now, bytes as f64));
        self.pending_acks.insert(
            sequence,
            PendingFrame {
                sent_at: now,
                pixels,
                bytes,
            },
        );
    }

    /// The client acknowledged a frame after decoding it in `decode_secs`
    ///
    /// Returns the frame's pixel count and round-trip latency, or `None` for
    /// an unknown sequence number.
    pub fn record_client_ack(
        &mut self,
        sequence: u64,
        decode_secs: f64,
        now: Instant,
    ) -> Option<(u64, f64)> {
        let frame = self.pending_acks.remove(&sequence)?;
        if decode_secs > 0.0 {
            self.client_decode_time
                .push(SizedSample::new(now, frame.pixels as f64, decode_secs));
        }
        let latency = now.saturating_duration_since(frame.sent_at).as_secs_f64();
        Some((frame.pixels, latency))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Damage history
    pub fn damage(&self) -> &DamageHistory {
        &self.damage
    }

    /// Damage events ever recorded
    pub fn damage_events_count(&self) -> u64 {
        self.damage.total()
    }

    /// Time of the last resize
    pub fn last_resized(&self) -> Option<Instant> {
        self.last_resized
    }

    /// Average damage-to-encode latency (s)
    pub fn avg_damage_in_latency(&self) -> f64 {
        self.avg_damage_in_latency
    }

    /// Client decode throughput (pixels/s), 0 when unknown
    pub fn avg_decode_speed(&self) -> f64 {
        self.avg_decode_speed
    }

    /// (average, recent) raw to compressed ratio, 0 when unknown
    pub fn compression_ratios(&self) -> (f64, f64) {
        (self.avg_compression_ratio, self.recent_compression_ratio)
    }

    /// Latency the controller aims for (s)
    pub fn target_latency(&self) -> f64 {
        self.target_latency
    }

    /// Frames sent but not yet acknowledged
    pub fn client_backlog(&self) -> ClientBacklog {
        self.pending_acks
            .values()
            .fold(ClientBacklog::default(), |mut acc, f| {
                acc.packets += 1;
                acc.pixels += f.pixels;
                acc.bytes += f.bytes;
                acc
            })
    }

    /// Outgoing bit rate over the last couple of seconds
    pub fn send_rate_bps(&self, now: Instant) -> f64 {
        let bytes: f64 = self
            .sent_bytes
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) <= BANDWIDTH_WINDOW)
            .map(|s| s.value)
            .sum();
        bytes * 8.0 / BANDWIDTH_WINDOW.as_secs_f64()
    }

    // =========================================================================
    // Derived values
    // =========================================================================

    /// Recompute the derived averages
    pub fn update_averages(&mut self, now: Instant) {
        let latency = |buf: &RingBuffer<SizedSample>| -> Vec<Sample> {
            buf.iter().map(|s| Sample::new(s.at, s.elapsed)).collect()
        };
        if let Ok((avg, recent)) = time_weighted_average(&latency(&self.damage_in_latency), now) {
            self.avg_damage_in_latency = avg;
            self.recent_damage_in_latency = recent;
        }
        if let Ok((avg, recent)) = time_weighted_average(&latency(&self.damage_out_latency), now) {
            self.avg_damage_out_latency = avg;
            self.recent_damage_out_latency = recent;
        }
        if let Ok((avg, recent)) =
            timesize_weighted_average(&self.client_decode_time.to_vec(), now, 1.0)
        {
            self.avg_decode_speed = avg;
            self.recent_decode_speed = recent;
        }

        let ratios: Vec<SizedSample> = self
            .encoding_stats
            .iter()
            .filter(|e| e.compressed_size > 0)
            .map(|e| {
                let raw = e.pixels as f64 * e.bpp.max(1) as f64 / 8.0;
                SizedSample::new(e.at, raw, e.compressed_size as f64)
            })
            .collect();
        if let Ok((avg, recent)) = timesize_weighted_average(&ratios, now, 1.0) {
            self.avg_compression_ratio = avg;
            self.recent_compression_ratio = recent;
        }
    }

    /// Set the latency the controller aims for
    ///
    /// Somewhere between the best latency the client has shown and its
    /// average, plus the time the client needs to decode one frame.
    pub fn update_target_latency(&mut self, min_client: f64, avg_client: f64, frame_pixels: u64) {
        let min_l = ABS_MIN_LATENCY.max(min_client) * 1.2;
        let avg_l = min_l.max(avg_client);
        let max_l = 2.0 * min_l;
        let mut target = ABS_MIN_LATENCY.max(max_l.min((min_l * avg_l).sqrt()));
        if self.avg_decode_speed > 0.0 {
            target += (frame_pixels as f64 / self.avg_decode_speed).min(1.0);
        }
        self.target_latency = target;
    }

    /// Longest latency we consider normal before reading silence as idleness
    fn max_latency(&self) -> f64 {
        self.target_latency + self.recent_damage_in_latency + self.recent_damage_out_latency
    }

    /// Factors derived from this window's own history
    pub fn get_factors(&self, bandwidth_limit: u64, now: Instant) -> Vec<Result<Factor>> {
        let mut factors = Vec::with_capacity(4);

        if !self.damage_in_latency.is_empty() && !self.damage_out_latency.is_empty() {
            let ad = (0.040 + self.avg_damage_out_latency - self.avg_damage_in_latency).max(0.010);
            let rd =
                (0.040 + self.recent_damage_out_latency - self.recent_damage_in_latency).max(0.010);
            factors.push(for_average("damage-network-delay", ad, rd, 0.5, 1.0));
        }

        if self.avg_decode_speed > 0.0 && self.recent_decode_speed > 0.0 {
            // slower recent decoding must push the delay up
            factors.push(for_average(
                "client-decode-speed",
                self.recent_decode_speed,
                self.avg_decode_speed,
                0.0,
                1.0,
            ));
        }

        if let Some(last) = self.damage.last() {
            let elapsed = now.saturating_duration_since(last.at).as_secs_f64();
            let mtime = (elapsed - 2.0 * self.max_latency()).max(0.0);
            factors.push(Factor::new(
                "damage-rate",
                format!(
                    "elapsed={}ms max_latency={}ms",
                    (elapsed * 1000.0) as u64,
                    (self.max_latency() * 1000.0) as u64
                ),
                (1.0 - mtime).max(0.0),
                mtime.sqrt(),
            ));
        }

        if bandwidth_limit > 0 {
            let ratio = self.send_rate_bps(now) / bandwidth_limit as f64;
            let weight = if ratio < 1.0 { ratio * 0.25 } else { ratio.min(4.0) };
            debug!("bandwidth usage at {:.0}% of limit", ratio * 100.0);
            factors.push(Factor::new(
                "bandwidth-limit",
                format!("used={:.0}% of {}bps", ratio * 100.0, bandwidth_limit),
                log2p(ratio),
                weight,
            ));
        }

        factors
    }

    /// Diagnostics snapshot
    pub fn info(&self) -> WindowStatsInfo {
        WindowStatsInfo {
            damage_events: self.damage.total(),
            packets_sent: self.packets_sent,
            avg_damage_in_latency: self.avg_damage_in_latency,
            avg_damage_out_latency: self.avg_damage_out_latency,
            avg_decode_speed: self.avg_decode_speed,
            avg_compression_ratio: self.avg_compression_ratio,
            recent_compression_ratio: self.recent_compression_ratio,
            target_latency: self.target_latency,
            backlog: self.client_backlog(),
        }
    }
}

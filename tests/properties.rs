//! Property tests for the numeric and geometric building blocks

use std::time::{Duration, Instant};

use proptest::prelude::*;

use lamco_video_governor::config::{BatchConfig, ScalingConfig, VideoRegionConfig};
use lamco_video_governor::damage::{DamageEvent, Rectangle};
use lamco_video_governor::performance::BatchState;
use lamco_video_governor::pipeline::{ScalingAdvisor, ScalingContext};
use lamco_video_governor::stats::{logp, timesize_weighted_average, Factor, SizedSample};
use lamco_video_governor::video::VideoRegionDetector;

fn rect() -> impl Strategy<Value = Rectangle> {
    (0u32..2000, 0u32..2000, 1u32..1000, 1u32..1000)
        .prop_map(|(x, y, w, h)| Rectangle::new(x, y, w, h))
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

proptest! {
    #[test]
    fn logp_stays_in_unit_interval(x in 0.0f64..1e12) {
        let v = logp(x);
        prop_assert!(v > 0.0 && v < 1.0, "logp({}) = {}", x, v);
    }

    #[test]
    fn timesize_constant_rate(
        rate in 0.1f64..1e6,
        sizes in prop::collection::vec(1.0f64..1e6, 1..30),
        ages_ms in prop::collection::vec(0u64..86_400_000, 30),
    ) {
        let now = Instant::now() + Duration::from_secs(86_400);
        let samples: Vec<SizedSample> = sizes
            .iter()
            .zip(&ages_ms)
            .map(|(&size, &age)| SizedSample::new(now - Duration::from_millis(age), size, size / rate))
            .collect();
        let (avg, recent) = timesize_weighted_average(&samples, now, 1.0).unwrap();
        prop_assert!(close(avg, rate), "avg {} != {}", avg, rate);
        prop_assert!(close(recent, rate), "recent {} != {}", recent, rate);
    }

    #[test]
    fn intersection_commutes(a in rect(), b in rect()) {
        prop_assert_eq!(a.intersection(&b), b.intersection(&a));
    }

    #[test]
    fn subtraction_partitions_area(a in rect(), b in rect()) {
        let pieces: u64 = a.subtract(&b).iter().map(Rectangle::area).sum();
        let common = a.intersection(&b).map_or(0, |r| r.area());
        prop_assert_eq!(pieces + common, a.area());
    }

    #[test]
    fn containment(a in rect(), b in rect()) {
        prop_assert!(a.contains_rect(&a));
        if a.contains_rect(&b) && b.contains_rect(&a) {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn scaling_fits_bounds(
        width in 1u32..16384,
        height in 1u32..16384,
        max_width in 1024u32..8192,
        max_height in 768u32..8192,
        quality in 0u8..=100,
        speed in 0u8..=100,
        fps in 0u32..120,
        damage_events in 0u64..1000,
    ) {
        let advisor = ScalingAdvisor::new(ScalingConfig::default());
        let ctx = ScalingContext {
            quality,
            speed,
            fps,
            damage_events,
            ..Default::default()
        };
        if let Ok(ratio) = advisor.scale(width, height, max_width, max_height, &ctx) {
            prop_assert!(ratio.apply(width) <= max_width);
            prop_assert!(ratio.apply(height) <= max_height);
            prop_assert!(ratio.as_f64() <= 1.0);
            prop_assert!(ratio.as_f64() >= 0.1);
        }
    }

    #[test]
    fn batch_delay_within_bounds(
        factors in prop::collection::vec((0.0f64..1e9, 0.0f64..1e9), 0..12),
    ) {
        let config = BatchConfig::default();
        let mut state = BatchState::new(&config);
        let before = state.delay();
        let factors: Vec<Factor> = factors
            .into_iter()
            .map(|(f, w)| Factor::new("p", "", f, w).unwrap())
            .collect();
        let weighted = factors.iter().any(|f| f.weight() > 0.0);

        let changed = state.update_delay(factors, 0.0, Instant::now());
        let delay = state.delay();
        prop_assert!(delay.is_finite());
        prop_assert!(delay >= config.min_delay_ms && delay <= config.max_delay_ms);
        if !weighted {
            prop_assert!(!changed);
            prop_assert_eq!(delay, before);
        }
    }

    #[test]
    fn full_window_never_selected(count in 20usize..150) {
        let mut detector = VideoRegionDetector::new(VideoRegionConfig::default());
        let start = Instant::now();
        let events: Vec<DamageEvent> = (0..count)
            .map(|i| DamageEvent::new(start + Duration::from_millis(20 * i as u64), Rectangle::full(1024, 768)))
            .collect();
        let now = start + Duration::from_millis(20 * count as u64);
        detector.identify(1024, 768, count as u64, &events, now);
        prop_assert_eq!(detector.rectangle(), None);
    }
}

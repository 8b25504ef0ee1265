//! Weighted averages and factor generators
//!
//! # Algorithm
//!
//! Samples are weighted by age so that the "average" tracks the last few
//! seconds while the "recent" value tracks the last few hundred ms:
//!
//! ```text
//!   avg weight    = 1 / (1 + age² / 10)
//!   recent weight = 1 / (1 + age² / 0.1)
//! ```
//!
//! The comparators then turn (target, avg, recent) into a [`Factor`]:
//!
//! ```text
//!   target_factor = (recent/div) / (slope + target/div)
//!   avg_factor    = (recent/div) / (slope + avg/div)
//!   factor        = smooth(target_factor·(1-aim) + avg_factor·aim)
//!   weight        = smooth(max(0, 1-factor, factor-1)) · multiplier
//! ```

use std::time::Instant;

use super::factor::Factor;
use super::series::{Sample, SizedSample};
use super::{Result, StatsError};

/// Keeps [`logp`] strictly positive at zero
pub const LOGP_EPSILON: f64 = 1e-6;

/// Decay for the "average" half of [`time_weighted_average`] (seconds²)
pub const AVG_DECAY: f64 = 10.0;

/// Decay for the "recent" half of [`time_weighted_average`] (seconds²)
pub const RECENT_DECAY: f64 = 0.1;

/// Saturating log-shaped map into (0, 1)
///
/// Monotonic, strictly positive at zero and close to 0.5 at one. Negative
/// and NaN inputs are treated as zero.
pub fn logp(x: f64) -> f64 {
    let x = if x.is_nan() || x < 0.0 { 0.0 } else { x.min(f64::MAX) };
    let l = (1.0 + x).log2() + LOGP_EPSILON;
    l / (1.0 + l)
}

/// `log2(1 + x)`, unbounded; maps 1 to the neutral factor 1
pub fn log2p(x: f64) -> f64 {
    let x = if x.is_nan() || x < 0.0 { 0.0 } else { x };
    (1.0 + x).log2()
}

/// Curve applied to a raw ratio before it becomes a factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Smoothing {
    /// [`log2p`]
    #[default]
    Log,
    /// Square root
    Sqrt,
    /// Unchanged
    Linear,
}

impl Smoothing {
    /// Apply the curve
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Log => log2p(x),
            Self::Sqrt => x.max(0.0).sqrt(),
            Self::Linear => x,
        }
    }
}

fn age_secs(now: Instant, at: Instant) -> f64 {
    now.saturating_duration_since(at).as_secs_f64()
}

/// Time-decayed (average, recent) of a value series
pub fn time_weighted_average(samples: &[Sample], now: Instant) -> Result<(f64, f64)> {
    if samples.is_empty() {
        return Err(StatsError::EmptySamples);
    }

    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for s in samples {
        let age = age_secs(now, s.at);
        let age2 = age * age;
        let w = 1.0 / (1.0 + age2 / AVG_DECAY);
        tv += s.value * w;
        tw += w;
        let w = 1.0 / (1.0 + age2 / RECENT_DECAY);
        rv += s.value * w;
        rw += w;
    }

    if tw <= 0.0 || rw <= 0.0 {
        return Err(StatsError::NoUsableSamples(samples.len()));
    }
    Ok((tv / tw, rv / rw))
}

/// Time-decayed (average, recent) of `size × size_unit / elapsed` rates
///
/// Larger samples count more. Samples with a non-positive elapsed time are
/// skipped.
pub fn timesize_weighted_average(
    samples: &[SizedSample],
    now: Instant,
    size_unit: f64,
) -> Result<(f64, f64)> {
    if samples.is_empty() {
        return Err(StatsError::EmptySamples);
    }

    let size_avg = samples.iter().map(|s| s.size).sum::<f64>() / samples.len() as f64;
    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for s in samples {
        if !(s.elapsed > 0.0) || !s.size.is_finite() {
            continue;
        }
        let pw = if size_avg > 0.0 {
            log2p(s.size / size_avg)
        } else {
            1.0
        };
        let rate = s.size * size_unit / s.elapsed;
        let age = age_secs(now, s.at);

        let w = pw / (1.0 + age);
        tv += w * rate;
        tw += w;
        let w = pw / (0.1 + age * age);
        rv += w * rate;
        rw += w;
    }

    if tw <= 0.0 || rw <= 0.0 {
        return Err(StatsError::NoUsableSamples(samples.len()));
    }
    Ok((tv / tw, rv / rw))
}

/// Time-decayed (average, recent) of `(at, size, value)` triples, larger
/// sizes counting more
pub fn size_weighted_average<I>(samples: I, now: Instant) -> Result<(f64, f64)>
where
    I: IntoIterator<Item = (Instant, f64, f64)>,
{
    let samples: Vec<_> = samples.into_iter().collect();
    if samples.is_empty() {
        return Err(StatsError::EmptySamples);
    }

    let size_avg = samples.iter().map(|s| s.1).sum::<f64>() / samples.len() as f64;
    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for &(at, size, value) in &samples {
        let pw = if size_avg > 0.0 {
            log2p(size / size_avg)
        } else {
            1.0
        };
        let age = age_secs(now, at);
        let w = pw / (1.0 + age);
        tv += w * value;
        tw += w;
        let w = pw / (0.1 + age * age);
        rv += w * value;
        rw += w;
    }

    if tw <= 0.0 || rw <= 0.0 {
        return Err(StatsError::NoUsableSamples(samples.len()));
    }
    Ok((tv / tw, rv / rw))
}

/// Shape of a [`for_target`] comparison
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetParams {
    /// Share of the decision given to the avg/recent trend, in (0, 1)
    pub aim: f64,
    /// Unit divisor for all values
    pub div: f64,
    /// Softens the ratio for values close to zero
    pub slope: f64,
    /// Curve applied to the ratio
    pub smoothing: Smoothing,
    /// Scales the resulting weight
    pub weight_multiplier: f64,
}

impl Default for TargetParams {
    fn default() -> Self {
        Self {
            aim: 0.5,
            div: 1.0,
            slope: 0.1,
            smoothing: Smoothing::Log,
            weight_multiplier: 1.0,
        }
    }
}

impl TargetParams {
    /// Set the aim
    pub fn aim(mut self, aim: f64) -> Self {
        self.aim = aim;
        self
    }

    /// Set the divisor
    pub fn div(mut self, div: f64) -> Self {
        self.div = div;
        self
    }

    /// Set the slope
    pub fn slope(mut self, slope: f64) -> Self {
        self.slope = slope;
        self
    }

    /// Set the smoothing curve
    pub fn smoothing(mut self, smoothing: Smoothing) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Set the weight multiplier
    pub fn weight_multiplier(mut self, m: f64) -> Self {
        self.weight_multiplier = m;
        self
    }
}

fn check_input(metric: &str, input: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(StatsError::InvalidInput {
            name: metric.to_string(),
            input,
            value,
        })
    }
}

/// Factor steering `recent` towards `target`
///
/// A factor above 1 means the metric is above target and the controller
/// should back off; below 1 means there is headroom.
pub fn for_target(
    metric: &str,
    target: f64,
    avg: f64,
    recent: f64,
    params: TargetParams,
) -> Result<Factor> {
    check_input(metric, "target", target)?;
    check_input(metric, "avg", avg)?;
    check_input(metric, "recent", recent)?;
    debug_assert!(params.aim > 0.0 && params.aim < 1.0);
    let aim = params.aim.clamp(0.01, 0.99);
    let d = if params.div > 0.0 { params.div } else { 1.0 };

    let target_factor = (recent / d) / (params.slope + target / d);
    let avg_factor = (recent / d) / (params.slope + avg / d);
    let aimed = target_factor * (1.0 - aim) + avg_factor * aim;
    let factor = params.smoothing.apply(aimed);
    let weight = params
        .smoothing
        .apply((1.0 - factor).max(factor - 1.0).max(0.0))
        * params.weight_multiplier;

    Factor::new(
        metric,
        format!(
            "target={:.3} avg={:.3} recent={:.3} aim={:.2}",
            target, avg, recent, aim
        ),
        factor,
        weight,
    )
}

/// Factor comparing the recent value with its own average
pub fn for_average(
    metric: &str,
    avg: f64,
    recent: f64,
    weight_offset: f64,
    weight_div: f64,
) -> Result<Factor> {
    check_input(metric, "avg", avg)?;
    check_input(metric, "recent", recent)?;
    if avg == 0.0 {
        return Ok(Factor::neutral(metric));
    }
    let factor = log2p(recent / avg);
    let weight = if factor > 0.0 {
        (factor.max(1.0 / factor) - 1.0 + weight_offset).max(0.0) / weight_div.max(f64::MIN_POSITIVE)
    } else {
        0.0
    };
    Factor::new(
        metric,
        format!("avg={:.3} recent={:.3}", avg, recent),
        factor,
        weight,
    )
}

/// Pressure factor for a queue depth series
///
/// An empty series is neutral. Otherwise the weight grows with how full the
/// queue is relative to `div`.
pub fn queue_inspect(
    metric: &str,
    samples: &[Sample],
    now: Instant,
    div: f64,
    smoothing: Smoothing,
) -> Result<Factor> {
    if samples.is_empty() {
        return Ok(Factor::neutral(metric));
    }
    let (avg, recent) = time_weighted_average(samples, now)?;
    let div = if div > 0.0 { div } else { 1.0 };
    let weight_multiplier = (avg.max(recent).max(0.0) / div).sqrt();
    for_target(
        metric,
        1.0,
        avg,
        recent,
        TargetParams::default()
            .aim(0.25)
            .div(div)
            .slope(1.0)
            .smoothing(smoothing)
            .weight_multiplier(weight_multiplier),
    )
}

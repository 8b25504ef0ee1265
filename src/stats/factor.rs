//! Validated controller factors

use serde::Serialize;
use tracing::warn;

use super::{Result, StatsError};

/// Factors whose weight does not exceed this are ignored by [`FactorSet`]
pub const MIN_FACTOR_WEIGHT: f64 = 0.01;

/// One signal feeding the batch delay blend
///
/// Construction validates the values, so a `Factor` in hand is always
/// finite with a non-negative weight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Factor {
    name: String,
    diagnostic: String,
    factor: f64,
    weight: f64,
}

impl Factor {
    /// Create a factor, rejecting non-finite values and negative weights
    pub fn new(
        name: impl Into<String>,
        diagnostic: impl Into<String>,
        factor: f64,
        weight: f64,
    ) -> Result<Self> {
        let name = name.into();
        if !factor.is_finite() || !weight.is_finite() || factor < 0.0 || weight < 0.0 {
            return Err(StatsError::InvalidFactor {
                name,
                factor,
                weight,
            });
        }
        Ok(Self {
            name,
            diagnostic: diagnostic.into(),
            factor,
            weight,
        })
    }

    /// Neutral factor with no weight, used when a generator is starved
    pub fn neutral(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            diagnostic: String::new(),
            factor: 1.0,
            weight: 0.0,
        }
    }

    /// Metric name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form detail for diagnostics
    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }

    /// Multiplier applied to the current delay
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Relative importance in the blend
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Same factor with its weight scaled
    pub fn scaled(mut self, multiplier: f64) -> Result<Self> {
        let weight = self.weight * multiplier;
        if !weight.is_finite() || weight < 0.0 {
            return Err(StatsError::InvalidFactor {
                name: self.name,
                factor: self.factor,
                weight,
            });
        }
        self.weight = weight;
        Ok(self)
    }
}

/// Collects factors from several generators
///
/// Invalid factors are logged and dropped; factors with negligible weight
/// are skipped.
#[derive(Debug, Clone, Default)]
pub struct FactorSet {
    factors: Vec<Factor>,
    dropped: usize,
}

impl FactorSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a generator result
    pub fn add(&mut self, factor: Result<Factor>) {
        match factor {
            Ok(f) if f.weight > MIN_FACTOR_WEIGHT => self.factors.push(f),
            Ok(_) => {}
            Err(e) => {
                warn!("Dropping malformed factor: {}", e);
                self.dropped += 1;
            }
        }
    }

    /// Add several generator results
    pub fn extend<I>(&mut self, factors: I)
    where
        I: IntoIterator<Item = Result<Factor>>,
    {
        for f in factors {
            self.add(f);
        }
    }

    /// Accepted factors
    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// Number of malformed factors dropped so far
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Number of accepted factors
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    /// True when no factor was accepted
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Consume into the accepted factors
    pub fn into_vec(self) -> Vec<Factor> {
        self.factors
    }
}

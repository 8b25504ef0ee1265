//! Configuration management
//!
//! Loads the tuning configuration from a TOML file. Every section and field
//! is optional; missing values fall back to the calibrated defaults.
//!
//! ```toml
//! [batch]
//! min_delay_ms = 5.0
//! max_delay_ms = 15000.0
//!
//! [video_region.thresholds]
//! keep = 125.0
//! shortcut = 120.0
//!
//! [scaling]
//! control = 50
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod types;

pub use types::{
    BatchConfig, LoggingConfig, PipelineConfig, RegionThresholds, ScalingConfig,
    VideoRegionConfig,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Batch delay controller
    #[serde(default)]
    pub batch: BatchConfig,
    /// Video region detector
    #[serde(default)]
    pub video_region: VideoRegionConfig,
    /// Pipeline selector
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Scaling advisor
    #[serde(default)]
    pub scaling: ScalingConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let batch = &self.batch;
        if !(batch.min_delay_ms >= 0.0) || !batch.max_delay_ms.is_finite() {
            anyhow::bail!(
                "Invalid batch delay bounds: {}..{}",
                batch.min_delay_ms,
                batch.max_delay_ms
            );
        }
        if batch.min_delay_ms > batch.max_delay_ms {
            anyhow::bail!(
                "Batch min_delay_ms ({}) exceeds max_delay_ms ({})",
                batch.min_delay_ms,
                batch.max_delay_ms
            );
        }
        if batch.start_delay_ms < batch.min_delay_ms || batch.start_delay_ms > batch.max_delay_ms {
            anyhow::bail!(
                "Batch start_delay_ms ({}) outside {}..{}",
                batch.start_delay_ms,
                batch.min_delay_ms,
                batch.max_delay_ms
            );
        }
        if batch.delay_history == 0 {
            anyhow::bail!("Batch delay_history must be at least 1");
        }

        let region = &self.video_region;
        if region.min_width == 0 || region.min_height == 0 {
            anyhow::bail!(
                "Invalid minimum video region size: {}x{}",
                region.min_width,
                region.min_height
            );
        }
        let t = &region.thresholds;
        for (name, value) in [
            ("shortcut", t.shortcut),
            ("retain", t.retain),
            ("adopt", t.adopt),
            ("union", t.union),
        ] {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("Invalid region threshold {}: {}", name, value);
            }
            if value > t.keep {
                anyhow::bail!(
                    "Region threshold {} ({}) is above the keep threshold ({})",
                    name,
                    value,
                    t.keep
                );
            }
        }
        if t.retain > t.adopt {
            anyhow::bail!(
                "Region retain threshold ({}) must not exceed adopt ({})",
                t.retain,
                t.adopt
            );
        }

        if let Some(control) = self.scaling.control {
            if control > 100 {
                anyhow::bail!("Scaling control must be 0..=100, got {}", control);
            }
        }
        if !(self.scaling.pps_target > 0.0) {
            anyhow::bail!("Scaling pps_target must be positive");
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            _ => anyhow::bail!("Invalid log format: {}", self.logging.format),
        }

        Ok(())
    }
}

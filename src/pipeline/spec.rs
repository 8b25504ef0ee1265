//! Codec capability records
//!
//! Encoders and colorspace converters describe themselves with plain
//! serde records. The selector never hard-codes a codec: everything it
//! knows comes from a [`CodecRegistry`] snapshot loaded from TOML or JSON.
//!
//! ```toml
//! [[encoders]]
//! codec_type = "x264"
//! encoding = "h264"
//! input_formats = ["YUV420P", "YUV444P"]
//! output_colorspaces = ["YUV420P", "YUV444P"]
//! quality = 60
//! speed = 40
//! setup_cost = 30
//!
//! [[converters]]
//! codec_type = "swscale"
//! input_formats = ["BGRX"]
//! output_formats = ["YUV420P", "YUV444P"]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Horizontal and vertical subsampling divisors of each plane
pub type PlaneDivs = [(u32, u32); 3];

/// Subsampling of a planar YUV format, `None` for packed RGB formats
pub fn subsampling_divs(format: &str) -> Option<PlaneDivs> {
    match format {
        "YUV420P" | "NV12" => Some([(1, 1), (2, 2), (2, 2)]),
        "YUV422P" => Some([(1, 1), (2, 1), (2, 1)]),
        "YUV444P" => Some([(1, 1), (1, 1), (1, 1)]),
        _ => None,
    }
}

/// True for formats that drop chroma resolution
pub fn is_subsampled(format: &str) -> bool {
    subsampling_divs(format).is_some_and(|divs| divs.iter().any(|&(x, y)| x > 1 || y > 1))
}

fn default_quality() -> u8 {
    50
}

fn default_speed() -> u8 {
    50
}

fn default_setup_cost() -> u8 {
    50
}

fn default_mask() -> u32 {
    0xFFFF
}

fn default_min_dim() -> u32 {
    8
}

fn default_max_dim() -> u32 {
    4096
}

/// Declared capabilities of a video encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSpec {
    /// Implementation name, e.g. "x264" or "nvenc"
    pub codec_type: String,
    /// Encoding produced, e.g. "h264"
    pub encoding: String,
    /// Pixel formats accepted as input
    pub input_formats: Vec<String>,
    /// Colorspaces the decoder will see
    pub output_colorspaces: Vec<String>,
    /// Declared quality, 0..=100
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Declared speed, 0..=100
    #[serde(default = "default_speed")]
    pub speed: u8,
    /// Relative cost of creating an instance, 0..=100
    #[serde(default = "default_setup_cost")]
    pub setup_cost: u8,
    /// Added to the switch score, negative for codecs to avoid
    #[serde(default)]
    pub score_boost: i32,
    /// Mask applied to the width (e.g. 0xFFFE for even widths)
    #[serde(default = "default_mask")]
    pub width_mask: u32,
    /// Mask applied to the height
    #[serde(default = "default_mask")]
    pub height_mask: u32,
    /// Smallest width accepted
    #[serde(default = "default_min_dim")]
    pub min_width: u32,
    /// Smallest height accepted
    #[serde(default = "default_min_dim")]
    pub min_height: u32,
    /// Largest width accepted
    #[serde(default = "default_max_dim")]
    pub max_width: u32,
    /// Largest height accepted
    #[serde(default = "default_max_dim")]
    pub max_height: u32,
    /// Can downscale its input
    #[serde(default)]
    pub can_scale: bool,
    /// Maximum concurrent instances, unlimited when unset
    #[serde(default)]
    pub max_instances: Option<u32>,
}

impl EncoderSpec {
    /// True when `format` is a valid input
    pub fn accepts(&self, format: &str) -> bool {
        self.input_formats.iter().any(|f| f == format)
    }

    /// True when the encoder accepts this size
    pub fn can_handle(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }
}

/// Declared capabilities of a colorspace converter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterSpec {
    /// Implementation name
    pub codec_type: String,
    /// Pixel formats accepted as input
    pub input_formats: Vec<String>,
    /// Pixel formats it can produce
    pub output_formats: Vec<String>,
    /// Declared quality, 0..=100
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Declared speed, 0..=100
    #[serde(default = "default_speed")]
    pub speed: u8,
    /// Relative cost of creating an instance, 0..=100
    #[serde(default = "default_setup_cost")]
    pub setup_cost: u8,
    /// Width mask
    #[serde(default = "default_mask")]
    pub width_mask: u32,
    /// Height mask
    #[serde(default = "default_mask")]
    pub height_mask: u32,
    /// Smallest width accepted
    #[serde(default = "default_min_dim")]
    pub min_width: u32,
    /// Smallest height accepted
    #[serde(default = "default_min_dim")]
    pub min_height: u32,
    /// Largest width accepted
    #[serde(default = "default_max_dim")]
    pub max_width: u32,
    /// Largest height accepted
    #[serde(default = "default_max_dim")]
    pub max_height: u32,
    /// Can scale while converting
    #[serde(default)]
    pub can_scale: bool,
}

impl ConverterSpec {
    /// True when the converter reads `format`
    pub fn reads(&self, format: &str) -> bool {
        self.input_formats.iter().any(|f| f == format)
    }

    /// True when the converter accepts this input size
    pub fn can_handle(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }
}

/// Immutable snapshot of every codec available to the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodecRegistry {
    /// Video encoders
    #[serde(default)]
    pub encoders: Vec<EncoderSpec>,
    /// Colorspace converters
    #[serde(default)]
    pub converters: Vec<ConverterSpec>,
}

impl CodecRegistry {
    /// Load a registry; `.json` files are read as JSON, anything else as TOML
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read codec registry: {}", path.display()))?;

        if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse codec registry: {}", path.display()))
        } else {
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse codec registry: {}", path.display()))
        }
    }

    /// Parse a TOML registry
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid codec registry")
    }

    /// Encoders producing `encoding`
    pub fn encoders_for<'a>(&'a self, encoding: &'a str) -> impl Iterator<Item = &'a EncoderSpec> {
        self.encoders.iter().filter(move |e| e.encoding == encoding)
    }

    /// Converters reading `format`
    pub fn converters_from<'a>(
        &'a self,
        format: &'a str,
    ) -> impl Iterator<Item = &'a ConverterSpec> {
        self.converters.iter().filter(move |c| c.reads(format))
    }

    /// Distinct encodings with at least one encoder, in registration order
    pub fn encodings(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for e in &self.encoders {
            if !out.contains(&e.encoding.as_str()) {
                out.push(&e.encoding);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REGISTRY: &str = r#"
        [[encoders]]
        codec_type = "x264"
        encoding = "h264"
        input_formats = ["YUV420P", "YUV444P"]
        output_colorspaces = ["YUV420P", "YUV444P"]
        quality = 60
        speed = 40
        setup_cost = 30
        width_mask = 0xFFFE
        height_mask = 0xFFFE

        [[encoders]]
        codec_type = "vpx"
        encoding = "vp9"
        input_formats = ["YUV420P"]
        output_colorspaces = ["YUV420P"]

        [[converters]]
        codec_type = "swscale"
        input_formats = ["BGRX", "BGRA"]
        output_formats = ["YUV420P", "YUV444P"]
        can_scale = true
    "#;

    #[test]
    fn test_subsampling() {
        assert!(is_subsampled("YUV420P"));
        assert!(is_subsampled("NV12"));
        assert!(is_subsampled("YUV422P"));
        assert!(!is_subsampled("YUV444P"));
        assert!(!is_subsampled("BGRX"));
        assert_eq!(subsampling_divs("BGRX"), None);
    }

    #[test]
    fn test_parse_registry() {
        let registry = CodecRegistry::from_toml(REGISTRY).unwrap();
        assert_eq!(registry.encoders.len(), 2);
        assert_eq!(registry.encodings(), vec!["h264", "vp9"]);

        let x264 = registry.encoders_for("h264").next().unwrap();
        assert_eq!(x264.width_mask, 0xFFFE);
        assert_eq!(x264.max_width, 4096);
        assert!(x264.accepts("YUV444P"));
        assert!(!x264.accepts("BGRX"));

        let vpx = registry.encoders_for("vp9").next().unwrap();
        assert_eq!(vpx.quality, 50);
        assert!(!vpx.can_scale);

        assert_eq!(registry.converters_from("BGRA").count(), 1);
        assert_eq!(registry.converters_from("RGB565").count(), 0);
    }

    #[test]
    fn test_can_handle() {
        let registry = CodecRegistry::from_toml(REGISTRY).unwrap();
        let x264 = &registry.encoders[0];
        assert!(x264.can_handle(1920, 1080));
        assert!(!x264.can_handle(4, 1080));
        assert!(!x264.can_handle(8192, 1080));
    }

    #[test]
    fn test_load_toml_and_json() {
        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        toml_file.write_all(REGISTRY.as_bytes()).unwrap();
        let from_toml = CodecRegistry::load(toml_file.path()).unwrap();

        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        json_file
            .write_all(serde_json::to_string(&from_toml).unwrap().as_bytes())
            .unwrap();
        let from_json = CodecRegistry::load(json_file.path()).unwrap();

        assert_eq!(from_toml, from_json);
    }

    #[test]
    fn test_load_missing_file() {
        let err = CodecRegistry::load("/nonexistent/registry.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read codec registry"));
    }
}

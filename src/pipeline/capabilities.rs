//! Client-side capabilities
//!
//! What the remote decoder accepts. An empty capability set is valid and
//! simply disables video pipelines, region refreshes and scaling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_video_max_size() -> (u32, u32) {
    (8192, 8192)
}

fn default_max_size() -> (u32, u32) {
    (16384, 16384)
}

fn default_ceiling() -> u8 {
    100
}

/// Decoder capabilities announced by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Colorspaces the client can decode, per encoding
    #[serde(default)]
    pub colorspaces: BTreeMap<String, Vec<String>>,
    /// Client can upscale a downscaled stream
    #[serde(default)]
    pub scaling: bool,
    /// Client handles video subregions
    #[serde(default)]
    pub subregion: bool,
    /// Client accepts batched updates
    #[serde(default)]
    pub batching: bool,
    /// Lowest quality the client accepts
    #[serde(default)]
    pub min_quality: u8,
    /// Highest quality worth sending
    #[serde(default = "default_ceiling")]
    pub max_quality: u8,
    /// Lowest speed the client accepts
    #[serde(default)]
    pub min_speed: u8,
    /// Highest speed worth requesting
    #[serde(default = "default_ceiling")]
    pub max_speed: u8,
    /// Smallest window the client renders
    #[serde(default)]
    pub min_size: (u32, u32),
    /// Largest window the client renders
    #[serde(default = "default_max_size")]
    pub max_size: (u32, u32),
    /// Largest video frame the client decodes
    #[serde(default = "default_video_max_size")]
    pub video_max_size: (u32, u32),
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            colorspaces: BTreeMap::new(),
            scaling: false,
            subregion: false,
            batching: false,
            min_quality: 0,
            max_quality: default_ceiling(),
            min_speed: 0,
            max_speed: default_ceiling(),
            min_size: (0, 0),
            max_size: default_max_size(),
            video_max_size: default_video_max_size(),
        }
    }
}

impl ClientCapabilities {
    /// Add the colorspaces accepted for `encoding`
    pub fn with_colorspaces<I, S>(mut self, encoding: &str, colorspaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.colorspaces.insert(
            encoding.to_string(),
            colorspaces.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Colorspaces accepted for `encoding`, empty when unsupported
    pub fn accepted_colorspaces(&self, encoding: &str) -> &[String] {
        self.colorspaces.get(encoding).map_or(&[], Vec::as_slice)
    }

    /// True when the client decodes `encoding` in `colorspace`
    pub fn accepts(&self, encoding: &str, colorspace: &str) -> bool {
        self.accepted_colorspaces(encoding)
            .iter()
            .any(|c| c == colorspace)
    }

    /// Clamp a quality value into the client's range
    pub fn clamp_quality(&self, quality: u8) -> u8 {
        quality.clamp(self.min_quality, self.max_quality.max(self.min_quality))
    }

    /// Clamp a speed value into the client's range
    pub fn clamp_speed(&self, speed: u8) -> u8 {
        speed.clamp(self.min_speed, self.max_speed.max(self.min_speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_capabilities_accept_nothing() {
        let caps = ClientCapabilities::default();
        assert!(caps.accepted_colorspaces("h264").is_empty());
        assert!(!caps.accepts("h264", "YUV420P"));
        assert!(!caps.scaling);
    }

    #[test]
    fn test_with_colorspaces() {
        let caps = ClientCapabilities::default().with_colorspaces("h264", ["YUV420P"]);
        assert!(caps.accepts("h264", "YUV420P"));
        assert!(!caps.accepts("h264", "YUV444P"));
        assert!(!caps.accepts("vp9", "YUV420P"));
    }

    #[test]
    fn test_clamp() {
        let caps = ClientCapabilities {
            min_quality: 30,
            max_quality: 90,
            ..Default::default()
        };
        assert_eq!(caps.clamp_quality(10), 30);
        assert_eq!(caps.clamp_quality(95), 90);
        assert_eq!(caps.clamp_speed(100), 100);
    }

    #[test]
    fn test_deserialize_partial() {
        let caps: ClientCapabilities =
            serde_json::from_str(r#"{"colorspaces": {"h264": ["YUV420P"]}, "scaling": true}"#)
                .unwrap();
        assert!(caps.scaling);
        assert_eq!(caps.video_max_size, (8192, 8192));
        assert_eq!(caps.max_quality, 100);
    }
}

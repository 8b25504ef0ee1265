//! Codec plugin interface
//!
//! The engine never touches pixels. Actual converters and encoders live
//! behind these traits and are created through a [`CodecFactory`].
//!
//! # Ownership
//!
//! Instances are only ever held through [`ConverterHandle`] and
//! [`EncoderHandle`], which call `clean()` when dropped. A pipeline whose
//! encoder fails to start after its converter was created releases the
//! converter as the handle goes out of scope.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use super::spec::{ConverterSpec, EncoderSpec};

/// Result type for codec plugin calls
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Errors reported by codec plugins
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Temporary condition (device busy, instance limit); retry later
    #[error("Transient codec failure: {0}")]
    Transient(String),

    /// The codec cannot work with these parameters
    #[error("Codec failure: {0}")]
    Failed(String),

    /// Requested parameters are not supported
    #[error("Unsupported codec configuration: {0}")]
    Unsupported(String),
}

impl CodecError {
    /// True for failures that may go away on their own
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Parameters for a new converter instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConverterRequest {
    /// Input pixel format
    pub src_format: String,
    /// Input width
    pub src_width: u32,
    /// Input height
    pub src_height: u32,
    /// Output pixel format
    pub dst_format: String,
    /// Output width
    pub dst_width: u32,
    /// Output height
    pub dst_height: u32,
    /// Requested speed, 1..=100
    pub speed: u8,
}

/// Parameters for a new encoder instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderRequest {
    /// Encoding to produce
    pub encoding: String,
    /// Input pixel format
    pub src_format: String,
    /// Input width
    pub width: u32,
    /// Input height
    pub height: u32,
    /// Requested quality, 0..=100
    pub quality: u8,
    /// Requested speed, 0..=100
    pub speed: u8,
}

/// A running colorspace converter
pub trait ColorspaceConverter: Send {
    /// Implementation name
    fn codec_type(&self) -> &str;

    /// Input pixel format
    fn src_format(&self) -> &str;

    /// Output pixel format
    fn dst_format(&self) -> &str;

    /// Input size
    fn src_size(&self) -> (u32, u32);

    /// Output size
    fn dst_size(&self) -> (u32, u32);

    /// Release native resources; called exactly once by the handle
    fn clean(&mut self);
}

/// A running video encoder
pub trait VideoEncoder: Send {
    /// Implementation name
    fn codec_type(&self) -> &str;

    /// Encoding produced
    fn encoding(&self) -> &str;

    /// Input pixel format
    fn src_format(&self) -> &str;

    /// Input size
    fn size(&self) -> (u32, u32);

    /// Release native resources; called exactly once by the handle
    fn clean(&mut self);
}

/// Creates codec instances from their specs
pub trait CodecFactory: Send + Sync {
    /// Instantiate a converter
    fn make_converter(
        &self,
        spec: &ConverterSpec,
        request: &ConverterRequest,
    ) -> CodecResult<Box<dyn ColorspaceConverter>>;

    /// Instantiate an encoder
    fn make_encoder(
        &self,
        spec: &EncoderSpec,
        request: &EncoderRequest,
    ) -> CodecResult<Box<dyn VideoEncoder>>;

    /// Score multiplier reflecting current load of `codec_type`, 1.0 when idle
    fn runtime_factor(&self, codec_type: &str) -> f64 {
        let _ = codec_type;
        1.0
    }
}

/// Owning handle that cleans its converter on drop
pub struct ConverterHandle {
    inner: Box<dyn ColorspaceConverter>,
}

impl ConverterHandle {
    /// Take ownership of a converter
    pub fn new(inner: Box<dyn ColorspaceConverter>) -> Self {
        Self { inner }
    }

    /// The converter
    pub fn get(&self) -> &dyn ColorspaceConverter {
        self.inner.as_ref()
    }
}

impl Drop for ConverterHandle {
    fn drop(&mut self) {
        self.inner.clean();
    }
}

impl fmt::Debug for ConverterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterHandle")
            .field("codec_type", &self.inner.codec_type())
            .field("src_format", &self.inner.src_format())
            .field("dst_format", &self.inner.dst_format())
            .finish()
    }
}

/// Owning handle that cleans its encoder on drop
pub struct EncoderHandle {
    inner: Box<dyn VideoEncoder>,
}

impl EncoderHandle {
    /// Take ownership of an encoder
    pub fn new(inner: Box<dyn VideoEncoder>) -> Self {
        Self { inner }
    }

    /// The encoder
    pub fn get(&self) -> &dyn VideoEncoder {
        self.inner.as_ref()
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        self.inner.clean();
    }
}

impl fmt::Debug for EncoderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderHandle")
            .field("codec_type", &self.inner.codec_type())
            .field("encoding", &self.inner.encoding())
            .field("size", &self.inner.size())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory codecs that count `clean()` calls

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    pub(crate) struct FakeConverter {
        pub(crate) request: ConverterRequest,
        pub(crate) cleaned: Arc<AtomicUsize>,
    }

    impl ColorspaceConverter for FakeConverter {
        fn codec_type(&self) -> &str {
            "fake-csc"
        }
        fn src_format(&self) -> &str {
            &self.request.src_format
        }
        fn dst_format(&self) -> &str {
            &self.request.dst_format
        }
        fn src_size(&self) -> (u32, u32) {
            (self.request.src_width, self.request.src_height)
        }
        fn dst_size(&self) -> (u32, u32) {
            (self.request.dst_width, self.request.dst_height)
        }
        fn clean(&mut self) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    pub(crate) struct FakeEncoder {
        pub(crate) codec_type: String,
        pub(crate) request: EncoderRequest,
        pub(crate) cleaned: Arc<AtomicUsize>,
    }

    impl VideoEncoder for FakeEncoder {
        fn codec_type(&self) -> &str {
            &self.codec_type
        }
        fn encoding(&self) -> &str {
            &self.request.encoding
        }
        fn src_format(&self) -> &str {
            &self.request.src_format
        }
        fn size(&self) -> (u32, u32) {
            (self.request.width, self.request.height)
        }
        fn clean(&mut self) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Factory producing fake codecs, optionally failing one encoder type
    #[derive(Debug, Default)]
    pub(crate) struct FakeFactory {
        pub(crate) cleaned: Arc<AtomicUsize>,
        pub(crate) failing: Option<String>,
    }

    impl CodecFactory for FakeFactory {
        fn make_converter(
            &self,
            _spec: &ConverterSpec,
            request: &ConverterRequest,
        ) -> CodecResult<Box<dyn ColorspaceConverter>> {
            Ok(Box::new(FakeConverter {
                request: request.clone(),
                cleaned: self.cleaned.clone(),
            }))
        }

        fn make_encoder(
            &self,
            spec: &EncoderSpec,
            request: &EncoderRequest,
        ) -> CodecResult<Box<dyn VideoEncoder>> {
            if self.failing.as_deref() == Some(spec.codec_type.as_str()) {
                return Err(CodecError::Transient(format!("{} busy", spec.codec_type)));
            }
            Ok(Box::new(FakeEncoder {
                codec_type: spec.codec_type.clone(),
                request: request.clone(),
                cleaned: self.cleaned.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeConverter, FakeEncoder};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn encoder_request() -> EncoderRequest {
        EncoderRequest {
            encoding: "h264".into(),
            src_format: "YUV420P".into(),
            width: 640,
            height: 480,
            quality: 50,
            speed: 50,
        }
    }

    #[test]
    fn test_transient() {
        assert!(CodecError::Transient("busy".into()).is_transient());
        assert!(!CodecError::Failed("no".into()).is_transient());
        assert!(!CodecError::Unsupported("no".into()).is_transient());
    }

    #[test]
    fn test_handles_clean_on_drop() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let encoder = EncoderHandle::new(Box::new(FakeEncoder {
            codec_type: "x264".into(),
            request: encoder_request(),
            cleaned: cleaned.clone(),
        }));
        let converter = ConverterHandle::new(Box::new(FakeConverter {
            request: ConverterRequest {
                src_format: "BGRX".into(),
                src_width: 640,
                src_height: 480,
                dst_format: "YUV420P".into(),
                dst_width: 640,
                dst_height: 480,
                speed: 50,
            },
            cleaned: cleaned.clone(),
        }));
        assert_eq!(encoder.get().size(), (640, 480));
        assert_eq!(converter.get().dst_format(), "YUV420P");
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);

        drop(encoder);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        drop(converter);
        assert_eq!(cleaned.load(Ordering::SeqCst), 2);
    }
}

//! Conversion jobs and the identifiers that track them.

use std::fmt;
use std::str::FromStr;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Identifier of one submitted conversion.
///
/// Allocated by the dispatcher at submit time. Ids start at 1, only ever
/// increase, and are never reused for the lifetime of a pool.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, RkyvSerialize, RkyvDeserialize,
)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req_{}", self.0)
    }
}

/// Target image format.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Archive,
    RkyvSerialize,
    RkyvDeserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Webp,
    Png,
    Jpeg,
}

impl ImageFormat {
    /// All supported target formats.
    pub const ALL: [ImageFormat; 3] = [ImageFormat::Webp, ImageFormat::Png, ImageFormat::Jpeg];

    /// File extension used for converted outputs.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Webp => "webp",
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Webp => "image/webp",
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ImageFormat::Webp => "WebP",
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Webp => "webp",
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        };
        f.write_str(name)
    }
}

/// Error returned when a format name is not one of the known aliases.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown image format: {0}")]
pub struct UnknownFormat(pub String);

impl FromStr for ImageFormat {
    type Err = UnknownFormat;

    /// Accepts `png`, `webp`, `jpg` and `jpeg` in any case, with or without
    /// an `image/` mime prefix and `;` parameters.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let subtype = normalized.strip_prefix("image/").unwrap_or(&normalized);
        let subtype = subtype.split(';').next().unwrap_or_default().trim();

        match subtype {
            "png" => Ok(ImageFormat::Png),
            "webp" => Ok(ImageFormat::Webp),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            _ => Err(UnknownFormat(value.to_string())),
        }
    }
}

/// One image conversion request.
///
/// The input buffer is moved into the pool on submit and from there into the
/// execution context that runs the job; the caller never sees it again.
#[derive(Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct ConvertJob {
    /// Encoded source image.
    pub input: Vec<u8>,
    pub target_format: ImageFormat,
    /// Encoder quality, 1..=100. Out of range values are clamped by the codec.
    pub quality: u8,
    /// Maximum output width. 0 leaves the width unbounded.
    pub max_width: u32,
    /// Maximum output height. 0 leaves the height unbounded.
    pub max_height: u32,
    pub lossless: bool,
}

impl ConvertJob {
    /// Create a job with the default quality of 78 and no resize bounds.
    pub fn new(input: Vec<u8>, target_format: ImageFormat) -> Self {
        Self {
            input,
            target_format,
            quality: 78,
            max_width: 0,
            max_height: 0,
            lossless: false,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_max_size(mut self, max_width: u32, max_height: u32) -> Self {
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    pub fn with_lossless(mut self, lossless: bool) -> Self {
        self.lossless = lossless;
        self
    }
}

impl fmt::Debug for ConvertJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvertJob")
            .field("input_len", &self.input.len())
            .field("target_format", &self.target_format)
            .field("quality", &self.quality)
            .field("max_width", &self.max_width)
            .field("max_height", &self.max_height)
            .field("lossless", &self.lossless)
            .finish()
    }
}

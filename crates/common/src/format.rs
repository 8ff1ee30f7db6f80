//! Image and stream format descriptors, and codec buffer negotiation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::VideoCodec;
use crate::color::PixelFormat;
use crate::types::Resolution;

/// Layout of an uncompressed image buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageFormat {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,
    /// Row stride in bytes (shared by all planes).
    pub bytes_per_row: usize,
}

impl ImageFormat {
    /// Tightly packed layout (stride == row width).
    pub fn packed(resolution: Resolution, pixel_format: PixelFormat) -> Self {
        Self {
            resolution,
            pixel_format,
            bytes_per_row: pixel_format.min_bytes_per_row(resolution.width),
        }
    }

    /// Layout whose stride is rounded up to a multiple of `alignment` bytes.
    pub fn aligned(resolution: Resolution, pixel_format: PixelFormat, alignment: usize) -> Self {
        let min = pixel_format.min_bytes_per_row(resolution.width);
        let alignment = alignment.max(1);
        Self {
            resolution,
            pixel_format,
            bytes_per_row: min.div_ceil(alignment) * alignment,
        }
    }

    /// Bytes of pixel data in one row (without padding).
    pub fn row_bytes(&self) -> usize {
        self.pixel_format.min_bytes_per_row(self.resolution.width)
    }

    pub fn row_count(&self) -> usize {
        self.pixel_format.row_count(self.resolution.height)
    }

    /// Total buffer size in bytes, or `None` on overflow.
    pub fn byte_size(&self) -> Option<usize> {
        self.bytes_per_row.checked_mul(self.row_count())
    }

    pub fn is_valid(&self) -> bool {
        !self.resolution.is_empty() && self.bytes_per_row >= self.row_bytes()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} stride {}",
            self.resolution, self.pixel_format, self.bytes_per_row
        )
    }
}

/// What a caller asks a codec for during negotiation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FormatRequest {
    pub codec: VideoCodec,
    pub resolution: Resolution,
}

/// Image buffer attributes a codec supports for its input (encoders) or
/// output (decoders).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAttributes {
    pub resolution: Resolution,
    /// Accepted pixel formats, most preferred first.
    pub pixel_formats: Vec<PixelFormat>,
    /// Required row stride alignment in bytes.
    pub row_alignment: usize,
}

/// How a caller's buffer layout relates to what a codec supports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compatibility {
    /// One pool can be shared by caller and codec.
    Shared,
    /// Separate pools; every exchange copies the buffer.
    CopyRequired,
    /// The codec cannot handle this layout at all.
    Unsupported,
}

impl BufferAttributes {
    pub fn compatibility(&self, format: &ImageFormat) -> Compatibility {
        if format.resolution != self.resolution
            || !self.pixel_formats.contains(&format.pixel_format)
            || !format.is_valid()
        {
            return Compatibility::Unsupported;
        }
        if format.bytes_per_row % self.row_alignment.max(1) != 0 {
            Compatibility::CopyRequired
        } else {
            Compatibility::Shared
        }
    }

    /// The codec-side layout for `pixel_format` honouring the alignment.
    pub fn preferred_format(&self, pixel_format: PixelFormat) -> ImageFormat {
        ImageFormat::aligned(self.resolution, pixel_format, self.row_alignment)
    }
}

/// Description of a compressed video stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescription {
    pub codec: VideoCodec,
    pub resolution: Resolution,
    /// Pixel format of the images the stream was coded from.
    pub pixel_format: PixelFormat,
    /// Codec-specific configuration (parameter sets and the like).
    pub extradata: Vec<u8>,
}

impl fmt::Display for FormatDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?} ({} bytes extradata)",
            self.codec,
            self.resolution,
            self.pixel_format,
            self.extradata.len()
        )
    }
}

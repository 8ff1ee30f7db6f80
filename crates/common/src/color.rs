//! Pixel formats and their memory geometry.

use serde::{Deserialize, Serialize};

/// Pixel format of an image buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 channels, 8 bits each.
    Rgba8,
    /// BGRA8 (the ordering most capture and display paths prefer).
    Bgra8,
    /// NV12: Y plane + interleaved UV at half resolution.
    Nv12,
    /// P010: 10-bit NV12 variant in 16-bit containers.
    P010,
}

impl PixelFormat {
    /// Bytes per pixel (for planar formats, the Y component only).
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8 | Self::Bgra8 => 4,
            Self::Nv12 => 1,
            Self::P010 => 2,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(self, Self::Nv12 | Self::P010)
    }

    /// Smallest legal row stride for `width` pixels.
    ///
    /// For the planar formats the interleaved UV rows have the same stride
    /// as the luma rows.
    pub fn min_bytes_per_row(self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel() as usize
    }

    /// Number of rows across all planes for an image `height` pixels tall.
    pub fn row_count(self, height: u32) -> usize {
        let h = height as usize;
        if self.is_planar() {
            h + h.div_ceil(2)
        } else {
            h
        }
    }

    /// Compact code used in serialized stream headers.
    pub fn code(self) -> u8 {
        match self {
            Self::Rgba8 => 1,
            Self::Bgra8 => 2,
            Self::Nv12 => 3,
            Self::P010 => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Rgba8),
            2 => Some(Self::Bgra8),
            3 => Some(Self::Nv12),
            4 => Some(Self::P010),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_sizes() {
        assert_eq!(PixelFormat::Rgba8.bytes_per_pixel(), 4);
        assert_eq!(PixelFormat::P010.bytes_per_pixel(), 2);
        assert!(PixelFormat::Nv12.is_planar());
        assert!(!PixelFormat::Bgra8.is_planar());
    }

    #[test]
    fn planar_row_count_includes_chroma() {
        assert_eq!(PixelFormat::Nv12.row_count(4), 6);
        assert_eq!(PixelFormat::Nv12.row_count(5), 8);
        assert_eq!(PixelFormat::Bgra8.row_count(5), 5);
    }

    #[test]
    fn codes_roundtrip() {
        for pf in [
            PixelFormat::Rgba8,
            PixelFormat::Bgra8,
            PixelFormat::Nv12,
            PixelFormat::P010,
        ] {
            assert_eq!(PixelFormat::from_code(pf.code()), Some(pf));
        }
        assert_eq!(PixelFormat::from_code(0), None);
    }
}

//! Shared image buffers exchanged between caller and codec.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{CodingError, CodingResult};
use crate::format::ImageFormat;
use crate::pool::PoolShared;

static NEXT_STANDALONE_ID: AtomicU64 = AtomicU64::new(1 << 48);

/// An uncompressed image.
///
/// Cloning is cheap and yields another handle to the same pixels. Pixels can
/// only be written through a handle that is exclusive, so a buffer handed to
/// a codec stays immutable until the codec lets go of it.
#[derive(Clone)]
pub struct ImageBuffer {
    inner: Arc<BufferInner>,
}

pub(crate) struct BufferInner {
    id: u64,
    format: ImageFormat,
    data: Vec<u8>,
    origin: Option<Weak<PoolShared>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(pool) = self.origin.take().and_then(|w| w.upgrade()) {
            pool.recycle(self.id, std::mem::take(&mut self.data));
        }
    }
}

impl ImageBuffer {
    /// Allocate a zeroed buffer that does not belong to any pool.
    pub fn new(format: ImageFormat) -> CodingResult<Self> {
        let size = checked_size(&format)?;
        Ok(Self::from_parts(
            NEXT_STANDALONE_ID.fetch_add(1, Ordering::Relaxed),
            format,
            vec![0u8; size],
            None,
        ))
    }

    /// Wrap existing pixel data. `data` must be exactly `format.byte_size()` long.
    pub fn from_vec(format: ImageFormat, data: Vec<u8>) -> CodingResult<Self> {
        let size = checked_size(&format)?;
        if data.len() != size {
            return Err(CodingError::InvalidParameter(format!(
                "buffer holds {} bytes, format {format} needs {size}",
                data.len()
            )));
        }
        Ok(Self::from_parts(
            NEXT_STANDALONE_ID.fetch_add(1, Ordering::Relaxed),
            format,
            data,
            None,
        ))
    }

    pub(crate) fn from_parts(
        id: u64,
        format: ImageFormat,
        data: Vec<u8>,
        origin: Option<Weak<PoolShared>>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id,
                format,
                data,
                origin,
            }),
        }
    }

    /// Identity of the underlying storage. Stable across pool recycling.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn format(&self) -> &ImageFormat {
        &self.inner.format
    }

    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    /// Mutable pixels, or `None` while another handle (e.g. a codec) holds
    /// this buffer.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.inner).map(|inner| inner.data.as_mut_slice())
    }

    /// Whether this is the only handle to the buffer.
    pub fn is_exclusive(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    pub fn is_pooled(&self) -> bool {
        self.inner.origin.is_some()
    }

    /// One row of pixel data without padding; `row` counts across planes.
    pub fn row(&self, row: usize) -> &[u8] {
        let fmt = self.format();
        let start = row * fmt.bytes_per_row;
        &self.data()[start..start + fmt.row_bytes()]
    }

    /// Copy pixels into `dst`, re-pitching rows when the strides differ.
    pub fn copy_to(&self, dst: &mut ImageBuffer) -> CodingResult<()> {
        let src_fmt = *self.format();
        let dst_fmt = *dst.format();
        if src_fmt.resolution != dst_fmt.resolution || src_fmt.pixel_format != dst_fmt.pixel_format
        {
            return Err(CodingError::UnsupportedFormat(format!(
                "cannot copy {src_fmt} into {dst_fmt}"
            )));
        }
        let out = dst.data_mut().ok_or_else(|| {
            CodingError::InvalidParameter("destination buffer is shared".into())
        })?;
        copy_rows(self.data(), src_fmt.bytes_per_row, out, dst_fmt.bytes_per_row, &src_fmt);
        Ok(())
    }
}

/// Copy every row of `format` from `src` (stride `src_stride`) into `dst`.
pub fn copy_rows(src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize, format: &ImageFormat) {
    let row_bytes = format.row_bytes();
    for row in 0..format.row_count() {
        let s = row * src_stride;
        let d = row * dst_stride;
        dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
    }
}

fn checked_size(format: &ImageFormat) -> CodingResult<usize> {
    if !format.is_valid() {
        return Err(CodingError::InvalidParameter(format!("invalid image format {format}")));
    }
    format
        .byte_size()
        .ok_or_else(|| CodingError::AllocationFailed(format!("image {format} is too large")))
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("id", &self.inner.id)
            .field("format", &self.inner.format)
            .field("pooled", &self.is_pooled())
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::PixelFormat;
    use crate::types::Resolution;

    fn bgra(width: u32, height: u32) -> ImageFormat {
        ImageFormat::packed(Resolution::new(width, height), PixelFormat::Bgra8)
    }

    #[test]
    fn new_buffer_is_zeroed_and_exclusive() {
        let buf = ImageBuffer::new(bgra(4, 2)).unwrap();
        assert_eq!(buf.data().len(), 32);
        assert!(buf.data().iter().all(|&b| b == 0));
        assert!(buf.is_exclusive());
        assert!(!buf.is_pooled());
    }

    #[test]
    fn shared_handle_blocks_mutation() {
        let mut buf = ImageBuffer::new(bgra(2, 2)).unwrap();
        let held = buf.clone();
        assert!(buf.data_mut().is_none());
        drop(held);
        buf.data_mut().unwrap()[0] = 9;
        assert_eq!(buf.data()[0], 9);
    }

    #[test]
    fn from_vec_checks_length() {
        assert!(ImageBuffer::from_vec(bgra(2, 2), vec![0; 16]).is_ok());
        let err = ImageBuffer::from_vec(bgra(2, 2), vec![0; 15]).unwrap_err();
        assert!(matches!(err, CodingError::InvalidParameter(_)));
    }

    #[test]
    fn copy_repitches_rows() {
        let res = Resolution::new(3, 2);
        let packed = ImageFormat::packed(res, PixelFormat::Bgra8);
        let aligned = ImageFormat::aligned(res, PixelFormat::Bgra8, 16);
        let src = ImageBuffer::from_vec(packed, (0..24).collect()).unwrap();
        let mut dst = ImageBuffer::new(aligned).unwrap();

        src.copy_to(&mut dst).unwrap();

        assert_eq!(dst.format().bytes_per_row, 16);
        assert_eq!(dst.row(0), src.row(0));
        assert_eq!(dst.row(1), src.row(1));
        assert_eq!(&dst.data()[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn copy_rejects_mismatched_formats() {
        let src = ImageBuffer::new(bgra(2, 2)).unwrap();
        let mut dst = ImageBuffer::new(bgra(4, 2)).unwrap();
        assert!(matches!(
            src.copy_to(&mut dst),
            Err(CodingError::UnsupportedFormat(_))
        ));
    }
}

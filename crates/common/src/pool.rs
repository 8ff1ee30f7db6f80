//! Pixel Buffer Pool -- recycles fixed-format image buffers.
//!
//! A pool hands out [`ImageBuffer`]s of one [`ImageFormat`]. When the last
//! handle to a pooled buffer is dropped, its storage goes back to the idle
//! list (keeping its id) instead of being freed, so steady-state encoding or
//! decoding allocates nothing per frame.
//!
//! Caller and codec share a single pool when their layouts are compatible.
//! Otherwise each side has its own pool and the session copies between them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::ImageBuffer;
use crate::error::{CodingError, CodingResult};
use crate::format::ImageFormat;

static NEXT_POOL_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Statistics about the current state of a pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers allocated fresh since pool creation.
    pub allocated: u64,
    /// Acquisitions served from the idle list.
    pub reused: u64,
    /// Buffers currently idle.
    pub idle: usize,
}

pub(crate) struct PoolShared {
    format: ImageFormat,
    byte_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<(u64, Vec<u8>)>>,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl PoolShared {
    pub(crate) fn recycle(&self, id: u64, data: Vec<u8>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle && data.len() == self.byte_size {
            trace!(buffer = id, "Buffer returned to pool");
            idle.push((id, data));
        }
    }
}

/// A recycling pool of identically formatted image buffers.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct PixelBufferPool {
    shared: Arc<PoolShared>,
}

impl PixelBufferPool {
    /// Create a pool that keeps at most `max_idle` idle buffers.
    pub fn new(format: ImageFormat, max_idle: usize) -> CodingResult<Self> {
        if !format.is_valid() {
            return Err(CodingError::InvalidParameter(format!(
                "invalid pool format {format}"
            )));
        }
        let byte_size = format.byte_size().ok_or_else(|| {
            CodingError::AllocationFailed(format!("pool format {format} is too large"))
        })?;
        debug!(format = %format, max_idle, "Pixel buffer pool created");
        Ok(Self {
            shared: Arc::new(PoolShared {
                format,
                byte_size,
                max_idle: max_idle.max(1),
                idle: Mutex::new(Vec::new()),
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        })
    }

    pub fn format(&self) -> &ImageFormat {
        &self.shared.format
    }

    /// Get a buffer, reusing an idle one when available.
    ///
    /// Reused buffers keep whatever pixels they held last.
    pub fn acquire(&self) -> CodingResult<ImageBuffer> {
        let recycled = self.shared.idle.lock().pop();
        let (id, data) = match recycled {
            Some(entry) => {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                entry
            }
            None => self.allocate()?,
        };
        Ok(self.wrap(id, data))
    }

    /// Make sure at least `count` buffers sit idle (bounded by `max_idle`).
    pub fn preallocate(&self, count: usize) -> CodingResult<()> {
        let missing = count
            .min(self.shared.max_idle)
            .saturating_sub(self.shared.idle.lock().len());
        for _ in 0..missing {
            let (id, data) = self.allocate()?;
            self.shared.recycle(id, data);
        }
        Ok(())
    }

    /// Free all idle buffers.
    pub fn flush(&self) {
        let freed = std::mem::take(&mut *self.shared.idle.lock()).len();
        debug!(freed, "Pixel buffer pool flushed");
    }

    fn allocate(&self) -> CodingResult<(u64, Vec<u8>)> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.shared.byte_size).map_err(|e| {
            CodingError::AllocationFailed(format!(
                "{} bytes for {}: {e}",
                self.shared.byte_size, self.shared.format
            ))
        })?;
        data.resize(self.shared.byte_size, 0);
        self.shared.allocated.fetch_add(1, Ordering::Relaxed);
        Ok((NEXT_POOL_BUFFER_ID.fetch_add(1, Ordering::Relaxed), data))
    }

    fn wrap(&self, id: u64, data: Vec<u8>) -> ImageBuffer {
        ImageBuffer::from_parts(
            id,
            self.shared.format,
            data,
            Some(Arc::downgrade(&self.shared)),
        )
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            idle: self.shared.idle.lock().len(),
        }
    }
}

impl std::fmt::Debug for PixelBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBufferPool")
            .field("format", &self.shared.format)
            .field("max_idle", &self.shared.max_idle)
            .field("stats", &self.stats())
            .finish()
    }
}

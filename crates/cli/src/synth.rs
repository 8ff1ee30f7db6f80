//! Deterministic synthetic source frames.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use vcs_common::{CodingResult, ImageBuffer, PixelBufferPool};

/// Produces the same image for the same frame index on every pass.
#[derive(Clone, Debug)]
pub struct FrameSource {
    seed: u64,
    frames: u64,
}

impl FrameSource {
    pub fn new(seed: u64, frames: u64) -> Self {
        Self { seed, frames }
    }

    /// Frames in the middle third carry noise and are expensive to code.
    pub fn is_noisy(&self, index: u64) -> bool {
        let third = self.frames / 3;
        index >= third && index < self.frames - third
    }

    /// Fill a buffer from `pool` with frame `index`.
    pub fn render(&self, pool: &PixelBufferPool, index: u64) -> CodingResult<ImageBuffer> {
        let mut image = pool.acquire()?;
        let format = *image.format();
        let noisy = self.is_noisy(index);
        let mut rng = StdRng::seed_from_u64(self.seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15));

        if let Some(data) = image.data_mut() {
            let row_bytes = format.row_bytes();
            for (y, row) in data.chunks_mut(format.bytes_per_row).enumerate() {
                let len = row_bytes.min(row.len());
                let pixels = &mut row[..len];
                if noisy {
                    rng.fill_bytes(pixels);
                    continue;
                }
                // Horizontal bands scrolling down one row per frame.
                let band = ((y as u64 + index) / 4 % 4) as u8;
                pixels.fill(0x20 + band * 0x30);
            }
        }
        Ok(image)
    }
}

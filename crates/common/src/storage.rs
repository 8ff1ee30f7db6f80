//! Interface between encoders and multi-pass storage.

use std::fmt::Debug;

use crate::error::CodingResult;
use crate::time::{MediaTime, TimeRange};

/// Durable per-frame metadata store an encoder uses across passes.
///
/// Implementations accept exactly one write per timestamp per pass. After
/// the first pass, writes are only accepted inside the ranges handed to
/// `begin_pass`.
pub trait MultiPassStore: Send + Sync + Debug {
    /// Open a pass. `None` means unrestricted (the first pass).
    fn begin_pass(&self, ranges: Option<&[TimeRange]>) -> CodingResult<()>;

    fn end_pass(&self) -> CodingResult<()>;

    fn store(&self, timestamp: MediaTime, data: &[u8]) -> CodingResult<()>;

    /// The latest data stored for `timestamp`, from whichever pass wrote it.
    fn load(&self, timestamp: MediaTime) -> CodingResult<Option<Vec<u8>>>;

    fn is_closed(&self) -> bool;
}

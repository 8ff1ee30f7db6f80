//! Frame silo: the compressed output of a multi-pass encode.
//!
//! Each pass appends to its own segment file. When the encoder asks for
//! another pass over some time ranges, samples already stored in those
//! ranges are dropped from the index and the next pass refills them. The
//! merged sequence is read back in decode order with
//! [`FrameSilo::for_each_sample`].
//!
//! Segment record layout (big-endian):
//!
//! ```text
//! meta_len:u32 meta[meta_len] (JSON) data_len:u32 data[data_len]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vcs_common::{
    ranges_contain, validate_time_ranges, CodingError, CodingResult, EncodedSample, MediaTime,
    MultiPassConfig, TimeRange,
};

use crate::backing::Backing;

/// Sample fields stored next to the payload.
#[derive(Debug, Serialize, Deserialize)]
struct SampleMeta {
    pts: MediaTime,
    dts: MediaTime,
    duration: Option<MediaTime>,
    is_keyframe: bool,
}

#[derive(Copy, Clone, Debug)]
struct SiloEntry {
    pass: u32,
    offset: u64,
}

struct Segment {
    writer: BufWriter<File>,
    len: u64,
}

struct SiloState {
    closed: bool,
    pass: u32,
    /// Ranges accepted by the current pass. `None` on the first pass.
    ranges: Option<Vec<TimeRange>>,
    last_dts: Option<MediaTime>,
    /// End of the most recent sample (dts + duration), for progress.
    last_end: Option<MediaTime>,
    index: BTreeMap<MediaTime, SiloEntry>,
    segment: Option<Segment>,
}

impl SiloState {
    fn flush(&mut self) -> CodingResult<()> {
        if let Some(segment) = self.segment.as_mut() {
            segment.writer.flush()?;
        }
        Ok(())
    }
}

/// Ordered store of compressed samples across encoding passes.
pub struct FrameSilo {
    state: Mutex<SiloState>,
    valid_range: Option<TimeRange>,
    backing: Backing,
}

fn segment_path(dir: &Path, pass: u32) -> PathBuf {
    dir.join(format!("segment-{pass:03}.bin"))
}

impl FrameSilo {
    /// Create an empty silo. Samples with a decode time outside
    /// `valid_range` are rejected.
    pub fn create(
        location: Option<&Path>,
        valid_range: Option<TimeRange>,
        config: &MultiPassConfig,
    ) -> CodingResult<Self> {
        if let Some(range) = valid_range {
            validate_time_ranges(&[range])?;
        }
        let backing = Backing::create(location, config, "vcs-silo-")?;
        let segment = open_segment(backing.path(), 1)?;
        info!(
            path = %backing.path().display(),
            valid_range = ?valid_range.map(|r| r.to_string()),
            "Frame silo created"
        );
        Ok(Self {
            state: Mutex::new(SiloState {
                closed: false,
                pass: 1,
                ranges: None,
                last_dts: None,
                last_end: None,
                index: BTreeMap::new(),
                segment: Some(segment),
            }),
            valid_range,
            backing,
        })
    }

    /// Append a sample to the current pass.
    ///
    /// Decode timestamps must increase strictly within a pass and fall
    /// inside both the valid range and the pass ranges.
    pub fn add_sample(&self, sample: &EncodedSample) -> CodingResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CodingError::StorageInvalid("frame silo has been closed".into()));
        }
        let dts = sample.dts.validate()?;
        sample.pts.validate()?;
        sample.duration.map(MediaTime::validate).transpose()?;
        if let Some(range) = self.valid_range {
            if !range.contains(dts) {
                return Err(CodingError::InvalidTimeRange(format!(
                    "sample at {dts} is outside the valid range {range}"
                )));
            }
        }
        if let Some(ranges) = &state.ranges {
            if !ranges_contain(ranges, dts) {
                return Err(CodingError::InvalidTimeRange(format!(
                    "sample at {dts} is outside the ranges of pass {}",
                    state.pass
                )));
            }
        }
        if let Some(last) = state.last_dts {
            if dts <= last {
                return Err(CodingError::invalid_timestamp(dts, last));
            }
        }

        let meta = serde_json::to_vec(&SampleMeta {
            pts: sample.pts,
            dts,
            duration: sample.duration,
            is_keyframe: sample.is_keyframe,
        })?;
        let meta_len = record_len(meta.len())?;
        let data_len = record_len(sample.data.len())?;

        let pass = state.pass;
        let Some(segment) = state.segment.as_mut() else {
            return Err(CodingError::StorageInvalid("no open segment".into()));
        };
        let offset = segment.len;
        segment.writer.write_u32::<BigEndian>(meta_len)?;
        segment.writer.write_all(&meta)?;
        segment.writer.write_u32::<BigEndian>(data_len)?;
        segment.writer.write_all(&sample.data)?;
        segment.len += 8 + meta.len() as u64 + sample.data.len() as u64;

        state.index.insert(dts, SiloEntry { pass, offset });
        state.last_dts = Some(dts);
        state.last_end = Some(sample.duration.map_or(dts, |d| dts + d));
        Ok(())
    }

    /// Start the next pass over `ranges`.
    ///
    /// Stored samples inside the ranges are discarded. Invalid ranges are
    /// rejected and leave the silo unchanged.
    pub fn set_time_ranges_for_next_pass(&self, ranges: &[TimeRange]) -> CodingResult<()> {
        validate_time_ranges(ranges)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(CodingError::StorageInvalid("frame silo has been closed".into()));
        }

        let next = state.pass + 1;
        let segment = open_segment(self.backing.path(), next)?;
        state.flush()?;

        let before = state.index.len();
        state.index.retain(|dts, _| !ranges_contain(ranges, *dts));
        let removed = before - state.index.len();

        state.segment = Some(segment);
        state.pass = next;
        state.ranges = Some(ranges.to_vec());
        state.last_dts = None;
        state.last_end = None;

        info!(
            pass = next,
            ranges = ranges.len(),
            removed,
            kept = state.index.len(),
            "Frame silo prepared for next pass"
        );
        Ok(())
    }

    /// Fraction of the current pass covered so far, from the end of the
    /// most recently added sample.
    ///
    /// The first pass is measured against the valid range; it reports 0.0
    /// when there is none.
    pub fn progress_of_current_pass(&self) -> f32 {
        let state = self.state.lock();
        let window: Vec<TimeRange> = match (&state.ranges, self.valid_range) {
            (Some(ranges), _) => ranges.clone(),
            (None, Some(range)) => vec![range],
            (None, None) => return 0.0,
        };
        let Some(position) = state.last_end else {
            return 0.0;
        };

        let total: f64 = window.iter().map(|r| r.duration.as_secs()).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let covered: f64 = window
            .iter()
            .map(|r| {
                if position >= r.end() {
                    r.duration.as_secs()
                } else if position > r.start {
                    (position - r.start).as_secs()
                } else {
                    0.0
                }
            })
            .sum();
        (covered / total).clamp(0.0, 1.0) as f32
    }

    /// Visit the merged samples in decode order, optionally restricted to
    /// `range`. An error returned by `f` stops the iteration and is passed
    /// back to the caller.
    ///
    /// The silo is not locked while `f` runs.
    pub fn for_each_sample<E, F>(&self, range: Option<TimeRange>, mut f: F) -> Result<(), E>
    where
        E: From<CodingError>,
        F: FnMut(EncodedSample) -> Result<(), E>,
    {
        let entries: Vec<SiloEntry> = {
            let mut state = self.state.lock();
            state.flush().map_err(E::from)?;
            state
                .index
                .iter()
                .filter(|(dts, _)| range.map_or(true, |r| r.contains(**dts)))
                .map(|(_, entry)| *entry)
                .collect()
        };

        let mut readers: HashMap<u32, BufReader<File>> = HashMap::new();
        for entry in entries {
            let reader = match readers.entry(entry.pass) {
                std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
                std::collections::hash_map::Entry::Vacant(v) => {
                    let file = File::open(segment_path(self.backing.path(), entry.pass))
                        .map_err(|e| E::from(CodingError::from(e)))?;
                    v.insert(BufReader::new(file))
                }
            };
            let sample = read_sample(reader, entry.offset).map_err(E::from)?;
            f(sample)?;
        }
        Ok(())
    }

    /// Collect the merged samples in decode order.
    pub fn samples(&self, range: Option<TimeRange>) -> CodingResult<Vec<EncodedSample>> {
        let mut out = Vec::new();
        self.for_each_sample(range, |sample| -> CodingResult<()> {
            out.push(sample);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current pass number, starting at 1.
    pub fn current_pass(&self) -> u32 {
        self.state.lock().pass
    }

    pub fn time_ranges(&self) -> Option<Vec<TimeRange>> {
        self.state.lock().ranges.clone()
    }

    pub fn path(&self) -> &Path {
        self.backing.path()
    }

    /// Flush and stop accepting samples. Stored samples stay readable.
    pub fn close(&self) -> CodingResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let result = state.flush();
        state.segment = None;
        state.closed = true;
        info!(
            path = %self.backing.path().display(),
            samples = state.index.len(),
            passes = state.pass,
            "Frame silo closed"
        );
        result
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Drop for FrameSilo {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(e) = state.flush() {
            warn!(path = %self.backing.path().display(), error = %e, "Failed to flush frame silo");
        }
        state.segment = None;
    }
}

impl std::fmt::Debug for FrameSilo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FrameSilo")
            .field("path", &self.backing.path())
            .field("pass", &state.pass)
            .field("samples", &state.index.len())
            .field("closed", &state.closed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Segment files
// ---------------------------------------------------------------------------

fn open_segment(dir: &Path, pass: u32) -> CodingResult<Segment> {
    let path = segment_path(dir, pass);
    let file = File::create(&path)?;
    debug!(path = %path.display(), pass, "Opened silo segment");
    Ok(Segment {
        writer: BufWriter::new(file),
        len: 0,
    })
}

fn record_len(len: usize) -> CodingResult<u32> {
    u32::try_from(len)
        .map_err(|_| CodingError::InvalidParameter(format!("sample of {len} bytes is too large")))
}

fn read_sample(reader: &mut BufReader<File>, offset: u64) -> CodingResult<EncodedSample> {
    reader.seek(SeekFrom::Start(offset))?;
    let meta_len = reader.read_u32::<BigEndian>()? as usize;
    let mut meta = vec![0u8; meta_len];
    reader.read_exact(&mut meta)?;
    let meta: SampleMeta = serde_json::from_slice(&meta)?;

    let data_len = reader.read_u32::<BigEndian>()? as usize;
    let mut data = vec![0u8; data_len];
    reader.read_exact(&mut data)?;

    Ok(EncodedSample {
        data,
        pts: meta.pts,
        dts: meta.dts,
        duration: meta.duration,
        is_keyframe: meta.is_keyframe,
    })
}

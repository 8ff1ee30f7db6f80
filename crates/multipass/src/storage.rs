//! Timestamp-keyed storage shared by an encoder across passes.
//!
//! Entries are kept in memory and mirrored to an append-only log in the
//! backing location, so a storage can be reopened with [`MultiPassStorage::open`].
//!
//! Log layout (big-endian):
//!
//! ```text
//! header:  "VMPS" version:u8
//! record:  value:i64 timescale:u32 len:u32 data[len]
//! ```
//!
//! A later record for the same timestamp replaces an earlier one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vcs_common::{
    ranges_contain, validate_time_ranges, CodingError, CodingResult, MediaTime, MultiPassConfig,
    MultiPassStore, TimeRange,
};

use crate::backing::Backing;

const LOG_FILE: &str = "multipass.log";
const LOG_MAGIC: &[u8; 4] = b"VMPS";
const LOG_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct OpenPass {
    ranges: Option<Vec<TimeRange>>,
    written: BTreeSet<MediaTime>,
}

struct StorageState {
    closed: bool,
    pass: Option<OpenPass>,
    passes_begun: u32,
    entries: BTreeMap<MediaTime, Vec<u8>>,
    log: Option<BufWriter<File>>,
}

impl StorageState {
    fn check_open(&self) -> CodingResult<()> {
        if self.closed {
            return Err(CodingError::StorageInvalid("storage has been closed".into()));
        }
        Ok(())
    }

    fn flush(&mut self) -> CodingResult<()> {
        if let Some(log) = self.log.as_mut() {
            log.flush()?;
        }
        Ok(())
    }
}

/// Durable multi-pass storage.
pub struct MultiPassStorage {
    // Declared before `backing` so the log is closed before a temporary
    // directory is removed.
    state: Mutex<StorageState>,
    valid_range: Option<TimeRange>,
    log_path: PathBuf,
    backing: Backing,
}

impl MultiPassStorage {
    /// Create an empty storage.
    ///
    /// With `location`, the log is written there and kept; otherwise a
    /// temporary directory is used and removed when the storage is dropped.
    /// Writes outside `valid_range` are rejected.
    pub fn create(
        location: Option<&Path>,
        valid_range: Option<TimeRange>,
        config: &MultiPassConfig,
    ) -> CodingResult<Self> {
        if let Some(range) = valid_range {
            validate_time_ranges(&[range])?;
        }
        let backing = Backing::create(location, config, "vcs-multipass-")?;
        let log_path = backing.path().join(LOG_FILE);

        let mut log = BufWriter::new(File::create(&log_path)?);
        log.write_all(LOG_MAGIC)?;
        log.write_u8(LOG_VERSION)?;
        log.flush()?;

        info!(
            path = %log_path.display(),
            valid_range = ?valid_range.map(|r| r.to_string()),
            "Multi-pass storage created"
        );

        Ok(Self::from_parts(backing, log_path, valid_range, BTreeMap::new(), log))
    }

    /// Reopen a storage previously created at `location`.
    pub fn open(location: &Path, valid_range: Option<TimeRange>) -> CodingResult<Self> {
        let log_path = location.join(LOG_FILE);
        if !log_path.is_file() {
            return Err(CodingError::StorageInvalid(format!(
                "no multi-pass log at {}",
                log_path.display()
            )));
        }
        let entries = replay_log(&log_path)?;
        let backing = Backing::create(Some(location), &MultiPassConfig::default(), "")?;
        let log = BufWriter::new(OpenOptions::new().append(true).open(&log_path)?);

        info!(
            path = %log_path.display(),
            entries = entries.len(),
            "Multi-pass storage reopened"
        );

        Ok(Self::from_parts(backing, log_path, valid_range, entries, log))
    }

    fn from_parts(
        backing: Backing,
        log_path: PathBuf,
        valid_range: Option<TimeRange>,
        entries: BTreeMap<MediaTime, Vec<u8>>,
        log: BufWriter<File>,
    ) -> Self {
        Self {
            state: Mutex::new(StorageState {
                closed: false,
                pass: None,
                passes_begun: 0,
                entries,
                log: Some(log),
            }),
            valid_range,
            log_path,
            backing,
        }
    }

    /// Flush pending writes and refuse all further access.
    pub fn close(&self) -> CodingResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        let result = state.flush();
        state.log = None;
        state.pass = None;
        state.closed = true;
        info!(
            path = %self.log_path.display(),
            entries = state.entries.len(),
            "Multi-pass storage closed"
        );
        result
    }

    pub fn path(&self) -> &Path {
        self.backing.path()
    }

    pub fn valid_range(&self) -> Option<TimeRange> {
        self.valid_range
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of passes begun since this storage was created or opened.
    pub fn passes_begun(&self) -> u32 {
        self.state.lock().passes_begun
    }

    pub fn in_pass(&self) -> bool {
        self.state.lock().pass.is_some()
    }
}

impl MultiPassStore for MultiPassStorage {
    fn begin_pass(&self, ranges: Option<&[TimeRange]>) -> CodingResult<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.pass.is_some() {
            return Err(CodingError::StorageInvalid(
                "a pass is already in progress".into(),
            ));
        }
        if let Some(ranges) = ranges {
            validate_time_ranges(ranges)?;
        }
        state.passes_begun += 1;
        state.pass = Some(OpenPass {
            ranges: ranges.map(<[TimeRange]>::to_vec),
            written: BTreeSet::new(),
        });
        debug!(
            pass = state.passes_begun,
            ranges = ranges.map_or(0, |r| r.len()),
            "Storage pass begun"
        );
        Ok(())
    }

    fn end_pass(&self) -> CodingResult<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        let Some(pass) = state.pass.take() else {
            return Err(CodingError::StorageInvalid("no pass in progress".into()));
        };
        state.flush()?;
        debug!(
            pass = state.passes_begun,
            written = pass.written.len(),
            "Storage pass ended"
        );
        Ok(())
    }

    fn store(&self, timestamp: MediaTime, data: &[u8]) -> CodingResult<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        timestamp.validate()?;
        if let Some(range) = self.valid_range {
            if !range.contains(timestamp) {
                return Err(CodingError::InvalidTimeRange(format!(
                    "{timestamp} is outside the valid range {range}"
                )));
            }
        }
        let Some(pass) = state.pass.as_ref() else {
            return Err(CodingError::StorageInvalid(
                "store called outside of a pass".into(),
            ));
        };
        if let Some(ranges) = &pass.ranges {
            if !ranges_contain(ranges, timestamp) {
                return Err(CodingError::InvalidTimeRange(format!(
                    "{timestamp} is outside the ranges of the current pass"
                )));
            }
        }
        if pass.written.contains(&timestamp) {
            return Err(CodingError::invalid_timestamp(timestamp, timestamp));
        }

        // Nothing is recorded unless the whole record reached the log.
        let record = encode_record(timestamp, data)?;
        if let Some(log) = state.log.as_mut() {
            log.write_all(&record)?;
        }
        if let Some(pass) = state.pass.as_mut() {
            pass.written.insert(timestamp);
        }
        state.entries.insert(timestamp, data.to_vec());
        Ok(())
    }

    fn load(&self, timestamp: MediaTime) -> CodingResult<Option<Vec<u8>>> {
        let state = self.state.lock();
        state.check_open()?;
        Ok(state.entries.get(&timestamp).cloned())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Drop for MultiPassStorage {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Err(e) = state.flush() {
            warn!(path = %self.log_path.display(), error = %e, "Failed to flush multi-pass log");
        }
        state.log = None;
    }
}

impl std::fmt::Debug for MultiPassStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MultiPassStorage")
            .field("path", &self.log_path)
            .field("entries", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Log replay
// ---------------------------------------------------------------------------

fn replay_log(path: &Path) -> CodingResult<BTreeMap<MediaTime, Vec<u8>>> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    let version = reader.read_u8()?;
    if &magic != LOG_MAGIC || version != LOG_VERSION {
        return Err(CodingError::StorageInvalid(format!(
            "{} is not a multi-pass log",
            path.display()
        )));
    }

    let mut entries = BTreeMap::new();
    loop {
        let value = match reader.read_i64::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        match read_record_body(&mut reader) {
            Ok((timescale, data)) if timescale > 0 => {
                entries.insert(MediaTime::new(value, timescale), data);
            }
            Ok(_) => {
                return Err(CodingError::StorageInvalid(format!(
                    "zero timescale in {}",
                    path.display()
                )));
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!(path = %path.display(), "Ignoring truncated record at end of multi-pass log");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(entries)
}

fn encode_record(timestamp: MediaTime, data: &[u8]) -> CodingResult<Vec<u8>> {
    let len = u32::try_from(data.len()).map_err(|_| {
        CodingError::InvalidParameter(format!("entry of {} bytes is too large", data.len()))
    })?;
    let mut record = Vec::with_capacity(16 + data.len());
    record.write_i64::<BigEndian>(timestamp.value)?;
    record.write_u32::<BigEndian>(timestamp.timescale)?;
    record.write_u32::<BigEndian>(len)?;
    record.extend_from_slice(data);
    Ok(record)
}

fn read_record_body(reader: &mut impl Read) -> std::io::Result<(u32, Vec<u8>)> {
    let timescale = reader.read_u32::<BigEndian>()?;
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    Ok((timescale, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcs_common::Status;

    fn t(v: i64) -> MediaTime {
        MediaTime::new(v, 30)
    }

    fn range(start: i64, len: i64) -> TimeRange {
        TimeRange::new(t(start), t(len))
    }

    fn temp_config(parent: &Path) -> MultiPassConfig {
        MultiPassConfig {
            backing_dir: Some(parent.to_path_buf()),
            keep_backing_files: false,
        }
    }

    #[test]
    fn store_and_load_within_pass() {
        let parent = tempfile::tempdir().unwrap();
        let storage = MultiPassStorage::create(None, None, &temp_config(parent.path())).unwrap();

        storage.begin_pass(None).unwrap();
        storage.store(t(0), b"first").unwrap();
        storage.store(t(1), b"second").unwrap();
        storage.end_pass().unwrap();

        assert_eq!(storage.load(t(1)).unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(storage.load(t(5)).unwrap(), None);
        // Equal instants in another timescale hit the same entry.
        assert_eq!(
            storage.load(MediaTime::new(1000, 30_000)).unwrap().as_deref(),
            Some(&b"second"[..])
        );
        assert_eq!(storage.len(), 2);
    }

    #[test]
    fn store_requires_open_pass() {
        let parent = tempfile::tempdir().unwrap();
        let storage = MultiPassStorage::create(None, None, &temp_config(parent.path())).unwrap();
        let err = storage.store(t(0), b"x").unwrap_err();
        assert_eq!(err.status(), Status::StorageInvalid);
        assert!(storage.end_pass().is_err());
    }

    #[test]
    fn rejects_writes_outside_ranges() {
        let parent = tempfile::tempdir().unwrap();
        let storage =
            MultiPassStorage::create(None, Some(range(0, 30)), &temp_config(parent.path()))
                .unwrap();

        storage.begin_pass(None).unwrap();
        let err = storage.store(t(45), b"late").unwrap_err();
        assert_eq!(err.status(), Status::InvalidTimeRange);
        storage.end_pass().unwrap();

        storage.begin_pass(Some(&[range(10, 5)])).unwrap();
        storage.store(t(12), b"inside").unwrap();
        let err = storage.store(t(15), b"end is exclusive").unwrap_err();
        assert_eq!(err.status(), Status::InvalidTimeRange);
        storage.end_pass().unwrap();
    }

    #[test]
    fn duplicate_timestamp_in_one_pass() {
        let parent = tempfile::tempdir().unwrap();
        let storage = MultiPassStorage::create(None, None, &temp_config(parent.path())).unwrap();

        storage.begin_pass(None).unwrap();
        storage.store(t(3), b"a").unwrap();
        let err = storage.store(t(3), b"b").unwrap_err();
        assert_eq!(err.status(), Status::InvalidTimestamp);
        storage.end_pass().unwrap();

        // A later pass may overwrite.
        storage.begin_pass(None).unwrap();
        storage.store(t(3), b"c").unwrap();
        storage.end_pass().unwrap();
        assert_eq!(storage.load(t(3)).unwrap().as_deref(), Some(&b"c"[..]));
        assert_eq!(storage.passes_begun(), 2);
    }

    #[test]
    fn invalid_pass_ranges_are_rejected() {
        let parent = tempfile::tempdir().unwrap();
        let storage = MultiPassStorage::create(None, None, &temp_config(parent.path())).unwrap();
        let err = storage
            .begin_pass(Some(&[range(10, 5), range(12, 5)]))
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidTimeRange);
        assert!(!storage.in_pass());
    }

    #[test]
    fn close_forbids_access() {
        let parent = tempfile::tempdir().unwrap();
        let storage = MultiPassStorage::create(None, None, &temp_config(parent.path())).unwrap();
        storage.begin_pass(None).unwrap();
        storage.store(t(0), b"x").unwrap();
        storage.close().unwrap();

        assert!(storage.is_closed());
        assert_eq!(storage.load(t(0)).unwrap_err().status(), Status::StorageInvalid);
        assert_eq!(storage.begin_pass(None).unwrap_err().status(), Status::StorageInvalid);
        storage.close().unwrap();
    }

    #[test]
    fn reopen_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("stats");
        {
            let storage =
                MultiPassStorage::create(Some(&location), None, &MultiPassConfig::default())
                    .unwrap();
            storage.begin_pass(None).unwrap();
            storage.store(t(0), b"zero").unwrap();
            storage.store(t(1), b"one").unwrap();
            storage.end_pass().unwrap();
            storage.begin_pass(None).unwrap();
            storage.store(t(1), b"uno").unwrap();
            storage.end_pass().unwrap();
            storage.close().unwrap();
        }

        let storage = MultiPassStorage::open(&location, None).unwrap();
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.load(t(0)).unwrap().as_deref(), Some(&b"zero"[..]));
        assert_eq!(storage.load(t(1)).unwrap().as_deref(), Some(&b"uno"[..]));

        storage.begin_pass(None).unwrap();
        storage.store(t(2), b"two").unwrap();
        storage.end_pass().unwrap();
        drop(storage);

        let storage = MultiPassStorage::open(&location, None).unwrap();
        assert_eq!(storage.len(), 3);
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("stats");
        {
            let storage =
                MultiPassStorage::create(Some(&location), None, &MultiPassConfig::default())
                    .unwrap();
            storage.begin_pass(None).unwrap();
            storage.store(t(0), b"complete").unwrap();
            storage.end_pass().unwrap();
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(location.join(LOG_FILE))
            .unwrap();
        file.write_i64::<BigEndian>(1).unwrap();
        file.write_u32::<BigEndian>(30).unwrap();
        file.write_u32::<BigEndian>(100).unwrap();
        file.write_all(b"short").unwrap();
        drop(file);

        let storage = MultiPassStorage::open(&location, None).unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_log_write_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("stats");
        let storage =
            MultiPassStorage::create(Some(&location), None, &MultiPassConfig::default()).unwrap();
        let full = BufWriter::new(OpenOptions::new().write(true).open("/dev/full").unwrap());
        let log = storage.state.lock().log.replace(full);

        // Larger than the writer's buffer, so the failure surfaces here.
        let entry = vec![7u8; 64 * 1024];
        storage.begin_pass(None).unwrap();
        let err = storage.store(t(0), &entry).unwrap_err();
        assert!(matches!(err, CodingError::Io(_)));
        assert_eq!(storage.load(t(0)).unwrap(), None);
        assert!(storage.is_empty());

        storage.state.lock().log = log;
        storage.store(t(0), &entry).unwrap();
        storage.store(t(1), b"next").unwrap();
        storage.end_pass().unwrap();
        storage.close().unwrap();

        let storage = MultiPassStorage::open(&location, None).unwrap();
        assert_eq!(storage.len(), 2);
        assert_eq!(storage.load(t(0)).unwrap(), Some(entry));
        assert_eq!(storage.load(t(1)).unwrap().as_deref(), Some(&b"next"[..]));
    }

    #[test]
    fn open_missing_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = MultiPassStorage::open(&dir.path().join("absent"), None).unwrap_err();
        assert_eq!(err.status(), Status::StorageInvalid);
    }

    #[test]
    fn temporary_backing_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let storage = MultiPassStorage::create(None, None, &temp_config(parent.path())).unwrap();
        let path = storage.path().to_path_buf();
        assert!(path.join(LOG_FILE).is_file());
        drop(storage);
        assert!(!path.exists());
    }
}

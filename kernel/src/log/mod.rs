// Topic Commit Log
//
// Orders a topic's segments, assigns offsets and serves range reads.
// The last segment is the active one; every earlier segment is sealed.

pub mod segment;
pub mod store;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use segment::{FileSegment, SegmentRole, MAX_RECORD_BYTES};
pub use store::{MemorySegment, SegmentRange, SegmentStore};

/// Position of a record within its topic.
pub type Offset = u64;

/// A single immutable entry of a topic log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub offset: Offset,
    /// Milliseconds since the Unix epoch, assigned at append.
    pub timestamp_ms: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("segment {base_offset} is full")]
    SegmentFull { base_offset: Offset },

    #[error("offset sequence violated: expected {expected}, got {actual}")]
    OffsetViolation { expected: Offset, actual: Offset },

    #[error("corrupt segment {segment} at byte {position}: {reason}")]
    Corrupt {
        segment: String,
        position: u64,
        reason: String,
    },

    #[error("record of {size} bytes exceeds the {limit} byte limit")]
    RecordTooLarge { size: u64, limit: u64 },

    #[error("log is closed")]
    Closed,

    #[error("storage i/o: {0}")]
    Io(#[from] io::Error),
}

/// Sizing and durability knobs shared by every segment of a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub segment_max_bytes: u64,
    pub sync_on_append: bool,
}

/// Where a log keeps its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStorage {
    Memory,
    Directory(PathBuf),
}

/// Segmented, append-only log of one topic.
#[derive(Debug)]
pub struct Log {
    storage: LogStorage,
    options: LogOptions,
    /// Ascending by base offset. Never empty while the log is open.
    segments: RwLock<Vec<Arc<dyn SegmentStore>>>,
    /// Serializes appends and rotation.
    append_lock: Mutex<()>,
    next_offset: AtomicU64,
    closed: AtomicBool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Log {
    /// Open a log, recovering any segments already present in its storage.
    ///
    /// Segments must chain without gaps: each base offset equals the
    /// previous segment's next offset, starting from zero.
    pub fn open(storage: LogStorage, options: LogOptions) -> Result<Self, LogError> {
        let mut segments: Vec<Arc<dyn SegmentStore>> = Vec::new();

        if let LogStorage::Directory(dir) = &storage {
            fs::create_dir_all(dir)?;

            let mut bases = Vec::new();
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if let Some(base) = entry
                    .file_name()
                    .to_str()
                    .and_then(segment::parse_segment_file_name)
                {
                    bases.push(base);
                }
            }
            bases.sort_unstable();

            // everything but the tail is read-only
            let mut expected = 0;
            let last = bases.len().saturating_sub(1);
            for (i, base) in bases.into_iter().enumerate() {
                if base != expected {
                    return Err(LogError::OffsetViolation {
                        expected,
                        actual: base,
                    });
                }
                let role = if i == last {
                    SegmentRole::Active
                } else {
                    SegmentRole::Sealed
                };
                let segment = FileSegment::open(dir, base, &options, role)?;
                expected = segment.next_offset();
                segments.push(Arc::new(segment));
            }
        }

        let log = Self {
            storage,
            options,
            segments: RwLock::new(segments),
            append_lock: Mutex::new(()),
            next_offset: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        let next = match log.segments.read().last() {
            Some(active) => active.next_offset(),
            None => 0,
        };
        if log.segments.read().is_empty() {
            let first = log.new_segment(0)?;
            log.segments.write().push(first);
        }
        log.next_offset.store(next, Ordering::SeqCst);

        debug!(
            storage = ?log.storage,
            segments = log.segment_count(),
            next_offset = next,
            "log opened"
        );
        Ok(log)
    }

    fn new_segment(&self, base_offset: Offset) -> Result<Arc<dyn SegmentStore>, LogError> {
        let segment: Arc<dyn SegmentStore> = match &self.storage {
            LogStorage::Memory => Arc::new(MemorySegment::new(
                base_offset,
                self.options.segment_max_bytes,
            )),
            LogStorage::Directory(dir) => {
                Arc::new(FileSegment::open(
                    dir,
                    base_offset,
                    &self.options,
                    SegmentRole::Active,
                )?)
            }
        };
        Ok(segment)
    }

    fn ensure_open(&self) -> Result<(), LogError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(LogError::Closed)
        } else {
            Ok(())
        }
    }

    fn active(&self) -> Result<Arc<dyn SegmentStore>, LogError> {
        self.segments.read().last().cloned().ok_or(LogError::Closed)
    }

    /// Append a record and return its offset.
    ///
    /// When the active segment is full it is sealed and replaced by a new
    /// segment based at this record's offset, and the write is retried once.
    /// Records too large for a frame fail with `RecordTooLarge`.
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<Offset, LogError> {
        segment::body_len(key.len(), value.len())?;
        let _writer = self.append_lock.lock();
        self.ensure_open()?;

        let record = Record {
            offset: self.next_offset.load(Ordering::SeqCst),
            timestamp_ms: now_ms(),
            key: key.to_vec(),
            value: value.to_vec(),
        };

        let active = self.active()?;
        match active.append(&record) {
            Ok(_) => {}
            Err(LogError::SegmentFull { base_offset }) => {
                active.seal()?;
                let fresh = self.new_segment(record.offset)?;
                fresh.append(&record)?;
                self.segments.write().push(fresh);
                info!(
                    storage = ?self.storage,
                    sealed = base_offset,
                    active = record.offset,
                    "segment rotated"
                );
            }
            Err(e) => return Err(e),
        }

        self.next_offset.store(record.offset + 1, Ordering::SeqCst);
        Ok(record.offset)
    }

    /// Read up to `max_count` records starting at `start`, in offset order.
    ///
    /// Reading at or past the end of the log returns an empty vector.
    pub fn read_from(&self, start: Offset, max_count: usize) -> Result<Vec<Record>, LogError> {
        self.ensure_open()?;
        if max_count == 0 || start >= self.next_offset() {
            return Ok(Vec::new());
        }

        // snapshot the covering segments; no lock is held during i/o
        let covering: Vec<Arc<dyn SegmentStore>> = {
            let segments = self.segments.read();
            let first = segments
                .partition_point(|s| s.base_offset() <= start)
                .saturating_sub(1);
            segments[first..].to_vec()
        };

        let mut records = Vec::new();
        let mut cursor = start;
        for segment in covering {
            let wanted = max_count - records.len();
            if wanted == 0 {
                break;
            }
            for record in segment.read_range(cursor, wanted) {
                let record = record.map_err(|e| self.closed_or(e))?;
                if record.offset != cursor {
                    return Err(self.closed_or(LogError::OffsetViolation {
                        expected: cursor,
                        actual: record.offset,
                    }));
                }
                cursor += 1;
                records.push(record);
            }
        }

        // destroyed mid-read; what was gathered may be partial
        self.ensure_open()?;
        Ok(records)
    }

    /// `Closed` when a concurrent destroy explains `err`.
    fn closed_or(&self, err: LogError) -> LogError {
        if self.is_closed() {
            LogError::Closed
        } else {
            err
        }
    }

    /// Highest offset ever written, `None` for an empty log.
    pub fn highest_offset(&self) -> Option<Offset> {
        self.next_offset().checked_sub(1)
    }

    /// Offset the next append will be assigned.
    pub fn next_offset(&self) -> Offset {
        self.next_offset.load(Ordering::SeqCst)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn storage(&self) -> &LogStorage {
        &self.storage
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the log and delete all of its segments.
    ///
    /// Appends and reads issued afterwards fail with `Closed`.
    pub fn destroy(&self) -> Result<(), LogError> {
        let _writer = self.append_lock.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let segments = std::mem::take(&mut *self.segments.write());
        for segment in segments {
            segment.remove()?;
        }

        if let LogStorage::Directory(dir) = &self.storage {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(storage = ?self.storage, "log destroyed");
        Ok(())
    }
}

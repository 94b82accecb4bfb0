// Segment Storage Abstraction
//
// Defines the contract for a single bounded, append-only segment.
// Implementations may persist to disk or keep records in memory.

use parking_lot::RwLock;

use super::segment::frame_len;
use super::{LogError, Offset, Record};

/// Storage backend for one segment of a topic log.
///
/// Properties required from implementations:
/// - Append-only, in offset order starting at `base_offset`
/// - Bounded by `capacity_bytes`; the first record is always accepted
/// - Sealed exactly when a write would overflow it
///
/// Implementations MUST NOT:
/// - Mutate or reorder written records
/// - Expose a record before it is completely written
pub trait SegmentStore: Send + Sync + std::fmt::Debug {
    /// Offset of the first record this segment holds.
    fn base_offset(&self) -> Offset;

    /// Offset the next appended record must carry.
    fn next_offset(&self) -> Offset;

    /// Bytes written so far, framing included.
    fn size_bytes(&self) -> u64;

    fn is_sealed(&self) -> bool;

    /// Append a record. Returns its position relative to `base_offset`.
    ///
    /// Fails with `SegmentFull` (and seals the segment) when the record
    /// does not fit.
    fn append(&self, record: &Record) -> Result<u64, LogError>;

    /// Read the record at an absolute offset, `None` past the end.
    fn read_at(&self, offset: Offset) -> Result<Option<Record>, LogError>;

    /// Flush pending writes and refuse further appends.
    fn seal(&self) -> Result<(), LogError>;

    /// Release the segment's storage.
    fn remove(&self) -> Result<(), LogError>;
}

impl dyn SegmentStore {
    /// Lazily iterate at most `max_count` records starting at `start`.
    ///
    /// The range ends at the segment's write cursor as of this call.
    /// Starting past the end yields nothing.
    pub fn read_range(&self, start: Offset, max_count: usize) -> SegmentRange<'_> {
        SegmentRange {
            segment: self,
            next: start.max(self.base_offset()),
            end: self.next_offset(),
            remaining: max_count,
        }
    }
}

/// Iterator over a contiguous run of records in one segment.
pub struct SegmentRange<'a> {
    segment: &'a dyn SegmentStore,
    next: Offset,
    end: Offset,
    remaining: usize,
}

impl Iterator for SegmentRange<'_> {
    type Item = Result<Record, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.next >= self.end {
            return None;
        }

        match self.segment.read_at(self.next) {
            Ok(Some(record)) => {
                self.next += 1;
                self.remaining -= 1;
                Some(Ok(record))
            }
            Ok(None) => None,
            Err(e) => {
                // stop after the first failure
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Segment kept entirely in memory. Used when no data directory is set.
#[derive(Debug)]
pub struct MemorySegment {
    base_offset: Offset,
    capacity: u64,
    inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: Vec<Record>,
    size: u64,
    sealed: bool,
}

impl MemorySegment {
    pub fn new(base_offset: Offset, capacity: u64) -> Self {
        Self {
            base_offset,
            capacity,
            inner: RwLock::new(MemoryInner::default()),
        }
    }
}

impl SegmentStore for MemorySegment {
    fn base_offset(&self) -> Offset {
        self.base_offset
    }

    fn next_offset(&self) -> Offset {
        self.base_offset + self.inner.read().records.len() as u64
    }

    fn size_bytes(&self) -> u64 {
        self.inner.read().size
    }

    fn is_sealed(&self) -> bool {
        self.inner.read().sealed
    }

    fn append(&self, record: &Record) -> Result<u64, LogError> {
        let mut inner = self.inner.write();
        if inner.sealed {
            return Err(LogError::SegmentFull {
                base_offset: self.base_offset,
            });
        }

        let expected = self.base_offset + inner.records.len() as u64;
        if record.offset != expected {
            return Err(LogError::OffsetViolation {
                expected,
                actual: record.offset,
            });
        }

        let len = frame_len(record);
        if !inner.records.is_empty() && inner.size + len > self.capacity {
            inner.sealed = true;
            return Err(LogError::SegmentFull {
                base_offset: self.base_offset,
            });
        }

        inner.records.push(record.clone());
        inner.size += len;
        Ok(record.offset - self.base_offset)
    }

    fn read_at(&self, offset: Offset) -> Result<Option<Record>, LogError> {
        if offset < self.base_offset {
            return Ok(None);
        }
        let inner = self.inner.read();
        Ok(inner
            .records
            .get((offset - self.base_offset) as usize)
            .cloned())
    }

    fn seal(&self) -> Result<(), LogError> {
        self.inner.write().sealed = true;
        Ok(())
    }

    fn remove(&self) -> Result<(), LogError> {
        let mut inner = self.inner.write();
        inner.records.clear();
        inner.size = 0;
        inner.sealed = true;
        Ok(())
    }
}

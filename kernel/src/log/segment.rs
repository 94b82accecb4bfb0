// File-Backed Segment
//
// One `<base_offset:020>.log` file per segment. Each record is framed as
//
//   len: u32 | crc32: u32 | offset: u64 | timestamp_ms: u64 | key_len: u32 | key | value
//
// all big-endian. `len` counts the bytes after the crc field and the crc
// covers exactly those bytes. Only byte positions are kept in memory; they
// are rebuilt by scanning the file on open.
//
// Reads and writes are positional, so the mutex only guards the position
// table and never a file cursor.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::store::SegmentStore;
use super::{LogError, LogOptions, Offset, Record};

const LOG_SUFFIX: &str = "log";

/// `len` + `crc32`.
const FRAME_HEADER_LEN: usize = 8;

/// `offset` + `timestamp_ms` + `key_len`.
const BODY_FIXED_LEN: usize = 20;

/// Largest key plus value a single frame can carry.
pub const MAX_RECORD_BYTES: u64 = u32::MAX as u64 - BODY_FIXED_LEN as u64;

/// Bytes a record occupies on disk.
pub(crate) fn frame_len(record: &Record) -> u64 {
    (FRAME_HEADER_LEN + BODY_FIXED_LEN + record.key.len() + record.value.len()) as u64
}

/// Encoded body length of a record, or `RecordTooLarge` when it does not
/// fit the frame's `u32` length field.
pub(crate) fn body_len(key_len: usize, value_len: usize) -> Result<u32, LogError> {
    BODY_FIXED_LEN
        .checked_add(key_len)
        .and_then(|n| n.checked_add(value_len))
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(LogError::RecordTooLarge {
            size: (key_len as u64).saturating_add(value_len as u64),
            limit: MAX_RECORD_BYTES,
        })
}

fn encode_frame(record: &Record) -> Result<BytesMut, LogError> {
    let body_len = body_len(record.key.len(), record.value.len())?;

    let mut body = BytesMut::with_capacity(body_len as usize);
    body.put_u64(record.offset);
    body.put_u64(record.timestamp_ms);
    // bounded by body_len
    body.put_u32(record.key.len() as u32);
    body.put_slice(&record.key);
    body.put_slice(&record.value);

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32(body_len);
    frame.put_u32(crc32fast::hash(&body));
    frame.put_slice(&body);
    Ok(frame)
}

fn decode_body(mut body: &[u8]) -> Result<Record, String> {
    if body.remaining() < BODY_FIXED_LEN {
        return Err(format!("record body too short ({} bytes)", body.len()));
    }
    let offset = body.get_u64();
    let timestamp_ms = body.get_u64();
    let key_len = body.get_u32() as usize;
    if body.remaining() < key_len {
        return Err(format!(
            "key length {key_len} exceeds remaining {} bytes",
            body.remaining()
        ));
    }
    let key = body[..key_len].to_vec();
    body.advance(key_len);

    Ok(Record {
        offset,
        timestamp_ms,
        key,
        value: body.to_vec(),
    })
}

pub(crate) fn segment_file_name(base_offset: Offset) -> String {
    format!("{base_offset:020}.{LOG_SUFFIX}")
}

/// Base offset encoded in a segment file name, if it is one.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<Offset> {
    let stem = name.strip_suffix(LOG_SUFFIX)?.strip_suffix('.')?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], position: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, position)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut position: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, position)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut std::mem::take(&mut buf)[n..];
                position += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], position: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, position)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut position: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, position)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                position += n as u64;
            }
        }
    }
    Ok(())
}

/// How an existing segment file is recovered on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    /// Read-only; any incomplete frame is corruption.
    Sealed,
    /// Accepts appends; a torn frame at the tail is truncated.
    Active,
}

/// Segment persisted as a single append-only file.
#[derive(Debug)]
pub struct FileSegment {
    base_offset: Offset,
    path: PathBuf,
    capacity: u64,
    sync_on_append: bool,
    file: File,
    inner: Mutex<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    /// Byte position of each record, indexed by `offset - base_offset`.
    positions: Vec<u64>,
    size: u64,
    sealed: bool,
}

impl FileSegment {
    /// Open the segment starting at `base_offset` inside `dir`, creating
    /// the file if needed.
    ///
    /// Existing contents are scanned and verified. Only an `Active` segment
    /// may lose a torn frame at its tail; anything else that fails to decode
    /// is corrupt.
    pub fn open(
        dir: &Path,
        base_offset: Offset,
        options: &LogOptions,
        role: SegmentRole,
    ) -> Result<Self, LogError> {
        let path = dir.join(segment_file_name(base_offset));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let (positions, size) = scan(&file, &path, base_offset, role, options.segment_max_bytes)?;
        debug!(
            segment = %path.display(),
            records = positions.len(),
            bytes = size,
            ?role,
            "segment opened"
        );

        Ok(Self {
            base_offset,
            path,
            capacity: options.segment_max_bytes,
            sync_on_append: options.sync_on_append,
            file,
            inner: Mutex::new(FileInner {
                positions,
                size,
                sealed: role == SegmentRole::Sealed,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, position: u64, reason: impl Into<String>) -> LogError {
        LogError::Corrupt {
            segment: self.path.display().to_string(),
            position,
            reason: reason.into(),
        }
    }
}

/// Walk every frame in the file. Returns record positions and the length
/// of the valid prefix.
///
/// A frame is torn, rather than corrupt, only when the file ends inside it
/// and its header is plausible: the length could have been written by an
/// append into this segment and the visible part of the body starts with
/// the expected offset.
fn scan(
    file: &File,
    path: &Path,
    base_offset: Offset,
    role: SegmentRole,
    capacity: u64,
) -> Result<(Vec<u64>, u64), LogError> {
    let len = usize::try_from(file.metadata()?.len())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut data = vec![0u8; len];
    read_exact_at(file, &mut data, 0)?;

    let corrupt = |position: usize, reason: String| LogError::Corrupt {
        segment: path.display().to_string(),
        position: position as u64,
        reason,
    };

    let mut positions = Vec::new();
    let mut position = 0usize;
    while position < data.len() {
        let rest = &data[position..];
        if rest.len() < FRAME_HEADER_LEN {
            break;
        }
        let mut header = &rest[..FRAME_HEADER_LEN];
        let body_len = header.get_u32() as usize;
        let crc = header.get_u32();
        if body_len < BODY_FIXED_LEN {
            return Err(corrupt(position, format!("frame length {body_len} below minimum")));
        }

        let expected = base_offset + positions.len() as u64;
        if rest.len() < FRAME_HEADER_LEN + body_len {
            // only the first frame of a segment may exceed its capacity
            let frame_end = (position + FRAME_HEADER_LEN + body_len) as u64;
            if !positions.is_empty() && frame_end > capacity {
                return Err(corrupt(
                    position,
                    format!("frame length {body_len} overruns segment capacity {capacity}"),
                ));
            }
            let mut visible = &rest[FRAME_HEADER_LEN..];
            if visible.len() >= 8 {
                let offset = visible.get_u64();
                if offset != expected {
                    return Err(corrupt(
                        position,
                        format!("partial frame carries offset {offset}, expected {expected}"),
                    ));
                }
            }
            break;
        }

        let body = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len];
        if crc32fast::hash(body) != crc {
            return Err(corrupt(position, "checksum mismatch".into()));
        }
        let record = decode_body(body).map_err(|reason| corrupt(position, reason))?;

        if record.offset != expected {
            return Err(LogError::OffsetViolation {
                expected,
                actual: record.offset,
            });
        }

        positions.push(position as u64);
        position += FRAME_HEADER_LEN + body_len;
    }

    if position < data.len() {
        if role == SegmentRole::Sealed {
            return Err(corrupt(position, "incomplete frame in sealed segment".into()));
        }
        warn!(
            segment = %path.display(),
            valid_bytes = position,
            dropped_bytes = data.len() - position,
            "truncating torn record at segment tail"
        );
        file.set_len(position as u64)?;
        file.sync_data()?;
    }

    Ok((positions, position as u64))
}

impl SegmentStore for FileSegment {
    fn base_offset(&self) -> Offset {
        self.base_offset
    }

    fn next_offset(&self) -> Offset {
        self.base_offset + self.inner.lock().positions.len() as u64
    }

    fn size_bytes(&self) -> u64 {
        self.inner.lock().size
    }

    fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    fn append(&self, record: &Record) -> Result<u64, LogError> {
        let frame = encode_frame(record)?;
        let len = frame.len() as u64;

        let mut inner = self.inner.lock();
        if inner.sealed {
            return Err(LogError::SegmentFull {
                base_offset: self.base_offset,
            });
        }

        let expected = self.base_offset + inner.positions.len() as u64;
        if record.offset != expected {
            return Err(LogError::OffsetViolation {
                expected,
                actual: record.offset,
            });
        }

        if !inner.positions.is_empty() && inner.size + len > self.capacity {
            inner.sealed = true;
            self.file.sync_data()?;
            return Err(LogError::SegmentFull {
                base_offset: self.base_offset,
            });
        }

        let position = inner.size;
        if let Err(e) = write_all_at(&self.file, &frame, position) {
            // drop whatever part of the frame made it out
            self.file.set_len(position)?;
            return Err(e.into());
        }
        if self.sync_on_append {
            self.file.sync_data()?;
        }

        inner.positions.push(position);
        inner.size += len;
        Ok(record.offset - self.base_offset)
    }

    fn read_at(&self, offset: Offset) -> Result<Option<Record>, LogError> {
        if offset < self.base_offset {
            return Ok(None);
        }

        let position = {
            let inner = self.inner.lock();
            match inner.positions.get((offset - self.base_offset) as usize) {
                Some(&position) => position,
                None => return Ok(None),
            }
        };

        let mut header = [0u8; FRAME_HEADER_LEN];
        read_exact_at(&self.file, &mut header, position)?;
        let mut header = &header[..];
        let body_len = header.get_u32() as usize;
        let crc = header.get_u32();

        let mut body = vec![0u8; body_len];
        read_exact_at(&self.file, &mut body, position + FRAME_HEADER_LEN as u64)?;

        if crc32fast::hash(&body) != crc {
            return Err(self.corrupt(position, "checksum mismatch"));
        }
        let record = decode_body(&body).map_err(|reason| self.corrupt(position, reason))?;
        if record.offset != offset {
            return Err(LogError::OffsetViolation {
                expected: offset,
                actual: record.offset,
            });
        }
        Ok(Some(record))
    }

    fn seal(&self) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        if !inner.sealed {
            self.file.sync_data()?;
            inner.sealed = true;
        }
        Ok(())
    }

    fn remove(&self) -> Result<(), LogError> {
        self.inner.lock().sealed = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Segment data files: the writable active segment and sequential scans.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::io::Write;
use std::path::Path;

use crate::entry::Entry;
use crate::{CodecError, IoMode};

/// A bounded append-only segment file.
///
/// The engine keeps exactly one `DataFile` open for writing (the active
/// segment). `write_off` is owned by the caller: recovery computes it from
/// the log, merge starts a fresh destination at zero.
pub struct DataFile {
    pub file_id: u64,
    file: File,
    pub write_off: u64,
}

impl DataFile {
    /// Opens (creating if absent) the segment at `path` for reading and
    /// appending.
    pub fn open(path: &Path, file_id: u64) -> Result<Self, CodecError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file_id,
            file,
            write_off: 0,
        })
    }

    /// Appends `entry` at the current write offset and returns the
    /// post-write offset.
    pub fn append(&mut self, entry: &Entry) -> Result<u64, CodecError> {
        let bytes = entry.encode()?;
        self.file.seek(SeekFrom::Start(self.write_off))?;
        self.file.write_all(&bytes)?;
        self.write_off += bytes.len() as u64;
        Ok(self.write_off)
    }

    /// Reads the record starting at `offset`. `Ok(None)` signals EOF or an
    /// incomplete tail.
    pub fn read_at(&mut self, offset: u64) -> Result<Option<Entry>, CodecError> {
        self.file.seek(SeekFrom::Start(offset))?;
        Entry::read_from(&mut self.file)
    }

    /// fsyncs the segment.
    pub fn sync(&self) -> Result<(), CodecError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// One-shot random read used when an index holds only a pointer. Opens the
/// file per call to keep ownership simple, the same way a point lookup
/// against a sealed table would.
pub fn read_entry_at(path: &Path, offset: u64) -> Result<Option<Entry>, CodecError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    Entry::read_from(&mut file)
}

enum StreamReader {
    File(File),
    Buffered(BufReader<File>),
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            StreamReader::File(f) => f.read(buf),
            StreamReader::Buffered(r) => r.read(buf),
        }
    }
}

/// Sequential scan over one segment, from offset zero upward.
///
/// The stream stops cleanly at EOF, at an incomplete tail, and at the
/// segment-size cap: a record that would *start* at or past `cap` is never
/// read, so a segment filled exactly to its cap terminates without error.
pub struct EntryStream {
    reader: StreamReader,
    offset: u64,
    cap: u64,
}

impl EntryStream {
    pub fn open(path: &Path, cap: u64, mode: IoMode) -> Result<Self, CodecError> {
        let file = File::open(path)?;
        let reader = match mode {
            IoMode::FileIo => StreamReader::File(file),
            IoMode::Buffered => StreamReader::Buffered(BufReader::new(file)),
        };
        Ok(Self {
            reader,
            offset: 0,
            cap,
        })
    }

    /// Yields the next `(offset, entry)` pair, or `None` when the segment is
    /// exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(u64, Entry)>, CodecError> {
        if self.offset >= self.cap {
            return Ok(None);
        }
        match Entry::read_from(&mut self.reader)? {
            None => Ok(None),
            Some(entry) => {
                let offset = self.offset;
                self.offset += entry.size();
                Ok(Some((offset, entry)))
            }
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

//! Sparse-mode persisted index records.
//!
//! In sparse mode only the newest segment's records are kept in RAM. When a
//! segment seals, the engine persists a [`RootIndex`] (the segment's fence
//! keys over the cross-bucket composite key space) under
//! `bpt/root/<id>.ridx`, and a snapshot of the committed transaction ids
//! under `bpt/txid/<id>.tidx`. Recovery streams these back so the engine
//! can route a key to the sealed segment that owns it without loading full
//! records.
//!
//! Root record layout (little-endian, crc over everything after the crc):
//!
//! ```text
//! crc32(u32) | file_id(u64) | start_len(u32) | end_len(u32) | start | end
//! ```
//!
//! The txid file is a plain stream of `u64` ids; a torn tail truncates it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::Path;

use crate::CodecError;

/// Fence-key pointer for one sealed segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootIndex {
    pub file_id: u64,
    /// Smallest composite key the segment holds.
    pub start_key: Vec<u8>,
    /// Largest composite key the segment holds.
    pub end_key: Vec<u8>,
}

impl RootIndex {
    pub fn size(&self) -> u64 {
        4 + 8 + 4 + 4 + self.start_key.len() as u64 + self.end_key.len() as u64
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::with_capacity(self.size() as usize - 4);
        body.write_u64::<LittleEndian>(self.file_id)?;
        body.write_u32::<LittleEndian>(self.start_key.len() as u32)?;
        body.write_u32::<LittleEndian>(self.end_key.len() as u32)?;
        body.extend_from_slice(&self.start_key);
        body.extend_from_slice(&self.end_key);

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(body.len() + 4);
        out.write_u32::<LittleEndian>(crc)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Reads one root record; `Ok(None)` on EOF or an incomplete tail.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>, CodecError> {
        let mut header = [0u8; 20];
        if let Err(e) = r.read_exact(&mut header) {
            return if e.kind() == ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(e.into())
            };
        }

        let mut h = &header[..];
        let crc = h.read_u32::<LittleEndian>()?;
        let file_id = h.read_u64::<LittleEndian>()?;
        let start_len = h.read_u32::<LittleEndian>()? as usize;
        let end_len = h.read_u32::<LittleEndian>()? as usize;

        let mut payload = vec![0u8; start_len + end_len];
        if let Err(e) = r.read_exact(&mut payload) {
            return if e.kind() == ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(e.into())
            };
        }

        let mut hasher = Crc32::new();
        hasher.update(&header[4..]);
        hasher.update(&payload);
        if hasher.finalize() != crc {
            return Err(CodecError::Corrupt);
        }

        Ok(Some(RootIndex {
            file_id,
            start_key: payload[..start_len].to_vec(),
            end_key: payload[start_len..].to_vec(),
        }))
    }
}

/// Appends one root record to the segment's root-index file.
pub fn append_root_index(path: &Path, root: &RootIndex) -> Result<(), CodecError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&root.encode()?)?;
    file.sync_all()?;
    Ok(())
}

/// Streams all root records from `path`. A missing file yields an empty set.
pub fn load_root_index(path: &Path) -> Result<Vec<RootIndex>, CodecError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut roots = Vec::new();
    while let Some(root) = RootIndex::read_from(&mut reader)? {
        roots.push(root);
    }
    Ok(roots)
}

/// Writes a committed-txid snapshot for a sealed segment.
pub fn write_txid_index(path: &Path, ids: impl IntoIterator<Item = u64>) -> Result<(), CodecError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    for id in ids {
        file.write_u64::<LittleEndian>(id)?;
    }
    file.sync_all()?;
    Ok(())
}

/// Loads a committed-txid snapshot. A missing file yields an empty set; a
/// torn tail truncates.
pub fn load_txid_index(path: &Path) -> Result<Vec<u64>, CodecError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut ids = Vec::new();
    loop {
        match reader.read_u64::<LittleEndian>() {
            Ok(id) => ids.push(id),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ids)
}

//! Log record definitions and the on-disk codec.
//!
//! Every record in a segment file has the same shape:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ crc32 (u32, covers everything after this field)              │
//! │ timestamp (u64) | tx_id (u64) | ttl (u32)                    │
//! │ flag (u16) | status (u16) | ds (u16)                         │
//! │ bucket_len (u32) | key_len (u32) | value_len (u32)           │
//! ├──────────────────────────────────────────────────────────────┤
//! │ bucket bytes | key bytes | value bytes                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The flag, status and data-structure
//! ordinals are part of the on-disk format and must never be renumbered.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::io::{ErrorKind, Read};

use crate::CodecError;

/// TTL value meaning "never expires".
pub const PERSISTENT: u32 = 0;

/// Operation carried by a record. Ordinals are stable on-disk values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Flag {
    Delete = 0,
    Set = 1,
    LPush = 2,
    RPush = 3,
    LRem = 4,
    LPop = 5,
    RPop = 6,
    LSet = 7,
    LTrim = 8,
    ZAdd = 9,
    ZRem = 10,
    ZRemRangeByRank = 11,
    ZPopMax = 12,
    ZPopMin = 13,
}

impl Flag {
    pub fn from_u16(raw: u16) -> Result<Self, CodecError> {
        Ok(match raw {
            0 => Flag::Delete,
            1 => Flag::Set,
            2 => Flag::LPush,
            3 => Flag::RPush,
            4 => Flag::LRem,
            5 => Flag::LPop,
            6 => Flag::RPop,
            7 => Flag::LSet,
            8 => Flag::LTrim,
            9 => Flag::ZAdd,
            10 => Flag::ZRem,
            11 => Flag::ZRemRangeByRank,
            12 => Flag::ZPopMax,
            13 => Flag::ZPopMin,
            other => return Err(CodecError::UnknownFlag(other)),
        })
    }

    /// True for opcodes that remove data rather than add it. Merge drops
    /// these outright: once applied to the in-memory indexes they carry no
    /// further information.
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            Flag::Delete
                | Flag::LRem
                | Flag::LPop
                | Flag::RPop
                | Flag::LTrim
                | Flag::ZRem
                | Flag::ZRemRangeByRank
                | Flag::ZPopMax
                | Flag::ZPopMin
        )
    }
}

/// Which logical structure a record mutates. Stable on-disk ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DataStructure {
    Set = 0,
    SortedSet = 1,
    Tree = 2,
    List = 3,
}

impl DataStructure {
    pub fn from_u16(raw: u16) -> Result<Self, CodecError> {
        Ok(match raw {
            0 => DataStructure::Set,
            1 => DataStructure::SortedSet,
            2 => DataStructure::Tree,
            3 => DataStructure::List,
            other => return Err(CodecError::UnknownDataStructure(other)),
        })
    }
}

/// Transaction status of a record. Only the final record of a write
/// transaction is written as `Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Uncommitted = 0,
    Committed = 1,
}

impl Status {
    pub fn from_u16(raw: u16) -> Result<Self, CodecError> {
        Ok(match raw {
            0 => Status::Uncommitted,
            1 => Status::Committed,
            other => return Err(CodecError::UnknownStatus(other)),
        })
    }
}

/// Record metadata, serialized in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub flag: Flag,
    pub ds: DataStructure,
    pub status: Status,
    pub tx_id: u64,
    /// Lifetime in seconds; [`PERSISTENT`] means no expiry.
    pub ttl: u32,
    /// Creation time, seconds since the Unix epoch.
    pub timestamp: u64,
}

impl Meta {
    /// Whether `(ttl, timestamp)` places this record in the past at `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.ttl != PERSISTENT && self.timestamp + u64::from(self.ttl) <= now
    }
}

/// One serialized log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub meta: Meta,
}

/// Serialized header length: crc + timestamp + tx_id + ttl + flag + status
/// + ds + three payload lengths.
pub const HEADER_SIZE: u64 = 4 + 8 + 8 + 4 + 2 + 2 + 2 + 4 + 4 + 4;

impl Entry {
    /// Serialized length of this record, used for offset arithmetic.
    pub fn size(&self) -> u64 {
        HEADER_SIZE + self.bucket.len() as u64 + self.key.len() as u64 + self.value.len() as u64
    }

    /// Serializes the record, checksum first.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::with_capacity(self.size() as usize - 4);
        body.write_u64::<LittleEndian>(self.meta.timestamp)?;
        body.write_u64::<LittleEndian>(self.meta.tx_id)?;
        body.write_u32::<LittleEndian>(self.meta.ttl)?;
        body.write_u16::<LittleEndian>(self.meta.flag as u16)?;
        body.write_u16::<LittleEndian>(self.meta.status as u16)?;
        body.write_u16::<LittleEndian>(self.meta.ds as u16)?;
        body.write_u32::<LittleEndian>(self.bucket.len() as u32)?;
        body.write_u32::<LittleEndian>(self.key.len() as u32)?;
        body.write_u32::<LittleEndian>(self.value.len() as u32)?;
        body.extend_from_slice(&self.bucket);
        body.extend_from_slice(&self.key);
        body.extend_from_slice(&self.value);

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut out = Vec::with_capacity(body.len() + 4);
        out.write_u32::<LittleEndian>(crc)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Reads one record from `r`.
    ///
    /// Returns `Ok(None)` on a clean EOF **and** on an incomplete tail (the
    /// header or a payload cut short of its declared length) so that an
    /// unclean shutdown never fails recovery. A fully-present record whose
    /// checksum does not match is a [`CodecError::Corrupt`] error.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Entry>, CodecError> {
        let mut header = [0u8; HEADER_SIZE as usize];
        if let Err(e) = r.read_exact(&mut header) {
            return if e.kind() == ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(e.into())
            };
        }

        let mut h = &header[..];
        let crc = h.read_u32::<LittleEndian>()?;
        let timestamp = h.read_u64::<LittleEndian>()?;
        let tx_id = h.read_u64::<LittleEndian>()?;
        let ttl = h.read_u32::<LittleEndian>()?;
        let flag_raw = h.read_u16::<LittleEndian>()?;
        let status_raw = h.read_u16::<LittleEndian>()?;
        let ds_raw = h.read_u16::<LittleEndian>()?;
        let bucket_len = h.read_u32::<LittleEndian>()? as usize;
        let key_len = h.read_u32::<LittleEndian>()? as usize;
        let value_len = h.read_u32::<LittleEndian>()? as usize;

        let mut payload = vec![0u8; bucket_len + key_len + value_len];
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

        let key_start = bucket_len;
        let value_start = bucket_len + key_len;
        Ok(Some(Entry {
            bucket: payload[..key_start].to_vec(),
            key: payload[key_start..value_start].to_vec(),
            value: payload[value_start..].to_vec(),
            meta: Meta {
                flag: Flag::from_u16(flag_raw)?,
                ds: DataStructure::from_u16(ds_raw)?,
                status: Status::from_u16(status_raw)?,
                tx_id,
                ttl,
                timestamp,
            },
        }))
    }
}

/// A pointer to a record's location in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub key: Vec<u8>,
    pub file_id: u64,
    pub offset: u64,
    pub meta: Meta,
}

/// What the in-memory indexes store: a [`Hint`] plus, in keys-and-values
/// mode, the resident entry. When `entry` is `None` reads must fetch the
/// record back through the hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub hint: Hint,
    pub entry: Option<Entry>,
}

//! Composite-key codec.
//!
//! Sorted-set and list mutations carry structural arguments (a score, an
//! element index) through the entry key: `realKey‖sep‖score` for sorted
//! sets, `realKey‖sep‖index` for list set/trim. The in-memory APIs take
//! structured arguments; concatenation and parsing happen only here, at
//! the storage boundary. Parse failures surface as codec errors, never as
//! silently-dropped fields.

use crate::CodecError;

/// Separator for sorted-set keys. Reserved: user keys must not contain it.
pub const ZSET_KEY_SEP: u8 = b'|';

/// Separator for list set/trim keys. Reserved: user keys must not contain it.
pub const LIST_KEY_SEP: u8 = b'#';

/// `bucket‖key` composite used by the sparse-mode cross-bucket index.
pub fn composite_key(bucket: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bucket.len() + key.len());
    out.extend_from_slice(bucket);
    out.extend_from_slice(key);
    out
}

/// Encodes `key‖sep‖score` for a sorted-set add.
pub fn encode_zset_key(key: &[u8], score: f64) -> Vec<u8> {
    let score_text = score.to_string();
    let mut out = Vec::with_capacity(key.len() + 1 + score_text.len());
    out.extend_from_slice(key);
    out.push(ZSET_KEY_SEP);
    out.extend_from_slice(score_text.as_bytes());
    out
}

/// Splits a sorted-set add key back into `(key, score)`.
pub fn decode_zset_key(raw: &[u8]) -> Result<(Vec<u8>, f64), CodecError> {
    let (key, tail) = split_composite(raw, ZSET_KEY_SEP)?;
    Ok((key, parse_f64(tail)?))
}

/// Encodes `key‖sep‖index` for a list set/trim.
pub fn encode_list_key(key: &[u8], index: i64) -> Vec<u8> {
    let index_text = index.to_string();
    let mut out = Vec::with_capacity(key.len() + 1 + index_text.len());
    out.extend_from_slice(key);
    out.push(LIST_KEY_SEP);
    out.extend_from_slice(index_text.as_bytes());
    out
}

/// Splits a list set/trim key back into `(key, index)`.
pub fn decode_list_key(raw: &[u8]) -> Result<(Vec<u8>, i64), CodecError> {
    let (key, tail) = split_composite(raw, LIST_KEY_SEP)?;
    Ok((key, parse_i64(tail)?))
}

/// Parses a decimal integer field (list counts, rank bounds) stored as text.
pub fn parse_i64(raw: &[u8]) -> Result<i64, CodecError> {
    as_text(raw)?
        .parse::<i64>()
        .map_err(|_| numeric_err(raw))
}

fn parse_f64(raw: &[u8]) -> Result<f64, CodecError> {
    as_text(raw)?
        .parse::<f64>()
        .map_err(|_| numeric_err(raw))
}

/// Splits on the *last* occurrence of `sep`: the tail is engine-written and
/// never contains the separator, while nothing is assumed about the key.
fn split_composite(raw: &[u8], sep: u8) -> Result<(Vec<u8>, &[u8]), CodecError> {
    let pos = raw
        .iter()
        .rposition(|&b| b == sep)
        .ok_or(CodecError::CompositeKey)?;
    Ok((raw[..pos].to_vec(), &raw[pos + 1..]))
}

fn as_text(raw: &[u8]) -> Result<&str, CodecError> {
    std::str::from_utf8(raw).map_err(|_| numeric_err(raw))
}

fn numeric_err(raw: &[u8]) -> CodecError {
    CodecError::Numeric(String::from_utf8_lossy(raw).into_owned())
}

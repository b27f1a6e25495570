//! # structures
//!
//! The in-memory, value-oriented data structures backing the BurrowDB
//! indexes. Everything here is process-local and rebuilt from the log at
//! open time; nothing in this crate touches disk.
//!
//! - [`KeyTree`]: an ordered map over byte keys with range and prefix
//!   queries, used for the per-bucket record index.
//! - [`Set`]: unordered sets of byte values per key.
//! - [`SortedSet`]: one score per member key, ordered by `(score, key)`.
//! - [`List`]: a deque of byte values per key.

use thiserror::Error;

mod key_tree;
mod list;
mod set;
mod sorted_set;

pub use key_tree::KeyTree;
pub use list::List;
pub use set::Set;
pub use sorted_set::SortedSet;

/// Errors from structure mutations that reference positions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructureError {
    /// The addressed key holds no items.
    #[error("no such list")]
    NotFound,

    /// An element index outside the current bounds.
    #[error("index out of range")]
    IndexOutOfRange,
}

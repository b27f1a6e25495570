//! # BurrowDB
//!
//! An embedded, single-process key/value store supporting multiple logical
//! data structures (ordered map, set, sorted set, list) over a single
//! append-only log.
//!
//! ## Key properties
//! - **Log-structured**: every mutation is one record appended to a numbered
//!   segment file; nothing on disk is updated in place.
//! - **Rebuilt at open**: the in-memory indexes are reconstructed from the
//!   log, committed transactions only, torn tails tolerated.
//! - **Transactional facade**: [`Db::view`] and [`Db::update`] run a closure
//!   inside a managed read-only / read-write transaction.
//! - **Compactable**: [`Db::merge`] rewrites sealed segments, retaining only
//!   records still reachable from the live indexes.
//!
//! ## Example
//! ```no_run
//! use burrowdb::{Db, Options, PERSISTENT};
//!
//! # fn main() -> burrowdb::Result<()> {
//! let db = Db::open(Options::new("./data"))?;
//! db.update(|tx| tx.put("fruit", b"apple", b"red", PERSISTENT))?;
//! let value = db.view(|tx| tx.get("fruit", b"apple"))?;
//! assert_eq!(value, b"red");
//! db.close()?;
//! # Ok(())
//! # }
//! ```

mod db;
mod error;
mod indexes;
mod merge;
mod options;
mod recovery;
mod tx;

pub use db::Db;
pub use error::{Error, Result};
pub use logfile::{IoMode, PERSISTENT};
pub use options::{EntryIdxMode, Options, SCAN_NO_LIMIT};
pub use tx::Tx;

/// Current version of BurrowDB.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

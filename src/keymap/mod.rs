//! A bounded, evicting, persistable map from keys to block lists.
//!
//! [KeyMap] tracks which blocks of a [crate::disk::Disk] back each key. The
//! map is access-ordered: lookups and inserts touch, and when the configured
//! [Bound] is exceeded the least recently used entries are evicted, their
//! blocks handed to a caller-supplied callback so the block file can reuse
//! them. The callback is injected per call, so the map has no dependency on
//! whoever owns the blocks.
//!
//! # Key file
//!
//! The map is persisted as descriptors written back-to-back with no outer
//! header; end of valid data is end-of-stream:
//!
//! ```text
//! +----------------+------------------+---------------------+---------------+
//! | key (K::SIZE)  | count (varint)   | block (varint) ...  | CRC32 (u32 BE)|
//! +----------------+------------------+---------------------+---------------+
//! ```
//!
//! The CRC covers the descriptor bytes before it. A malformed or
//! checksum-failing trailing descriptor is tolerated on load: reading stops
//! and everything before it is kept. Descriptors are ordered least recently
//! used first, so a reload reproduces the recency order of the previous run.

mod storage;
pub use storage::KeyMap;

use std::num::{NonZeroU64, NonZeroUsize};
use thiserror::Error;

/// Errors that can occur when interacting with [KeyMap].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("key file too large: {0}")]
    BlobTooLarge(u64),
}

/// Limit applied to the entries tracked by a [KeyMap].
#[derive(Clone, Copy, Debug)]
pub enum Bound {
    /// Maximum number of keys. The least recently used key is evicted when
    /// an insert pushes the map past the limit.
    Entries(NonZeroUsize),

    /// Maximum bytes of block storage referenced by tracked keys (block
    /// count times block size, summed over all entries). Least recently used
    /// keys are evicted while the total exceeds the limit, except the last
    /// remaining entry, which is never evicted.
    Bytes(NonZeroU64),
}

/// Configuration for [KeyMap] storage.
#[derive(Clone)]
pub struct Config {
    /// The [commonware_runtime::Storage] partition to use for the key blob.
    pub partition: String,

    /// Limit on tracked entries.
    pub bound: Bound,

    /// Size of a block in bytes, used to weigh entries against
    /// [Bound::Bytes].
    pub block_size: std::num::NonZeroU32,
}

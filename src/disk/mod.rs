//! A block-addressed data file with recycled allocation.
//!
//! [Disk] divides a single [commonware_runtime::Blob] into fixed-size blocks
//! and maps byte sequences onto lists of block numbers. A value larger than
//! one block's payload capacity spans multiple blocks (not necessarily
//! adjacent ones); each occupied block independently records the length of
//! its own chunk. Freed blocks are recycled before the blob is grown, so a
//! churning cache converges on a stable file size instead of growing without
//! bound. The file is never compacted: freeing only returns block numbers to
//! the allocator.
//!
//! # Format
//!
//! Each occupied block holds a 4-byte big-endian chunk length followed by the
//! chunk itself; the remainder of the block is undefined:
//!
//! ```text
//! +---+---+---+---+---+---+-------+---+------------------+
//! | 0 | 1 | 2 | 3 | 4 |  ...  | 4+n-1 |   ...padding...  |
//! +---+---+---+---+---+---+-------+---+------------------+
//! |  n (u32 BE)   |    chunk (n bytes)|    (undefined)   |
//! +---------------+-------------------+------------------+
//! ```
//!
//! The blob length is always a multiple of the block size after a write, and
//! the byte offset of block `b` is `b * block_size` (computed in 64-bit
//! arithmetic so files may exceed 2^31 bytes).
//!
//! # Corruption
//!
//! A block whose offset or declared chunk length extends past the end of the
//! blob is reported as corrupt. Because a bad length header means the block
//! boundaries of *other* values may also be unreliable, callers treat this as
//! distrust of the whole file rather than of one value (see
//! [crate::region]).

mod storage;
pub use storage::Disk;

use std::num::NonZeroU32;
use thiserror::Error;

/// Default size of a block in bytes.
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024;

/// Errors that can occur when interacting with [Disk].
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("block {0} starts past the end of the file")]
    BlockOutOfRange(u64),
    #[error("block {block} declares a {declared} byte chunk past the end of the file")]
    ChunkOutOfRange { block: u64, declared: u64 },
}

/// Configuration for [Disk] storage.
#[derive(Clone)]
pub struct Config {
    /// The [commonware_runtime::Storage] partition to use for the data blob.
    pub partition: String,

    /// Size of each block in bytes. Must exceed the 4-byte chunk header.
    pub block_size: NonZeroU32,
}

//! An explicit registry of named cache regions.
//!
//! [Registry] owns one [crate::region::Region] per name with an explicit
//! lifecycle: regions are opened on demand, shared as `Arc`s, and disposed
//! individually or all at once at shutdown. There is no process-wide state.
//!
//! The registry also owns the only background activity in the crate: an
//! optional per-region task that persists the key index at a fixed interval,
//! cancelled when the region is disposed. Disposal itself is bounded by a
//! timeout so a slow region cannot hang process shutdown.

mod storage;
pub use storage::Registry;

use crate::keymap::Bound;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when interacting with [Registry].
#[derive(Debug, Error)]
pub enum Error {
    #[error("region error: {0}")]
    Region(#[from] crate::region::Error),
}

/// Configuration for [Registry] storage.
#[derive(Clone)]
pub struct Config<C> {
    /// Prefix for the partition names of all regions opened by this
    /// registry. Region names are appended after an underscore, with bytes
    /// the runtime rejects replaced by underscores.
    pub partition_prefix: String,

    /// Size of each block in every region's data file.
    pub block_size: NonZeroU32,

    /// Limit applied to every region's key index.
    pub bound: Bound,

    /// The [commonware_codec::Codec] configuration used to decode cached
    /// values.
    pub codec_config: C,

    /// Optional zstd compression level applied to values before storage.
    pub compression: Option<u8>,

    /// How often each region's key index is persisted in the background.
    /// `None` disables periodic persistence (the index is still persisted on
    /// dispose).
    pub persist_interval: Option<Duration>,

    /// How long to wait for a region to dispose before proceeding without
    /// it.
    pub dispose_timeout: Duration,
}

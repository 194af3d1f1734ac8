//! A disk-backed cache region coordinating a block file and a key index.
//!
//! [Region] ties the [crate::disk] block file and the [crate::keymap] key
//! index together under a single readers-writer lock. The lock spans both
//! components deliberately: a put must atomically write new blocks, update
//! the index (possibly evicting other keys and freeing their blocks), and
//! free the replaced blocks, while a get must observe a consistent
//! key-to-blocks mapping. Lookups, reads, and snapshots share the read side;
//! puts, removals, resets, and key persistence take the write side.
//!
//! # Lifecycle
//!
//! A region becomes alive only after its startup integrity check: the blocks
//! of the first up to 100 loaded index entries are read back, and any failure
//! resets both stores rather than leaving a half-trustworthy cache online.
//! Once [Region::dispose] has run (or a reset has failed), the region is dead
//! and every public operation is a no-op.
//!
//! # Failure policy
//!
//! The region is a best-effort cache, never a durability guarantee. A failed
//! read is a miss and a failed write is dropped; neither raises to the
//! application. Corruption — a block read that fails validation or a value
//! that no longer decodes — is treated as distrust of the whole region and
//! answered with an automatic reset, because one bad length header means
//! every other entry's block boundaries may be unreliable too.
//!
//! # Example
//!
//! ```rust
//! use blockdisk::keymap::Bound;
//! use blockdisk::region::{Config, KeyPattern, Region};
//! use commonware_runtime::{deterministic, Runner};
//! use commonware_utils::{array::FixedBytes, NZUsize};
//! use std::num::NonZeroU32;
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let region = Region::<_, FixedBytes<8>, u64>::init(
//!         context,
//!         Config {
//!             partition: "tiles".into(),
//!             block_size: NonZeroU32::new(4096).unwrap(),
//!             bound: Bound::Entries(NZUsize!(100)),
//!             codec_config: (),
//!             compression: None,
//!         },
//!     )
//!     .await
//!     .unwrap();
//!
//!     let key = FixedBytes::new(*b"tile_001");
//!     region.put(key.clone(), 1234).await;
//!     assert_eq!(region.get(&key).await, Some(1234));
//!     region.dispose().await.unwrap();
//! });
//! ```

mod storage;
pub use storage::Region;

pub use crate::keymap::Bound;
use commonware_utils::Array;
use std::num::NonZeroU32;
use thiserror::Error;

/// Errors that can occur when interacting with [Region].
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk error: {0}")]
    Disk(#[from] crate::disk::Error),
    #[error("keymap error: {0}")]
    KeyMap(#[from] crate::keymap::Error),
}

/// Configuration for [Region] storage.
#[derive(Clone)]
pub struct Config<C> {
    /// The [commonware_runtime::Storage] partition holding the region's
    /// `data` and `keys` blobs.
    pub partition: String,

    /// Size of each block in the data file.
    pub block_size: NonZeroU32,

    /// Limit on the in-memory key index.
    pub bound: Bound,

    /// The [commonware_codec::Codec] configuration used to decode cached
    /// values.
    pub codec_config: C,

    /// If set, values are zstd-compressed at this level before being split
    /// into blocks. Must stay consistent across restarts of the same region:
    /// values written with compression do not decode without it (and trigger
    /// a reset).
    pub compression: Option<u8>,
}

/// Selector deciding which keys a removal applies to.
///
/// Key naming conventions are owned by the caller; the region only
/// recognizes their structure. `Prefix` matches on raw key bytes. `Group`
/// matches keys that carry the group tag in their first 8 bytes
/// (big-endian).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPattern<K: Array> {
    /// Remove exactly this key.
    Exact(K),
    /// Remove every key whose bytes start with this prefix.
    Prefix(Vec<u8>),
    /// Remove every key tagged with this group.
    Group(u64),
}

impl<K: Array> KeyPattern<K> {
    /// Whether `key` matches this pattern.
    pub fn matches(&self, key: &K) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => key.as_ref().starts_with(prefix),
            Self::Group(group) => key.as_ref().starts_with(&group.to_be_bytes()),
        }
    }
}

/// Point-in-time snapshot of a region's reporting counters.
#[derive(Clone, Debug)]
pub struct Stats {
    /// Whether the region is alive.
    pub alive: bool,
    /// Number of keys tracked.
    pub keys: usize,
    /// Length of the data file in bytes.
    pub data_len: u64,
    /// Configured block size in bytes.
    pub block_size: u32,
    /// Number of blocks ever allocated.
    pub blocks: u64,
    /// Number of blocks available for reuse.
    pub free_blocks: usize,
    /// Average size of a written value in bytes.
    pub average_put_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::RangeCfg;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Blob, Runner, Storage};
    use commonware_utils::{array::FixedBytes, NZUsize};

    type TestKey = FixedBytes<8>;
    type ByteRegion<E> = Region<E, TestKey, Vec<u8>>;

    fn key(name: &[u8; 8]) -> TestKey {
        TestKey::new(*name)
    }

    fn byte_cfg(block_size: u32) -> Config<(RangeCfg<usize>, ())> {
        Config {
            partition: "test_region".into(),
            block_size: NonZeroU32::new(block_size).unwrap(),
            bound: Bound::Entries(NZUsize!(64)),
            codec_config: (RangeCfg::new(..), ()),
            compression: None,
        }
    }

    #[test_traced]
    fn test_put_get_remove() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                partition: "test_region".into(),
                block_size: NonZeroU32::new(4096).unwrap(),
                bound: Bound::Entries(NZUsize!(64)),
                codec_config: (),
                compression: None,
            };
            let region = Region::<_, TestKey, u64>::init(context.clone(), cfg)
                .await
                .expect("failed to initialize region");

            // Miss before put
            assert_eq!(region.get(&key(b"key_aaaa")).await, None);

            // Put and get
            assert!(region.put(key(b"key_aaaa"), 17).await);
            assert_eq!(region.get(&key(b"key_aaaa")).await, Some(17));
            assert_eq!(region.len().await, 1);

            // Replace in place
            assert!(region.put(key(b"key_aaaa"), 18).await);
            assert_eq!(region.get(&key(b"key_aaaa")).await, Some(18));
            assert_eq!(region.len().await, 1);

            // Remove
            assert!(region.remove(KeyPattern::Exact(key(b"key_aaaa"))).await);
            assert_eq!(region.get(&key(b"key_aaaa")).await, None);
            assert!(!region.remove(KeyPattern::Exact(key(b"key_aaaa"))).await);

            // Check metrics
            let buffer = context.encode();
            assert!(buffer.contains("puts_total 2"));
            assert!(buffer.contains("removes_total 2"));
        });
    }

    #[test_traced]
    fn test_block_accounting_end_to_end() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            // 64 byte blocks leave 60 bytes of payload per block
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");

            // A 45 byte value (46 encoded) occupies one block
            let small = vec![7u8; 45];
            assert!(region.put(key(b"key_aaaa"), small.clone()).await);
            let stats = region.stats().await;
            assert_eq!(stats.blocks, 1);
            assert_eq!(stats.data_len, 64);

            // A 130 byte value (132 encoded) spans three blocks
            assert!(region.put(key(b"key_bbbb"), vec![8u8; 130]).await);
            let stats = region.stats().await;
            assert_eq!(stats.blocks, 4);
            assert_eq!(stats.data_len, 256);

            // The first value reads back intact
            assert_eq!(region.get(&key(b"key_aaaa")).await, Some(small));

            // Removing it frees its block for the next single-block value
            assert!(region.remove(KeyPattern::Exact(key(b"key_aaaa"))).await);
            assert_eq!(region.stats().await.free_blocks, 1);
            assert!(region.put(key(b"key_cccc"), vec![9u8; 45]).await);
            let stats = region.stats().await;
            assert_eq!(stats.blocks, 4);
            assert_eq!(stats.data_len, 256);
            assert_eq!(stats.free_blocks, 0);

            // Reset empties everything
            region.reset().await;
            assert_eq!(region.len().await, 0);
            let stats = region.stats().await;
            assert_eq!(stats.data_len, 0);
            assert_eq!(stats.blocks, 0);
        });
    }

    #[test_traced]
    fn test_corrupt_read_resets_region() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");
            assert!(region.put(key(b"key_aaaa"), vec![1u8; 45]).await);

            // Declare a chunk far past the end of the file
            let (blob, _) = context.open("test_region", b"data").await.unwrap();
            blob.write_at(10_000u32.to_be_bytes().to_vec(), 0)
                .await
                .unwrap();
            blob.sync().await.unwrap();

            // The get misses and the whole region was reset
            assert_eq!(region.get(&key(b"key_aaaa")).await, None);
            assert_eq!(region.len().await, 0);
            let stats = region.stats().await;
            assert!(stats.alive);
            assert_eq!(stats.data_len, 0);

            // The region keeps working after recovery
            assert!(region.put(key(b"key_bbbb"), vec![2u8; 10]).await);
            assert_eq!(region.get(&key(b"key_bbbb")).await, Some(vec![2u8; 10]));

            // Check metrics
            let buffer = context.encode();
            assert!(buffer.contains("resets_total 1"));
        });
    }

    #[test_traced]
    fn test_startup_integrity_check_resets() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");
            assert!(region.put(key(b"key_aaaa"), vec![1u8; 45]).await);
            region.dispose().await.unwrap();

            // Truncate the data file behind the key index's back
            let (blob, _) = context.open("test_region", b"data").await.unwrap();
            blob.resize(0).await.unwrap();
            blob.sync().await.unwrap();

            // The reopened region detects the mismatch and starts empty
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to reinitialize region");
            assert!(region.alive().await);
            assert_eq!(region.len().await, 0);
        });
    }

    #[test_traced]
    fn test_restart_preserves_entries() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");
            assert!(region.put(key(b"key_aaaa"), vec![1u8; 45]).await);
            assert!(region.put(key(b"key_bbbb"), vec![2u8; 130]).await);
            region.dispose().await.unwrap();

            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to reinitialize region");
            assert_eq!(region.len().await, 2);
            assert_eq!(region.get(&key(b"key_aaaa")).await, Some(vec![1u8; 45]));
            assert_eq!(region.get(&key(b"key_bbbb")).await, Some(vec![2u8; 130]));
        });
    }

    #[test_traced]
    fn test_empty_index_truncates_orphaned_data() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");
            assert!(region.put(key(b"key_aaaa"), vec![1u8; 45]).await);
            assert!(region.remove(KeyPattern::Exact(key(b"key_aaaa"))).await);
            assert!(region.stats().await.data_len > 0);
            region.dispose().await.unwrap();

            // Reopening with no keys reclaims the orphaned file content
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to reinitialize region");
            assert_eq!(region.stats().await.data_len, 0);
        });
    }

    #[test_traced]
    fn test_eviction_frees_blocks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                bound: Bound::Entries(NZUsize!(2)),
                ..byte_cfg(64)
            };
            let region = ByteRegion::init(context.clone(), cfg)
                .await
                .expect("failed to initialize region");

            assert!(region.put(key(b"key_aaaa"), vec![1u8; 45]).await);
            assert!(region.put(key(b"key_bbbb"), vec![2u8; 45]).await);
            assert!(region.put(key(b"key_cccc"), vec![3u8; 45]).await);

            // The least recently used key was evicted and its block freed
            assert_eq!(region.len().await, 2);
            assert_eq!(region.get(&key(b"key_aaaa")).await, None);
            assert_eq!(region.stats().await.free_blocks, 1);

            // The freed block backs the next put without growing the file
            let len = region.stats().await.data_len;
            assert!(region.put(key(b"key_dddd"), vec![4u8; 45]).await);
            let stats = region.stats().await;
            assert_eq!(stats.data_len, len);
            assert_eq!(stats.free_blocks, 1); // key_bbbb's block, evicted above
        });
    }

    #[test_traced]
    fn test_prefix_removal() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");
            assert!(region.put(key(b"grp1_aaa"), vec![1]).await);
            assert!(region.put(key(b"grp1_bbb"), vec![2]).await);
            assert!(region.put(key(b"grp2_ccc"), vec![3]).await);

            // Remove one naming hierarchy
            assert!(region.remove(KeyPattern::Prefix(b"grp1".to_vec())).await);
            assert_eq!(region.len().await, 1);
            assert_eq!(region.get(&key(b"grp1_aaa")).await, None);
            assert_eq!(region.get(&key(b"grp2_ccc")).await, Some(vec![3]));

            // A pattern matching nothing reports false
            assert!(!region.remove(KeyPattern::Prefix(b"grp1".to_vec())).await);

            // Both removed values' blocks are reusable
            assert_eq!(region.stats().await.free_blocks, 2);
        });
    }

    #[test_traced]
    fn test_group_removal() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                partition: "test_region".into(),
                block_size: NonZeroU32::new(64).unwrap(),
                bound: Bound::Entries(NZUsize!(64)),
                codec_config: (RangeCfg::new(..), ()),
                compression: None,
            };
            let region = Region::<_, FixedBytes<16>, Vec<u8>>::init(context.clone(), cfg)
                .await
                .expect("failed to initialize region");

            // Keys carry their group tag in the first 8 bytes
            let tagged = |group: u64, name: &[u8; 8]| {
                let mut bytes = [0u8; 16];
                bytes[..8].copy_from_slice(&group.to_be_bytes());
                bytes[8..].copy_from_slice(name);
                FixedBytes::<16>::new(bytes)
            };
            assert!(region.put(tagged(7, b"key_aaaa"), vec![1]).await);
            assert!(region.put(tagged(7, b"key_bbbb"), vec![2]).await);
            assert!(region.put(tagged(9, b"key_cccc"), vec![3]).await);

            assert!(region.remove(KeyPattern::Group(7)).await);
            assert_eq!(region.len().await, 1);
            assert_eq!(region.get(&tagged(9, b"key_cccc")).await, Some(vec![3]));
            assert!(!region.remove(KeyPattern::Group(7)).await);
        });
    }

    #[test_traced]
    fn test_get_matching() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");
            assert!(region.put(key(b"grp1_aaa"), vec![1]).await);
            assert!(region.put(key(b"grp1_bbb"), vec![2]).await);
            assert!(region.put(key(b"grp2_ccc"), vec![3]).await);

            let mut matched = region
                .get_matching(&KeyPattern::Prefix(b"grp1".to_vec()))
                .await;
            matched.sort_by(|(a, _), (b, _)| a.cmp(b));
            assert_eq!(
                matched,
                vec![
                    (key(b"grp1_aaa"), vec![1]),
                    (key(b"grp1_bbb"), vec![2]),
                ]
            );
        });
    }

    #[test_traced]
    fn test_compression_roundtrip() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let cfg = Config {
                compression: Some(3),
                ..byte_cfg(64)
            };
            let region = ByteRegion::init(context.clone(), cfg)
                .await
                .expect("failed to initialize region");

            // A highly compressible value far larger than a block
            let value = vec![0u8; 1_000];
            assert!(region.put(key(b"key_aaaa"), value.clone()).await);
            assert_eq!(region.get(&key(b"key_aaaa")).await, Some(value));

            // It compressed to far fewer than the 17 blocks raw bytes need
            assert!(region.stats().await.blocks < 5);
        });
    }

    #[test_traced]
    fn test_dispose_is_idempotent_and_final() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");
            assert!(region.put(key(b"key_aaaa"), vec![1u8; 10]).await);

            region.dispose().await.expect("failed to dispose");
            region.dispose().await.expect("dispose is idempotent");

            // A dead region refuses everything
            assert!(!region.alive().await);
            assert!(!region.put(key(b"key_bbbb"), vec![2u8; 10]).await);
            assert_eq!(region.get(&key(b"key_aaaa")).await, None);
            assert!(!region.remove(KeyPattern::Exact(key(b"key_aaaa"))).await);
            assert!(region.keys().await.is_empty());
            assert_eq!(region.len().await, 0);
            assert!(!region.stats().await.alive);
        });
    }

    #[test_traced]
    fn test_persist_survives_unclean_shutdown() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            {
                let region = ByteRegion::init(context.clone(), byte_cfg(64))
                    .await
                    .expect("failed to initialize region");
                assert!(region.put(key(b"key_aaaa"), vec![5u8; 45]).await);
                region.persist().await.expect("failed to persist");
                // Dropped without dispose
            }

            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to reinitialize region");
            assert_eq!(region.get(&key(b"key_aaaa")).await, Some(vec![5u8; 45]));
        });
    }

    #[test_traced]
    fn test_live_keys_never_share_blocks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let region = ByteRegion::init(context.clone(), byte_cfg(64))
                .await
                .expect("failed to initialize region");

            // Churn puts and removes, then audit the final mapping
            for round in 0u8..4 {
                for i in 0u8..8 {
                    let name = [b'k', b'e', b'y', b'_', round, i, i, i];
                    assert!(region.put(key(&name), vec![i; (i as usize + 1) * 30]).await);
                }
                let victim = [b'k', b'e', b'y', b'_', round, 3, 3, 3];
                assert!(region.remove(KeyPattern::Exact(key(&victim))).await);
            }

            // Every value still reads back, which the disk could not
            // guarantee if two keys shared a block
            for key in region.keys().await {
                assert!(region.get(&key).await.is_some());
            }
        });
    }
}

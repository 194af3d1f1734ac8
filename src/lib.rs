//! Block-addressed disk cache with recycled allocation and a bounded,
//! persistable key index.
//!
//! A [region::Region] persists serialized values to a single data blob divided
//! into fixed-size blocks and tracks the blocks backing each key in an
//! in-memory index. Freed blocks are recycled before the blob is grown, the
//! index is bounded by key count or by referenced bytes (evicting
//! least-recently-used keys and freeing their blocks), and the index is
//! persisted to a side blob so the cache survives restarts. Detected
//! corruption never takes down the caller: a region that cannot trust its
//! data file resets itself and continues empty.
//!
//! Each region is guarded by a single readers-writer lock spanning both the
//! block file and the key index, so a write atomically frees old blocks,
//! allocates new ones, and updates the index. Regions are best-effort caches:
//! a failed read is a miss and a failed write is dropped, never an error
//! surfaced to the application.
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
//!     // Open a region
//!     let cfg = Config {
//!         partition: "demo".into(),
//!         block_size: NonZeroU32::new(4096).unwrap(),
//!         bound: Bound::Entries(NZUsize!(1024)),
//!         codec_config: (),
//!         compression: None,
//!     };
//!     let region = Region::<_, FixedBytes<8>, i32>::init(context, cfg)
//!         .await
//!         .unwrap();
//!
//!     // Store and retrieve a value
//!     let key = FixedBytes::new(*b"article1");
//!     assert!(region.put(key.clone(), 42).await);
//!     assert_eq!(region.get(&key).await, Some(42));
//!
//!     // Remove it again
//!     assert!(region.remove(KeyPattern::Exact(key)).await);
//!
//!     // Close the region (persists the key index)
//!     region.dispose().await.unwrap();
//! });
//! ```

pub mod disk;
pub mod keymap;
pub mod region;
pub mod registry;

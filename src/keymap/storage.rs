use super::{Bound, Config, Error};
use bytes::{Buf, BufMut};
use commonware_codec::{
    util::at_least, varint::UInt, Error as CodecError, FixedSize, ReadExt, Write as CodecWrite,
};
use commonware_runtime::{Blob, Metrics, Storage};
use commonware_utils::Array;
use lru::LruCache;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Name of the blob holding the key file within the configured partition.
const BLOB_NAME: &[u8] = b"keys";

/// Implementation of the key index.
pub struct KeyMap<E: Storage + Metrics, K: Array> {
    context: E,
    cfg: Config,

    blob: E::Blob,

    // Access-ordered so the least recently touched key is always at the tail.
    // `get` and `put` touch; `peek` and iteration do not.
    entries: LruCache<K, Vec<u64>>,

    // Bytes of block storage referenced by tracked keys
    // (blocks * block_size, summed over all entries).
    usage: u64,

    keys: Gauge,
    indexed_bytes: Gauge,
    evictions: Counter,
    persists: Counter,
}

impl<E: Storage + Metrics, K: Array> KeyMap<E, K> {
    /// Initialize a new `KeyMap` instance, loading any previously persisted
    /// entries from the `keys` blob in the configured partition.
    ///
    /// Loading is best-effort: a malformed or checksum-failing descriptor
    /// stops the load and everything before it is kept. If two loaded keys
    /// reference the same block the whole file is untrustworthy and the index
    /// starts empty.
    ///
    /// The configured bound is not applied here: the caller applies it with
    /// [KeyMap::enforce] once it can receive freed blocks.
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        // Open the backing blob
        let (blob, len) = context.open(&cfg.partition, BLOB_NAME).await?;

        // Initialize metrics
        let keys = Gauge::default();
        let indexed_bytes = Gauge::default();
        let evictions = Counter::default();
        let persists = Counter::default();
        context.register("keys", "Number of keys tracked", keys.clone());
        context.register(
            "indexed_bytes",
            "Bytes of block storage referenced by tracked keys",
            indexed_bytes.clone(),
        );
        context.register("evictions", "Number of keys evicted", evictions.clone());
        context.register("persists", "Number of key file writes", persists.clone());

        let mut map = Self {
            context,
            cfg,
            blob,
            entries: LruCache::unbounded(),
            usage: 0,
            keys,
            indexed_bytes,
            evictions,
            persists,
        };
        map.load(len).await?;
        Ok(map)
    }

    /// Load persisted descriptors until end-of-stream or the first malformed
    /// one.
    async fn load(&mut self, len: u64) -> Result<(), Error> {
        if len == 0 {
            debug!("no key file found");
            return Ok(());
        }
        let len = usize::try_from(len).map_err(|_| Error::BlobTooLarge(len))?;
        let data = self.blob.read_at(vec![0u8; len], 0).await?;
        let data = data.as_ref();

        // Descriptors were persisted least-recently-used first, so inserting
        // in stream order reproduces the recency order of the previous run.
        let mut remaining = data;
        let mut loaded = 0;
        while !remaining.is_empty() {
            match Self::read_entry(&mut remaining) {
                Ok((key, blocks)) => {
                    let weight = self.weight(&blocks);
                    if let Some(replaced) = self.entries.put(key, blocks) {
                        self.usage -= self.weight(&replaced);
                    }
                    self.usage += weight;
                    loaded += 1;
                }
                Err(err) => {
                    warn!(loaded, ?err, "key file truncated; discarding tail");
                    break;
                }
            }
        }

        // A block referenced by two keys means the file (or the cache that
        // wrote it) was inconsistent; keep none of it.
        let mut referenced = HashSet::new();
        let duplicated = self
            .entries
            .iter()
            .flat_map(|(_, blocks)| blocks)
            .any(|block| !referenced.insert(*block));
        if duplicated {
            warn!("key file references a block twice; discarding all entries");
            self.entries.clear();
            self.usage = 0;
            self.persist().await?;
        }

        self.update_gauges();
        debug!(keys = self.entries.len(), "loaded key file");
        Ok(())
    }

    /// Weight of an entry against a [Bound::Bytes] limit.
    fn weight(&self, blocks: &[u64]) -> u64 {
        blocks.len() as u64 * self.cfg.block_size.get() as u64
    }

    fn update_gauges(&self) {
        self.keys.set(self.entries.len() as i64);
        self.indexed_bytes.set(self.usage as i64);
    }

    /// Look up the blocks for `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&Vec<u64>> {
        self.entries.get(key)
    }

    /// Look up the blocks for `key` without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&Vec<u64>> {
        self.entries.peek(key)
    }

    /// Mark `key` most recently used (no-op if absent).
    pub fn touch(&mut self, key: &K) {
        self.entries.promote(key);
    }

    /// Insert or replace the mapping for `key`, marking it most recently
    /// used, and return the replaced blocks (if any) for the caller to free.
    ///
    /// If the configured bound is now exceeded, least-recently-used entries
    /// are evicted and their blocks passed to `free` before they are dropped.
    /// The freshly inserted key is never evicted: under a byte bound the last
    /// remaining entry is exempt, and under an entry bound the most recently
    /// used entry is never the eviction victim.
    pub fn put(
        &mut self,
        key: K,
        blocks: Vec<u64>,
        mut free: impl FnMut(&[u64]),
    ) -> Option<Vec<u64>> {
        trace!(key = %key, blocks = blocks.len(), "indexing key");
        let weight = self.weight(&blocks);
        let replaced = self.entries.put(key, blocks);
        self.usage += weight;
        if let Some(replaced) = &replaced {
            self.usage -= self.weight(replaced);
        }
        self.enforce(&mut free);
        replaced
    }

    /// Evict least-recently-used entries until the configured bound is
    /// satisfied, passing each evicted entry's blocks to `free`.
    pub fn enforce(&mut self, free: &mut impl FnMut(&[u64])) {
        loop {
            let over = match self.cfg.bound {
                Bound::Entries(max) => self.entries.len() > max.get(),
                // Never evict the last remaining entry, even over budget:
                // a single oversized value must stay readable.
                Bound::Bytes(max) => self.usage > max.get() && self.entries.len() > 1,
            };
            if !over {
                break;
            }
            let (key, blocks) = self.entries.pop_lru().expect("bound exceeded while empty");
            free(&blocks);
            self.usage -= self.weight(&blocks);
            self.evictions.inc();
            debug!(key = %key, blocks = blocks.len(), "evicted key");
        }
        self.update_gauges();
    }

    /// Remove the mapping for `key`, returning the blocks it held.
    pub fn remove(&mut self, key: &K) -> Option<Vec<u64>> {
        let blocks = self.entries.pop(key);
        if let Some(blocks) = &blocks {
            self.usage -= self.weight(blocks);
        }
        self.update_gauges();
        blocks
    }

    /// Iterate over all entries, most recently used first. Iteration does not
    /// touch recency.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &Vec<u64>)> {
        self.entries.iter()
    }

    /// Iterate over all keys, most recently used first.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(key, _)| key)
    }

    /// Number of keys tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of block storage referenced by tracked keys.
    pub fn usage(&self) -> u64 {
        self.usage
    }

    /// Rewrite the key file with every current mapping.
    ///
    /// Descriptors are written least-recently-used first so that a reload
    /// reproduces the current recency order. The blob is truncated to the new
    /// length and synced before returning; a crash mid-write leaves at worst
    /// a malformed tail that the next load discards.
    pub async fn persist(&self) -> Result<(), Error> {
        let mut buf = Vec::new();
        for (key, blocks) in self.entries.iter().rev() {
            Self::write_entry(&mut buf, key, blocks);
        }
        let len = buf.len() as u64;
        self.blob.write_at(buf, 0).await?;
        self.blob.resize(len).await?;
        self.blob.sync().await?;
        self.persists.inc();
        debug!(keys = self.entries.len(), bytes = len, "persisted key file");
        Ok(())
    }

    /// Drop every entry without touching disk.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.usage = 0;
        self.update_gauges();
    }

    /// Drop every entry and persist the empty state.
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.clear();
        self.persist().await
    }

    /// Persist all entries and release the blob.
    pub async fn close(self) -> Result<(), Error> {
        self.persist().await
    }

    /// Remove the underlying blob.
    pub async fn destroy(self) -> Result<(), Error> {
        self.context
            .remove(&self.cfg.partition, Some(BLOB_NAME))
            .await
            .map_err(Error::Runtime)
    }

    /// Append one descriptor to `buf`: the key, the block count, the block
    /// numbers (all varint), then a CRC32 of the preceding descriptor bytes.
    fn write_entry(buf: &mut Vec<u8>, key: &K, blocks: &[u64]) {
        let start = buf.len();
        key.write(buf);
        UInt(blocks.len() as u64).write(buf);
        for block in blocks {
            UInt(*block).write(buf);
        }
        let checksum = crc32fast::hash(&buf[start..]);
        buf.put_u32(checksum);
    }

    /// Parse one descriptor from the front of `buf`, advancing it past the
    /// descriptor on success.
    fn read_entry(buf: &mut &[u8]) -> Result<(K, Vec<u64>), CodecError> {
        let start = *buf;
        let key = K::read(buf)?;
        let count: u64 = UInt::read(buf)?.into();
        // Each block number occupies at least one byte
        if count > buf.len() as u64 {
            return Err(CodecError::Invalid("blockdisk::keymap", "block count too large"));
        }
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let block: u64 = UInt::read(buf)?.into();
            blocks.push(block);
        }
        let consumed = start.len() - buf.len();
        at_least(buf, u32::SIZE)?;
        let expected = buf.get_u32();
        let computed = crc32fast::hash(&start[..consumed]);
        if expected != computed {
            return Err(CodecError::Invalid("blockdisk::keymap", "checksum mismatch"));
        }
        Ok((key, blocks))
    }
}

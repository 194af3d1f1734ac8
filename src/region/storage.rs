use super::{Config, Error, KeyPattern, Stats};
use crate::disk::{Config as DiskConfig, Disk};
use crate::keymap::{Config as KeyMapConfig, KeyMap};
use commonware_codec::{Codec, DecodeExt, EncodeSize, Write as CodecWrite};
use commonware_runtime::{Metrics, RwLock, Storage};
use commonware_utils::Array;
use futures::future::try_join_all;
use prometheus_client::metrics::counter::Counter;
use std::marker::PhantomData;
use tracing::{debug, error, trace, warn};
use zstd::bulk::{compress, decompress};

/// Number of index entries probed by the startup integrity check.
const MAX_VERIFY: usize = 100;

/// Upper bound on the size of a decompressed value.
const MAX_DECOMPRESS: usize = u32::MAX as usize;

/// Everything guarded by the region lock: the block file, the key index, and
/// the lifecycle flag.
struct State<E: Storage + Metrics, K: Array> {
    alive: bool,
    disk: Disk<E>,
    keymap: KeyMap<E, K>,
}

impl<E: Storage + Metrics, K: Array> State<E, K> {
    /// Clear the key index (persisting the empty state) and truncate the
    /// block file.
    async fn reset(&mut self) -> Result<(), Error> {
        self.keymap.reset().await?;
        self.disk.reset().await?;
        Ok(())
    }

    /// Probe the blocks of the first up to [MAX_VERIFY] index entries. Any
    /// failed or empty read means the block file cannot be trusted.
    async fn verify(&self) -> bool {
        let targets: Vec<_> = self
            .keymap
            .iter()
            .take(MAX_VERIFY)
            .map(|(_, blocks)| blocks)
            .collect();
        let reads = targets.iter().map(|blocks| self.disk.read(blocks.as_slice()));
        match try_join_all(reads).await {
            Ok(values) => {
                if values.iter().any(|value| value.is_empty()) {
                    warn!("integrity check read an empty value");
                    return false;
                }
                true
            }
            Err(err) => {
                warn!(?err, "integrity check failed");
                false
            }
        }
    }
}

/// Implementation of `Region` storage.
pub struct Region<E: Storage + Metrics, K: Array, V: Codec> {
    state: RwLock<State<E, K>>,
    codec_config: V::Cfg,
    compression: Option<u8>,

    gets: Counter,
    puts: Counter,
    removes: Counter,
    resets: Counter,

    _value: PhantomData<V>,
}

impl<E: Storage + Metrics, K: Array, V: Codec> Region<E, K, V> {
    /// Initialize a new `Region` instance.
    ///
    /// The key index is loaded from its blob (best-effort) and the configured
    /// bound applied. If the loaded index is empty, the region is reset to
    /// reclaim any orphaned data file content; otherwise the startup
    /// integrity check reads the blocks of the first up to 100 entries and
    /// resets the region if any read fails. Only after that is the region
    /// alive.
    ///
    /// If either blob cannot be opened the error is surfaced and no region
    /// exists.
    pub async fn init(context: E, cfg: Config<V::Cfg>) -> Result<Self, Error> {
        // Open both stores
        let disk = Disk::init(
            context.with_label("disk"),
            DiskConfig {
                partition: cfg.partition.clone(),
                block_size: cfg.block_size,
            },
        )
        .await?;
        let keymap = KeyMap::init(
            context.with_label("keymap"),
            KeyMapConfig {
                partition: cfg.partition.clone(),
                bound: cfg.bound,
                block_size: cfg.block_size,
            },
        )
        .await?;
        let mut state = State {
            alive: false,
            disk,
            keymap,
        };

        // Apply the bound to whatever was loaded, returning evicted blocks
        // to the allocator
        {
            let State { disk, keymap, .. } = &mut state;
            keymap.enforce(&mut |blocks| disk.free(blocks));
        }

        // An empty index means any data file content is orphaned; a failed
        // probe means the block file cannot be trusted. Either way, start
        // over before going alive.
        if state.keymap.is_empty() {
            state.reset().await?;
        } else if !state.verify().await {
            warn!("integrity check failed; resetting region");
            state.reset().await?;
        }
        state.alive = true;

        // Initialize metrics
        let gets = Counter::default();
        let puts = Counter::default();
        let removes = Counter::default();
        let resets = Counter::default();
        context.register("gets", "Number of gets performed", gets.clone());
        context.register("puts", "Number of puts performed", puts.clone());
        context.register("removes", "Number of removes performed", removes.clone());
        context.register("resets", "Number of region resets", resets.clone());

        debug!(keys = state.keymap.len(), "region alive");
        Ok(Self {
            state: RwLock::new(state),
            codec_config: cfg.codec_config,
            compression: cfg.compression,
            gets,
            puts,
            removes,
            resets,
            _value: PhantomData,
        })
    }

    /// Retrieve the value stored for `key`, or `None` if the key is absent,
    /// the region is not alive, or the stored bytes cannot be read.
    ///
    /// A read or decode failure is treated as region-wide corruption: the
    /// region resets itself (dropping every key) and the get reports a miss.
    pub async fn get(&self, key: &K) -> Option<V> {
        // Read the raw value under the read lock
        let state = self.state.read().await;
        if !state.alive {
            debug!(key = %key, "not alive; ignoring get");
            return None;
        }
        self.gets.inc();
        let blocks = state.keymap.peek(key)?.clone();
        let result = state.disk.read(&blocks).await;
        drop(state);

        let data = match result {
            Ok(data) => data,
            Err(err) => {
                warn!(key = %key, ?err, "failed to read value; resetting region");
                self.force_reset().await;
                return None;
            }
        };
        let data = if self.compression.is_some() {
            match decompress(&data, MAX_DECOMPRESS) {
                Ok(data) => data,
                Err(_) => {
                    warn!(key = %key, "failed to decompress value; resetting region");
                    self.force_reset().await;
                    return None;
                }
            }
        } else {
            data
        };
        match V::decode_cfg(data.as_slice(), &self.codec_config) {
            Ok(value) => {
                // A hit counts as a touch
                self.state.write().await.keymap.touch(key);
                Some(value)
            }
            Err(err) => {
                warn!(key = %key, ?err, "failed to decode value; resetting region");
                self.force_reset().await;
                None
            }
        }
    }

    /// Retrieve every key matching `pattern` along with its value.
    ///
    /// Matching keys are snapshotted under the read lock and then fetched
    /// one by one; keys that disappear (or fail to read) in between are
    /// simply absent from the result.
    pub async fn get_matching(&self, pattern: &KeyPattern<K>) -> Vec<(K, V)> {
        let keys: Vec<K> = {
            let state = self.state.read().await;
            if !state.alive {
                return Vec::new();
            }
            state
                .keymap
                .keys()
                .filter(|key| pattern.matches(key))
                .cloned()
                .collect()
        };

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await {
                values.push((key, value));
            }
        }
        values
    }

    /// Store `value` for `key`, returning whether it was stored.
    ///
    /// The new blocks are written and indexed before the replaced mapping's
    /// blocks are freed, so an interruption mid-operation leaks the old
    /// blocks rather than corrupting the new entry. An I/O failure aborts
    /// just this put (the region stays alive and the old mapping intact).
    pub async fn put(&self, key: K, value: V) -> bool {
        // Serialize (and optionally compress) before taking the lock
        let mut data = Vec::with_capacity(value.encode_size());
        value.write(&mut data);
        let data = if let Some(level) = self.compression {
            match compress(&data, level as i32) {
                Ok(data) => data,
                Err(err) => {
                    warn!(key = %key, ?err, "failed to compress value");
                    return false;
                }
            }
        } else {
            data
        };

        let mut state = self.state.write().await;
        if !state.alive {
            debug!(key = %key, "not alive; ignoring put");
            return false;
        }
        self.puts.inc();
        let State { disk, keymap, .. } = &mut *state;

        // Write the new value before touching the index so a failure leaves
        // the old mapping intact
        let blocks = match disk.write(&data).await {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!(key = %key, ?err, "failed to write value");
                return false;
            }
        };

        // Index the new blocks (evicting other keys as needed), then free
        // the replaced ones
        let replaced = keymap.put(key, blocks, |evicted| disk.free(evicted));
        if let Some(replaced) = replaced {
            disk.free(&replaced);
        }
        true
    }

    /// Remove every key matching `pattern`, freeing the blocks each held.
    /// Returns whether at least one key was removed.
    pub async fn remove(&self, pattern: KeyPattern<K>) -> bool {
        let mut state = self.state.write().await;
        if !state.alive {
            debug!("not alive; ignoring remove");
            return false;
        }
        self.removes.inc();
        let State { disk, keymap, .. } = &mut *state;
        match pattern {
            KeyPattern::Exact(key) => match keymap.remove(&key) {
                Some(blocks) => {
                    disk.free(&blocks);
                    trace!(key = %key, "removed key");
                    true
                }
                None => false,
            },
            pattern => {
                let matched: Vec<K> = keymap
                    .keys()
                    .filter(|key| pattern.matches(key))
                    .cloned()
                    .collect();
                for key in &matched {
                    if let Some(blocks) = keymap.remove(key) {
                        disk.free(&blocks);
                    }
                }
                debug!(removed = matched.len(), "removed matching keys");
                !matched.is_empty()
            }
        }
    }

    /// Remove every key and truncate the data file.
    ///
    /// This is both the remove-all operation and the recovery action applied
    /// when corruption is detected. If the reset itself fails, the region is
    /// marked dead and every subsequent operation becomes a no-op.
    pub async fn reset(&self) {
        self.force_reset().await;
    }

    async fn force_reset(&self) {
        let mut state = self.state.write().await;
        if !state.alive {
            return;
        }
        warn!("resetting region");
        self.resets.inc();
        if let Err(err) = state.reset().await {
            error!(?err, "failed to reset region; marking dead");
            state.alive = false;
        }
    }

    /// Persist the key index to its blob. Invoked by the owning registry on
    /// a periodic timer and on disposal.
    pub async fn persist(&self) -> Result<(), Error> {
        let state = self.state.write().await;
        if !state.alive {
            return Ok(());
        }
        state.keymap.persist().await.map_err(Error::KeyMap)
    }

    /// Snapshot of all tracked keys (empty if the region is not alive).
    pub async fn keys(&self) -> Vec<K> {
        let state = self.state.read().await;
        if !state.alive {
            return Vec::new();
        }
        state.keymap.keys().cloned().collect()
    }

    /// Number of tracked keys (0 if the region is not alive).
    pub async fn len(&self) -> usize {
        let state = self.state.read().await;
        if !state.alive {
            return 0;
        }
        state.keymap.len()
    }

    /// Whether no keys are tracked.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether the region is alive.
    pub async fn alive(&self) -> bool {
        self.state.read().await.alive
    }

    /// Point-in-time snapshot of the region's reporting counters.
    pub async fn stats(&self) -> Stats {
        let state = self.state.read().await;
        Stats {
            alive: state.alive,
            keys: state.keymap.len(),
            data_len: state.disk.len(),
            block_size: state.disk.block_size(),
            blocks: state.disk.blocks(),
            free_blocks: state.disk.free_blocks(),
            average_put_size: state.disk.average_put_size(),
        }
    }

    /// Shut the region down: persist the key index, sync the block file, and
    /// refuse all further operations. Idempotent.
    pub async fn dispose(&self) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if !state.alive {
            debug!("already disposed");
            return Ok(());
        }
        state.alive = false;
        let persisted = state.keymap.persist().await;
        let synced = state.disk.sync().await;
        debug!("region disposed");
        persisted?;
        synced?;
        Ok(())
    }

    /// Remove both underlying blobs.
    pub async fn destroy(self) -> Result<(), Error> {
        let state = self.state.into_inner();
        state.keymap.destroy().await?;
        state.disk.destroy().await?;
        Ok(())
    }
}

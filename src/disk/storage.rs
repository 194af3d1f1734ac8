use super::{Config, Error};
use bytes::BufMut;
use commonware_runtime::{Blob, Metrics, Storage};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::collections::BTreeSet;
use tracing::{debug, trace, warn};

/// Name of the blob holding the block file within the configured partition.
const BLOB_NAME: &[u8] = b"data";

/// Size of the chunk-length header at the start of each occupied block.
const HEADER_SIZE: usize = 4;

/// Implementation of the block file.
pub struct Disk<E: Storage + Metrics> {
    context: E,
    cfg: Config,

    blob: E::Blob,
    // Invariant: `len` is the current blob length and is a multiple of the
    // block size after any successful write.
    len: u64,

    // The next block number that has never been handed out. Allocation
    // prefers the free set so the blob only grows when no freed block is
    // available.
    next_block: u64,
    free: BTreeSet<u64>,

    writes: Counter,
    reads: Counter,
    bytes_written: Counter,
    blocks: Gauge,
    free_blocks: Gauge,
}

impl<E: Storage + Metrics> Disk<E> {
    /// Initialize a new `Disk` instance over the `data` blob in the configured
    /// partition.
    ///
    /// The next-block counter starts after the last block touched by the
    /// existing blob, so a reopened file is never overwritten by fresh
    /// allocations.
    pub async fn init(context: E, cfg: Config) -> Result<Self, Error> {
        let block_size = cfg.block_size.get() as u64;
        assert!(
            block_size > HEADER_SIZE as u64,
            "block size must exceed the chunk header"
        );

        // Open the backing blob
        let (blob, len) = context.open(&cfg.partition, BLOB_NAME).await?;
        let next_block = len.div_ceil(block_size);
        if len % block_size != 0 {
            warn!(len, block_size, "block file is not block-aligned");
        }

        // Initialize metrics
        let writes = Counter::default();
        let reads = Counter::default();
        let bytes_written = Counter::default();
        let blocks = Gauge::default();
        let free_blocks = Gauge::default();
        context.register("writes", "Number of values written", writes.clone());
        context.register("reads", "Number of values read", reads.clone());
        context.register(
            "bytes_written",
            "Bytes of value data written",
            bytes_written.clone(),
        );
        context.register("blocks", "Number of blocks ever allocated", blocks.clone());
        context.register(
            "free_blocks",
            "Number of blocks available for reuse",
            free_blocks.clone(),
        );
        blocks.set(next_block as i64);

        debug!(blocks = next_block, block_size, "block file opened");
        Ok(Self {
            context,
            cfg,
            blob,
            len,
            next_block,
            free: BTreeSet::new(),
            writes,
            reads,
            bytes_written,
            blocks,
            free_blocks,
        })
    }

    /// Bytes of value data that fit in one block.
    fn capacity(&self) -> usize {
        self.cfg.block_size.get() as usize - HEADER_SIZE
    }

    /// Number of blocks required to store `len` bytes. Zero-length values
    /// still occupy one block.
    fn blocks_needed(&self, len: usize) -> usize {
        let capacity = self.capacity();
        if len <= capacity {
            1
        } else {
            len.div_ceil(capacity)
        }
    }

    /// Take `needed` block numbers, preferring freed blocks over extending
    /// the file.
    fn allocate(&mut self, needed: usize) -> Vec<u64> {
        let mut blocks = Vec::with_capacity(needed);
        for _ in 0..needed {
            let block = match self.free.pop_first() {
                Some(block) => block,
                None => {
                    let block = self.next_block;
                    self.next_block += 1;
                    block
                }
            };
            blocks.push(block);
        }
        self.blocks.set(self.next_block as i64);
        self.free_blocks.set(self.free.len() as i64);
        blocks
    }

    /// Write a value to disk, returning the blocks it was stored in (in chunk
    /// order).
    ///
    /// The value is split into chunks of at most `block_size - 4` bytes, each
    /// prefixed with a big-endian `u32` of its own length. If any write fails,
    /// the allocated blocks are returned to the free set and the error is
    /// surfaced: nothing references a partially written value.
    pub async fn write(&mut self, data: &[u8]) -> Result<Vec<u64>, Error> {
        self.writes.inc();
        self.bytes_written.inc_by(data.len() as u64);

        let needed = self.blocks_needed(data.len());
        let blocks = self.allocate(needed);

        // Grow the blob to a whole number of blocks before writing any chunk
        // so the file length stays a multiple of the block size.
        let block_size = self.cfg.block_size.get() as u64;
        let last = *blocks.iter().max().expect("at least one block");
        let new_len = (last + 1) * block_size;
        if new_len > self.len {
            if let Err(err) = self.blob.resize(new_len).await {
                self.free(&blocks);
                return Err(Error::Runtime(err));
            }
            self.len = new_len;
        }

        // Write each chunk behind its length header
        let capacity = self.capacity();
        let mut offset = 0;
        for &block in &blocks {
            let chunk = std::cmp::min(capacity, data.len() - offset);
            let mut buf = Vec::with_capacity(HEADER_SIZE + chunk);
            buf.put_u32(chunk as u32);
            buf.extend_from_slice(&data[offset..offset + chunk]);
            if let Err(err) = self.blob.write_at(buf, block * block_size).await {
                self.free(&blocks);
                return Err(Error::Runtime(err));
            }
            offset += chunk;
        }
        trace!(blocks = ?blocks, len = data.len(), "wrote value");
        Ok(blocks)
    }

    /// Read the value stored in `blocks`, concatenating chunks in array
    /// order.
    ///
    /// Every block is validated against the current file length (both the
    /// block offset and the declared chunk length) before its chunk is
    /// trusted. A failed validation means the file's block boundaries can no
    /// longer be relied on and the caller is expected to reset the region.
    ///
    /// Whether the blocks all belong to the same logical value is not
    /// re-validated here: that invariant is maintained by the key index.
    pub async fn read(&self, blocks: &[u64]) -> Result<Vec<u8>, Error> {
        self.reads.inc();

        let block_size = self.cfg.block_size.get() as u64;
        let capacity = self.capacity();
        let mut data = Vec::with_capacity(blocks.len() * capacity);
        for &block in blocks {
            // Validate the block is within the file
            let offset = block * block_size;
            if offset + block_size > self.len {
                warn!(block, len = self.len, "block starts past the end of the file");
                return Err(Error::BlockOutOfRange(block));
            }

            // Read the whole block and validate the declared chunk length
            let buf = self
                .blob
                .read_at(vec![0u8; block_size as usize], offset)
                .await?;
            let buf = buf.as_ref();
            let declared =
                u32::from_be_bytes(buf[..HEADER_SIZE].try_into().unwrap()) as u64;
            if declared > capacity as u64 || offset + HEADER_SIZE as u64 + declared > self.len {
                warn!(block, declared, "chunk extends past the end of the file");
                return Err(Error::ChunkOutOfRange { block, declared });
            }
            data.extend_from_slice(&buf[HEADER_SIZE..HEADER_SIZE + declared as usize]);
        }
        Ok(data)
    }

    /// Return `blocks` to the free set.
    ///
    /// Insertion is unconditional: the caller must guarantee the blocks are
    /// no longer referenced by any live key, as a double free would let two
    /// keys share a block.
    pub fn free(&mut self, blocks: &[u64]) {
        for block in blocks {
            self.free.insert(*block);
        }
        self.free_blocks.set(self.free.len() as i64);
        trace!(blocks = ?blocks, "freed blocks");
    }

    /// Truncate the blob to zero length and forget all allocation state.
    pub async fn reset(&mut self) -> Result<(), Error> {
        self.blob.resize(0).await?;
        self.blob.sync().await?;
        self.len = 0;
        self.next_block = 0;
        self.free.clear();
        self.blocks.set(0);
        self.free_blocks.set(0);
        debug!("block file reset");
        Ok(())
    }

    /// Ensure all written data is durably persisted.
    pub async fn sync(&self) -> Result<(), Error> {
        self.blob.sync().await.map_err(Error::Runtime)
    }

    /// Sync and release the blob.
    pub async fn close(self) -> Result<(), Error> {
        self.blob.sync().await.map_err(Error::Runtime)
    }

    /// Remove the underlying blob.
    pub async fn destroy(self) -> Result<(), Error> {
        self.context
            .remove(&self.cfg.partition, Some(BLOB_NAME))
            .await
            .map_err(Error::Runtime)
    }

    /// Current blob length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the blob is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of blocks ever allocated (the next never-used block number).
    pub fn blocks(&self) -> u64 {
        self.next_block
    }

    /// Number of blocks available for reuse.
    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    /// Configured block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.cfg.block_size.get()
    }

    /// Average size of a written value in bytes (0 before the first write).
    pub fn average_put_size(&self) -> u64 {
        let writes = self.writes.get();
        if writes == 0 {
            return 0;
        }
        self.bytes_written.get() / writes
    }
}

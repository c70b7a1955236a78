//! Resolves a reader's `getData(blockId)` against a partition's merged
//! output (spec §4.F).
//!
//! Memory is tried first (a weak retain against the merged-app alias in the
//! buffer manager); on a miss, the file path falls back to a per-partition
//! lazily-reloaded [`ShuffleMeta`] index over the merged-output data file.
//! The reload is serialized through the partition's own index lock so
//! concurrent readers never observe a torn map while the index grows
//! during merging.

use std::io;

use bytes::Bytes;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::block::BlockId;
use crate::index::IndexError;
use crate::partition::{merged_app_id, Partition};
use std::sync::Arc;

#[derive(Debug, Snafu)]
pub enum ReadError {
    #[snafu(display("block {} is missing from both the memory cache and the merged-output index", block_id))]
    MissingBlock { block_id: BlockId },

    #[snafu(display("failed to reload the merged-output shuffle index: {}", source))]
    Storage { source: io::Error },

    #[snafu(display("failed to parse the merged-output shuffle index: {}", source))]
    Index { source: IndexError },

    #[snafu(display("failed to read merged block {} from the data file: {}", block_id, source))]
    Io { block_id: BlockId, source: io::Error },
}

/// Reader-facing lookup over one partition's merged output.
pub struct MergedBlockReader {
    partition: Arc<Partition>,
}

impl MergedBlockReader {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }

    /// Resolves `block_id` to its bytes, trying the memory cache before
    /// falling back to the merged-output file (spec §4.F).
    pub async fn get_data(&self, block_id: BlockId) -> Result<Bytes, ReadError> {
        let merged_app = merged_app_id(self.partition.app_id());
        let shuffle_id = self.partition.shuffle_id();
        let partition_id = self.partition.partition_id();

        if let Some(handle) = self
            .partition
            .buffer_manager()
            .get(&merged_app, shuffle_id, partition_id, block_id)
            .await
        {
            if let Some(payload) = handle.retain() {
                return Ok(payload.bytes.slice(0..payload.data_length as usize));
            }
            // Lost the race against a concurrent flush; fall through to file.
        }

        let mut meta = self.partition.shuffle_meta().lock().await;
        if !meta.contains(block_id) {
            let index = self
                .partition
                .storage_manager()
                .shuffle_index(&merged_app, shuffle_id, partition_id)
                .await
                .context(StorageSnafu)?;
            meta.reload(&index.index_bytes).context(IndexSnafu)?;
        }

        let entry = meta.get(block_id).context(MissingBlockSnafu { block_id })?;
        drop(meta);

        let data_file = self.partition.storage_manager().data_file_path(&merged_app, shuffle_id, partition_id);
        read_slice(&data_file, entry.offset, entry.length as usize, block_id).await
    }
}

async fn read_slice(path: &std::path::Path, offset: u64, len: usize, block_id: BlockId) -> Result<Bytes, ReadError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .context(IoSnafu { block_id })?;
    file.seek(SeekFrom::Start(offset)).await.context(IoSnafu { block_id })?;

    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await.context(IoSnafu { block_id })?;
    Ok(Bytes::from(buf))
}

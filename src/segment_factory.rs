//! Resolves a block-id set to a list of [`Segment`]s (spec §4.C).
//!
//! `collect_blocks` is the reference-counting pre-step from the DESIGN
//! NOTES: it walks the expected ids and tries to retain a duplicated view
//! of each from the [`BufferManager`]. Ids that lose the race against a
//! concurrent flush (the weak handle fails to upgrade) or were never
//! resident at all fall through to the file-backed path in `build`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::block::BlockId;
use crate::codec::Serializer;
use crate::collaborators::BufferManager;
use crate::file_reader::BlockFlushFileReader;
use crate::segment::{FileSegment, MemorySegment, MissingBlockSnafu, Segment, SegmentError};

pub struct SegmentFactory {
    buffer_manager: Arc<dyn BufferManager>,
    serializer: Arc<dyn Serializer>,
}

impl SegmentFactory {
    pub fn new(buffer_manager: Arc<dyn BufferManager>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            buffer_manager,
            serializer,
        }
    }

    /// Attempts to retain an in-memory duplicate of every id in `block_ids`.
    ///
    /// Returns the ids that were actually retained, mapped to their bytes,
    /// and `true` only if every id was retained -- matching
    /// `collectBlocks`'s "returns true only when every id was successfully
    /// cached in memory" contract from spec §4.C.
    pub async fn collect_blocks(
        &self,
        app_id: &str,
        shuffle_id: u32,
        partition_id: u32,
        block_ids: &[BlockId],
    ) -> (HashMap<BlockId, Bytes>, bool) {
        let mut cached = HashMap::with_capacity(block_ids.len());
        let mut all_cached = true;

        for &block_id in block_ids {
            let retained = match self
                .buffer_manager
                .get(app_id, shuffle_id, partition_id, block_id)
                .await
            {
                Some(handle) => handle.retain(),
                None => None,
            };

            match retained {
                Some(payload) => {
                    let bytes = payload.bytes.slice(0..payload.data_length as usize);
                    cached.insert(block_id, bytes);
                }
                None => {
                    tracing::debug!(block_id, "falling back to file-backed segment");
                    all_cached = false;
                }
            }
        }

        (cached, all_cached)
    }

    /// Materializes one [`Segment`] per id in `block_ids`, preferring
    /// `cached` and falling back to `reader.register`.
    pub fn build(
        &self,
        block_ids: &[BlockId],
        cached: &HashMap<BlockId, Bytes>,
        reader: &BlockFlushFileReader,
    ) -> Result<Vec<Box<dyn Segment>>, SegmentError> {
        let mut segments: Vec<Box<dyn Segment>> = Vec::with_capacity(block_ids.len());

        for &block_id in block_ids {
            if let Some(bytes) = cached.get(&block_id) {
                segments.push(Box::new(MemorySegment::new(
                    block_id,
                    bytes.clone(),
                    Arc::clone(&self.serializer),
                )));
                continue;
            }

            let stream = reader
                .register(block_id)
                .map_err(|source| SegmentError::FileReader { block_id, source })?;

            match stream {
                Some(stream) => segments.push(Box::new(FileSegment::new(
                    block_id,
                    stream,
                    Arc::clone(&self.serializer),
                ))),
                None => return MissingBlockSnafu { block_id }.fail(),
            }
        }

        Ok(segments)
    }
}

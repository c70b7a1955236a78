//! The bounded, backpressured merge-output sink (spec §4.A).
//!
//! [`MergedResult`] carves an arbitrary byte stream into fixed-size numbered
//! blocks and hands each to a caller-supplied [`Emit`] policy. The policy
//! itself -- admission-control backoff against `TaskManager`, then
//! `BufferManager.cache` -- is deliberately *not* implemented here; spec
//! §4.A describes it as living in the Partition, so [`crate::partition`]
//! supplies the real [`Emit`] impl and this module stays a plain
//! block-slicing buffer, grounded on the same "accumulate then flush fixed
//! chunks" shape as `disk_v2::writer::Writer::write_record`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::HashMap;

use crate::block::BlockId;

/// Errors surfaced while writing into a [`MergedResult`].
#[derive(Debug, Snafu)]
pub enum SinkError {
    #[snafu(display("emit was rejected for merged block {}", block_id))]
    EmitRejected { block_id: BlockId },
}

/// Caller-supplied policy for accepting one completed merged block.
///
/// Implementations decide admission control and where the block is
/// ultimately cached; `emit` returning `false` is a hard failure for the
/// stream (spec §4.A: "When `emit` returns false the write stream must
/// surface an error synchronously").
#[async_trait]
pub trait Emit: Send + Sync {
    async fn emit(&self, payload: Bytes, block_id: BlockId, length: u32) -> bool;
}

/// Append-only sequence of emitted merged blocks for one partition.
///
/// Block ids are assigned densely starting at 0. Once a block is emitted,
/// its size stays queryable via [`MergedResult::size`] until the owning
/// partition is cleaned up.
pub struct MergedResult {
    merged_block_size: usize,
    next_block_id: AtomicU64,
    sizes: Mutex<HashMap<BlockId, u32>>,
}

impl MergedResult {
    pub fn new(merged_block_size: usize) -> Arc<Self> {
        Arc::new(Self {
            merged_block_size,
            next_block_id: AtomicU64::new(0),
            sizes: Mutex::new(HashMap::new()),
        })
    }

    /// Opens a write stream over this result.
    ///
    /// `direct` and `total_bytes` are threaded through for the caller's own
    /// bookkeeping (e.g. pre-sizing I/O buffers); this sink has no use for
    /// them beyond accepting them, matching spec §4.A's `open(direct,
    /// totalBytes)` contract.
    pub fn open(self: &Arc<Self>, direct: bool, total_bytes: u64, emitter: Arc<dyn Emit>) -> WriteStream {
        let _ = (direct, total_bytes);
        WriteStream {
            result: Arc::clone(self),
            emitter,
            buffer: BytesMut::new(),
        }
    }

    pub fn size(&self, block_id: BlockId) -> Option<u32> {
        self.sizes.lock().get(&block_id).copied()
    }

    pub fn is_out_of_bound(&self, block_id: BlockId) -> bool {
        !self.sizes.lock().contains_key(&block_id)
    }
}

/// Accepts arbitrary byte writes and flushes completed `merged_block_size`
/// chunks through the configured [`Emit`] policy.
pub struct WriteStream {
    result: Arc<MergedResult>,
    emitter: Arc<dyn Emit>,
    buffer: BytesMut,
}

impl WriteStream {
    pub async fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.result.merged_block_size {
            let chunk = self.buffer.split_to(self.result.merged_block_size).freeze();
            self.emit_chunk(chunk).await?;
        }
        Ok(())
    }

    /// Flushes any final, possibly short, block and consumes the stream.
    pub async fn finish(mut self) -> Result<(), SinkError> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::take(&mut self.buffer).freeze();
            self.emit_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn emit_chunk(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        let block_id = self.result.next_block_id.fetch_add(1, Ordering::SeqCst);
        let length = chunk.len() as u32;

        if !self.emitter.emit(chunk, block_id, length).await {
            return EmitRejectedSnafu { block_id }.fail();
        }

        self.result.sizes.lock().insert(block_id, length);
        Ok(())
    }
}

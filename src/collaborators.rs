//! External collaborator interfaces (spec §1, §6) and in-memory test doubles.
//!
//! `BufferManager`, `TaskManager`, `StorageManager`, and `EventHandler` are
//! explicitly out of scope per the purpose statement -- real
//! implementations live in the surrounding shuffle service. What belongs
//! here is the narrow trait surface the engine actually calls, plus
//! reference implementations good enough to drive the crate's own tests
//! and the demo binary.
//!
//! The reference-counted-buffer race described in the DESIGN NOTES (a
//! flush path releasing a block's memory while a reader is mid-retain) is
//! modeled the idiomatic way: the buffer manager holds the strong
//! [`std::sync::Arc`] owner, callers only ever see a [`WeakBlockHandle`],
//! and [`WeakBlockHandle::retain`] is a plain `Weak::upgrade` that returns
//! `None` if the flush path won the race. This replaces the "catch the
//! release exception" idiom entirely.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::block::{Block, BlockId};

/// Outcome of [`BufferManager::cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Success,
    /// Admission/bookkeeping rejected the block; the caller should release
    /// its buffer and treat the write as failed (spec §4.A step 3).
    Rejected,
}

/// The payload behind a [`WeakBlockHandle`]. Split out from [`Block`] so the
/// buffer manager can hold the strong owner while handing callers only a
/// weak view.
#[derive(Debug)]
pub struct BlockPayload {
    pub data_length: u32,
    pub uncompressed_length: u32,
    pub crc: u64,
    pub task_attempt_id: u64,
    pub bytes: Bytes,
}

/// A weak, racy view of an in-memory block.
///
/// Produced by [`BufferManager::get`]. Does not keep the block alive; the
/// owning buffer manager may drop its strong reference (e.g. because a
/// flush completed) at any time. [`WeakBlockHandle::retain`] is the
/// "on-LAB deep-copy or heap-allocated retain+duplicate" step from spec
/// §4.C collapsed into one upgrade attempt -- whether the underlying
/// allocator recycles the bytes as a unit (LAB) or per-block (heap) is the
/// buffer manager's concern, not the caller's.
#[derive(Clone)]
pub struct WeakBlockHandle {
    block_id: BlockId,
    payload: Weak<BlockPayload>,
}

impl WeakBlockHandle {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Attempts to retain a strong, duplicated view of the payload. Returns
    /// `None` if the buffer manager already released it -- the caller falls
    /// back to the file-backed segment for this block.
    pub fn retain(&self) -> Option<Arc<BlockPayload>> {
        self.payload.upgrade()
    }
}

/// Stores and indexes in-memory blocks keyed by (app, shuffle, partition, blockId).
#[async_trait]
pub trait BufferManager: Send + Sync {
    async fn get(
        &self,
        app_id: &str,
        shuffle_id: u32,
        partition_id: u32,
        block_id: BlockId,
    ) -> Option<WeakBlockHandle>;

    async fn cache(&self, app_id: &str, shuffle_id: u32, data: Block) -> CacheStatus;

    fn update_cached_block_ids(
        &self,
        app_id: &str,
        shuffle_id: u32,
        partition_id: u32,
        block_ids: &[BlockId],
    );
}

/// Global memory admission control and block-id bookkeeping.
#[async_trait]
pub trait TaskManager: Send + Sync {
    async fn require_memory(&self, n: u64, high_priority: bool) -> bool;
    fn release_memory(&self, n: u64, is_releasing_from_buffer: bool, is_pre_allocation: bool);
}

/// The result of resolving a partition's on-disk storage location.
#[derive(Debug, Clone)]
pub struct ShuffleIndex {
    pub data_file_name: PathBuf,
    pub index_bytes: Vec<u8>,
}

/// Resolves a (app, shuffle, partition) triple to its local data/index file pair.
///
/// Two different file pairs flow through this trait: the *input* partition's
/// data/index files (`data_file_path`/`index_file_path`, consumed directly by
/// [`crate::file_reader::BlockFlushFileReader`] while assembling segments)
/// and the *merged-output* index under the merged-app alias, which
/// [`crate::reader::MergedBlockReader`] reloads frequently and so gets back
/// as already-read bytes (`shuffle_index`, mirroring the
/// `ReadHandler.getShuffleIndex() -> IndexResult{dataFileName, indexBytes}`
/// shape from spec §6).
#[async_trait]
pub trait StorageManager: Send + Sync {
    async fn shuffle_index(
        &self,
        app_id: &str,
        shuffle_id: u32,
        partition_id: u32,
    ) -> io::Result<ShuffleIndex>;

    fn data_file_path(&self, app_id: &str, shuffle_id: u32, partition_id: u32) -> PathBuf;

    fn index_file_path(&self, app_id: &str, shuffle_id: u32, partition_id: u32) -> PathBuf;
}

/// A merge trigger submitted by [`crate::partition::Partition::start_sort_merge`].
#[derive(Debug, Clone)]
pub struct MergeEvent {
    pub app_id: String,
    pub shuffle_id: u32,
    pub partition_id: u32,
    pub expected_block_ids: Vec<BlockId>,
}

/// Accepts merge triggers for scheduling onto the merge-worker pool.
///
/// `handle` returning `false` means submission was refused (pool shutting
/// down, queue full); the partition moves straight to `INTERNAL_ERROR`.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: MergeEvent) -> bool;
}

/// Reference implementations good enough to drive this crate's own tests
/// and the demo binary. Not part of the scoped engine (spec §1).
pub mod testing {
    use super::*;

    type BlockKey = (String, u32, u32, BlockId);

    #[derive(Default)]
    pub struct InMemoryBufferManager {
        blocks: Mutex<HashMap<BlockKey, Arc<BlockPayload>>>,
        cached: Mutex<Vec<(String, u32, Block)>>,
    }

    impl InMemoryBufferManager {
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a resident block, returning the strong owner so a test
        /// can later drop it to simulate the flush path winning the race.
        pub fn insert(
            &self,
            app_id: &str,
            shuffle_id: u32,
            partition_id: u32,
            block_id: BlockId,
            bytes: Bytes,
        ) -> Arc<BlockPayload> {
            let payload = Arc::new(BlockPayload {
                data_length: bytes.len() as u32,
                uncompressed_length: bytes.len() as u32,
                crc: 0,
                task_attempt_id: 0,
                bytes,
            });
            self.blocks.lock().insert(
                (app_id.to_string(), shuffle_id, partition_id, block_id),
                Arc::clone(&payload),
            );
            payload
        }

        /// Drops this manager's own strong reference, simulating a
        /// concurrent flush releasing the block out from under a reader.
        pub fn release(&self, app_id: &str, shuffle_id: u32, partition_id: u32, block_id: BlockId) {
            self.blocks
                .lock()
                .remove(&(app_id.to_string(), shuffle_id, partition_id, block_id));
        }

        pub fn cached_blocks(&self) -> Vec<(String, u32, Block)> {
            self.cached.lock().clone()
        }
    }

    #[async_trait]
    impl BufferManager for InMemoryBufferManager {
        async fn get(
            &self,
            app_id: &str,
            shuffle_id: u32,
            partition_id: u32,
            block_id: BlockId,
        ) -> Option<WeakBlockHandle> {
            let key = (app_id.to_string(), shuffle_id, partition_id, block_id);
            self.blocks.lock().get(&key).map(|payload| WeakBlockHandle {
                block_id,
                payload: Arc::downgrade(payload),
            })
        }

        async fn cache(&self, app_id: &str, shuffle_id: u32, data: Block) -> CacheStatus {
            self.cached.lock().push((app_id.to_string(), shuffle_id, data));
            CacheStatus::Success
        }

        fn update_cached_block_ids(&self, _app_id: &str, _shuffle_id: u32, _partition_id: u32, _block_ids: &[BlockId]) {}
    }

    /// Always grants memory immediately; tests that exercise backoff timing
    /// use [`ScriptedTaskManager`] instead.
    #[derive(Default)]
    pub struct AlwaysGrantTaskManager;

    #[async_trait]
    impl TaskManager for AlwaysGrantTaskManager {
        async fn require_memory(&self, _n: u64, _high_priority: bool) -> bool {
            true
        }

        fn release_memory(&self, _n: u64, _is_releasing_from_buffer: bool, _is_pre_allocation: bool) {}
    }

    /// Denies the first `denials` calls to `require_memory`, then grants.
    /// Used to exercise the exponential-backoff admission path deterministically.
    pub struct ScriptedTaskManager {
        denials: Mutex<u32>,
    }

    impl ScriptedTaskManager {
        pub fn new(denials: u32) -> Self {
            Self {
                denials: Mutex::new(denials),
            }
        }
    }

    #[async_trait]
    impl TaskManager for ScriptedTaskManager {
        async fn require_memory(&self, _n: u64, _high_priority: bool) -> bool {
            let mut remaining = self.denials.lock();
            if *remaining == 0 {
                true
            } else {
                *remaining -= 1;
                false
            }
        }

        fn release_memory(&self, _n: u64, _is_releasing_from_buffer: bool, _is_pre_allocation: bool) {}
    }

    #[derive(Default)]
    pub struct InMemoryStorageManager {
        /// Merged-output index bytes, keyed by the merged-app alias (F's reload path).
        merged_indexes: Mutex<HashMap<(String, u32, u32), ShuffleIndex>>,
        /// Input partition's (data file, index file) paths (B's direct-open path).
        input_paths: Mutex<HashMap<(String, u32, u32), (PathBuf, PathBuf)>>,
    }

    impl InMemoryStorageManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_index(&self, app_id: &str, shuffle_id: u32, partition_id: u32, index: ShuffleIndex) {
            self.merged_indexes
                .lock()
                .insert((app_id.to_string(), shuffle_id, partition_id), index);
        }

        pub fn set_input_paths(
            &self,
            app_id: &str,
            shuffle_id: u32,
            partition_id: u32,
            data_file: PathBuf,
            index_file: PathBuf,
        ) {
            self.input_paths.lock().insert(
                (app_id.to_string(), shuffle_id, partition_id),
                (data_file, index_file),
            );
        }
    }

    #[async_trait]
    impl StorageManager for InMemoryStorageManager {
        async fn shuffle_index(&self, app_id: &str, shuffle_id: u32, partition_id: u32) -> io::Result<ShuffleIndex> {
            self.merged_indexes
                .lock()
                .get(&(app_id.to_string(), shuffle_id, partition_id))
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no shuffle index registered"))
        }

        fn data_file_path(&self, app_id: &str, shuffle_id: u32, partition_id: u32) -> PathBuf {
            self.input_paths
                .lock()
                .get(&(app_id.to_string(), shuffle_id, partition_id))
                .map(|(data, _)| data.clone())
                .unwrap_or_default()
        }

        fn index_file_path(&self, app_id: &str, shuffle_id: u32, partition_id: u32) -> PathBuf {
            self.input_paths
                .lock()
                .get(&(app_id.to_string(), shuffle_id, partition_id))
                .map(|(_, index)| index.clone())
                .unwrap_or_default()
        }
    }

    /// Runs the submitted event inline via `tokio::spawn`, always accepting.
    pub struct InlineEventHandler<F>
    where
        F: Fn(MergeEvent) + Send + Sync + 'static,
    {
        on_event: F,
    }

    impl<F> InlineEventHandler<F>
    where
        F: Fn(MergeEvent) + Send + Sync + 'static,
    {
        pub fn new(on_event: F) -> Self {
            Self { on_event }
        }
    }

    impl<F> EventHandler for InlineEventHandler<F>
    where
        F: Fn(MergeEvent) + Send + Sync + 'static,
    {
        fn handle(&self, event: MergeEvent) -> bool {
            (self.on_event)(event);
            true
        }
    }

    /// Always refuses; used to test the INITED -> INTERNAL_ERROR path.
    #[derive(Default)]
    pub struct RefusingEventHandler;

    impl EventHandler for RefusingEventHandler {
        fn handle(&self, _event: MergeEvent) -> bool {
            false
        }
    }
}

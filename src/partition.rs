//! The per-partition state machine: `startSortMerge` idempotence, reader-side
//! block fetch, and the real admission-controlled [`Emit`] policy (spec
//! §4.A step "emit policy in the Partition", §4.E).
//!
//! Grounded on the DESIGN NOTES' "small mutex-guarded enum; event dispatch
//! is a non-blocking send onto a work queue" pattern: [`Partition`] holds
//! state behind a `parking_lot::Mutex` and submits a [`MergeEvent`] to the
//! configured [`EventHandler`] rather than running the merge inline --
//! whatever the event handler wires up (a worker pool in production, an
//! inline `tokio::spawn` in tests) is what actually calls
//! [`Partition::run_merge`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};

use crate::block::{Block, BlockId, MergeState, MERGED_BLOCK_TASK_ATTEMPT_ID};
use crate::codec::{Comparator, Serializer};
use crate::collaborators::{BufferManager, CacheStatus, EventHandler, MergeEvent, StorageManager, TaskManager};
use crate::config::MergeConfig;
use crate::file_reader::{BlockFlushFileReader, FileReaderError};
use crate::index::ShuffleMeta;
use crate::merge_driver::{MergeDriver, MergeError};
use crate::segment_factory::SegmentFactory;
use crate::sink::{Emit, MergedResult};

/// Suffix appended to `appId` to form the synthetic app under which merged
/// blocks are cached (spec §6, "Merged-app naming").
pub const MERGED_APP_SUFFIX: &str = "_merged";

#[derive(Debug, Snafu)]
pub enum PartitionError {
    #[snafu(display("failed to open input data/index files: {}", source))]
    FileReader { source: FileReaderError },

    #[snafu(display("failed to build segments: {}", source))]
    SegmentFactory { source: crate::segment::SegmentError },

    #[snafu(display("merge failed: {}", source))]
    Merge { source: MergeError },
}

pub(crate) fn merged_app_id(app_id: &str) -> String {
    format!("{app_id}{MERGED_APP_SUFFIX}")
}

/// Admission-controlled emit policy consumed by [`crate::sink::WriteStream`].
///
/// Implements spec §4.A's three-step `emit` contract. `releaseMemory` is
/// deliberately never called on the success path -- memory is reclaimed
/// later when the buffer manager flushes the merged block back out, per the
/// Open Question in spec §9.
struct BackoffEmitter {
    app_id: String,
    shuffle_id: u32,
    partition_id: u32,
    task_manager: Arc<dyn TaskManager>,
    buffer_manager: Arc<dyn BufferManager>,
    init_sleep: Duration,
    max_sleep: Duration,
    next_backoff: Mutex<Duration>,
}

impl BackoffEmitter {
    #[allow(clippy::too_many_arguments)]
    fn new(
        app_id: String,
        shuffle_id: u32,
        partition_id: u32,
        task_manager: Arc<dyn TaskManager>,
        buffer_manager: Arc<dyn BufferManager>,
        init_sleep: Duration,
        max_sleep: Duration,
    ) -> Self {
        Self {
            app_id,
            shuffle_id,
            partition_id,
            task_manager,
            buffer_manager,
            init_sleep,
            max_sleep,
            next_backoff: Mutex::new(init_sleep),
        }
    }
}

#[async_trait]
impl Emit for BackoffEmitter {
    async fn emit(&self, payload: Bytes, block_id: BlockId, length: u32) -> bool {
        loop {
            if self.task_manager.require_memory(u64::from(length), false).await {
                break;
            }
            let delay = {
                let mut next = self.next_backoff.lock();
                let this_delay = *next;
                *next = (*next * 2).min(self.max_sleep);
                this_delay
            };
            tracing::trace!(block_id, delay_ms = delay.as_millis() as u64, "admission backoff");
            tokio::time::sleep(delay).await;
        }

        let crc = u64::from(crc32fast::hash(&payload));
        let block = Block {
            id: block_id,
            data_length: length,
            uncompressed_length: length,
            crc,
            task_attempt_id: MERGED_BLOCK_TASK_ATTEMPT_ID,
            payload,
        };

        match self.buffer_manager.cache(&self.app_id, self.shuffle_id, block).await {
            CacheStatus::Success => {
                self.buffer_manager
                    .update_cached_block_ids(&self.app_id, self.shuffle_id, self.partition_id, &[block_id]);
                *self.next_backoff.lock() = self.init_sleep;
                true
            }
            CacheStatus::Rejected => false,
        }
    }
}

/// One partition's sort-merge state and serving surface.
pub struct Partition {
    app_id: String,
    shuffle_id: u32,
    partition_id: u32,
    config: MergeConfig,
    state: Mutex<MergeState>,
    merged_result: Arc<MergedResult>,
    shuffle_meta: tokio::sync::Mutex<ShuffleMeta>,
    buffer_manager: Arc<dyn BufferManager>,
    task_manager: Arc<dyn TaskManager>,
    storage_manager: Arc<dyn StorageManager>,
    event_handler: Arc<dyn EventHandler>,
    comparator: Arc<dyn Comparator>,
    serializer: Arc<dyn Serializer>,
}

impl Partition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_id: impl Into<String>,
        shuffle_id: u32,
        partition_id: u32,
        config: MergeConfig,
        buffer_manager: Arc<dyn BufferManager>,
        task_manager: Arc<dyn TaskManager>,
        storage_manager: Arc<dyn StorageManager>,
        event_handler: Arc<dyn EventHandler>,
        comparator: Arc<dyn Comparator>,
        serializer: Arc<dyn Serializer>,
    ) -> Arc<Self> {
        let merged_block_size = config.merged_block_size();
        Arc::new(Self {
            app_id: app_id.into(),
            shuffle_id,
            partition_id,
            config,
            state: Mutex::new(MergeState::Inited),
            merged_result: MergedResult::new(merged_block_size),
            shuffle_meta: tokio::sync::Mutex::new(ShuffleMeta::new()),
            buffer_manager,
            task_manager,
            storage_manager,
            event_handler,
            comparator,
            serializer,
        })
    }

    pub fn state(&self) -> MergeState {
        *self.state.lock()
    }

    pub fn merged_result(&self) -> &Arc<MergedResult> {
        &self.merged_result
    }

    pub fn shuffle_meta(&self) -> &tokio::sync::Mutex<ShuffleMeta> {
        &self.shuffle_meta
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn shuffle_id(&self) -> u32 {
        self.shuffle_id
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn storage_manager(&self) -> &Arc<dyn StorageManager> {
        &self.storage_manager
    }

    pub fn buffer_manager(&self) -> &Arc<dyn BufferManager> {
        &self.buffer_manager
    }

    /// Triggers a sort-merge over `expected_block_ids`. Mutually exclusive:
    /// a duplicate call while already `MERGING` or terminal is ignored with
    /// a warning (spec §4.E, testable property "idempotent trigger").
    pub fn start_sort_merge(self: &Arc<Self>, expected_block_ids: Vec<BlockId>) {
        {
            let mut state = self.state.lock();
            if *state != MergeState::Inited {
                tracing::warn!(
                    app_id = %self.app_id,
                    partition_id = self.partition_id,
                    "duplicate startSortMerge ignored"
                );
                return;
            }

            if expected_block_ids.is_empty() {
                *state = MergeState::Done;
                tracing::debug!(app_id = %self.app_id, partition_id = self.partition_id, "empty partition, shortcut to DONE");
                return;
            }

            *state = MergeState::Merging;
        }

        let event = MergeEvent {
            app_id: self.app_id.clone(),
            shuffle_id: self.shuffle_id,
            partition_id: self.partition_id,
            expected_block_ids,
        };

        if !self.event_handler.handle(event) {
            *self.state.lock() = MergeState::InternalError;
            tracing::error!(
                app_id = %self.app_id,
                partition_id = self.partition_id,
                "merge event submission refused"
            );
        }
    }

    /// Actually runs the merge. Called by whatever the configured
    /// [`EventHandler`] schedules this onto (spec §4.D/§4.E); not called
    /// directly by `start_sort_merge`.
    pub async fn run_merge(self: Arc<Self>, expected_block_ids: Vec<BlockId>) {
        let result = self.run_merge_inner(&expected_block_ids).await;
        let mut state = self.state.lock();
        *state = match result {
            Ok(()) => MergeState::Done,
            Err(error) => {
                tracing::error!(app_id = %self.app_id, partition_id = self.partition_id, %error, "merge failed");
                MergeState::InternalError
            }
        };
    }

    async fn run_merge_inner(&self, expected_block_ids: &[BlockId]) -> Result<(), PartitionError> {
        let data_path = self.storage_manager.data_file_path(&self.app_id, self.shuffle_id, self.partition_id);
        let index_path = self
            .storage_manager
            .index_file_path(&self.app_id, self.shuffle_id, self.partition_id);

        let reader = Arc::new(
            BlockFlushFileReader::open(data_path, index_path, self.config.ring_buffer_size(), self.config.direct())
                .await
                .context(FileReaderSnafu)?,
        );

        let factory = SegmentFactory::new(Arc::clone(&self.buffer_manager), Arc::clone(&self.serializer));
        let (cached, _all_cached) = factory
            .collect_blocks(&self.app_id, self.shuffle_id, self.partition_id, expected_block_ids)
            .await;
        let segments = factory
            .build(expected_block_ids, &cached, &reader)
            .context(SegmentFactorySnafu)?;

        let emitter = Arc::new(BackoffEmitter::new(
            merged_app_id(&self.app_id),
            self.shuffle_id,
            self.partition_id,
            Arc::clone(&self.task_manager),
            Arc::clone(&self.buffer_manager),
            self.config.init_sleep(),
            self.config.max_sleep(),
        ));
        let output = self.merged_result.open(self.config.direct(), 0, emitter);

        MergeDriver::run(
            segments,
            reader,
            output,
            Arc::clone(&self.serializer),
            Arc::clone(&self.comparator),
        )
        .await
        .context(MergeSnafu)
    }

    /// Resolves a reader's `tryGet(blockId)` request without blocking on the
    /// merge (spec §4.E).
    pub fn try_get_block(&self, block_id: BlockId) -> (MergeState, i64) {
        let state = *self.state.lock();
        if state.allows_block_fetch() {
            match self.merged_result.size(block_id) {
                Some(size) => (state, i64::from(size)),
                None => (state, -1),
            }
        } else {
            (state, -1)
        }
    }

    /// Clears cached index state and releases retained resources.
    pub async fn cleanup(&self) {
        self.shuffle_meta.lock().await.clear();
    }
}

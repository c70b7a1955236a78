//! Per-block-stream bounded SPSC ring buffer of byte chunks.
//!
//! Grounded on `topology::channel::limited_queue`: a `crossbeam_queue::ArrayQueue`
//! backing store plus a pair of `tokio::sync::Notify` wakeups, one per
//! direction. Unlike `LimitedQueue` (which is a generic multi-item channel
//! gated by a semaphore sized in "events"), this ring is fixed-capacity in
//! slot count, single-producer/single-consumer, and carries an in-band EOF
//! sentinel instead of relying on a `None` returned from a closed channel --
//! both behaviors called for explicitly in spec §3 and §4.B.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

use bytes::Bytes;

/// One slot flowing through a [`BlockRing`].
#[derive(Debug, Clone)]
pub enum RingSlot {
    /// A chunk of bytes read from the data file, in file order.
    Chunk(Bytes),
    /// The stream reached the end of its block's data.
    Eof,
    /// The background reader hit an I/O error servicing this stream; no
    /// further slots will be produced.
    Error(String),
}

/// A bounded single-producer/single-consumer ring of [`RingSlot`]s.
///
/// The producer (the background file reader in
/// [`crate::file_reader::BlockFlushFileReader`]) parks on `push` when the
/// ring is full; the consumer (a file-backed [`crate::segment::Segment`])
/// parks on `pop` when the ring is empty. Capacity must already be a power
/// of two in `[2, 32]`; use [`crate::config::ring_capacity`] to compute it.
#[derive(Debug)]
pub struct BlockRing {
    queue: ArrayQueue<RingSlot>,
    not_empty: Notify,
    not_full: Notify,
}

impl BlockRing {
    pub fn new(capacity: usize) -> Arc<Self> {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!((2..=32).contains(&capacity));
        Arc::new(Self {
            queue: ArrayQueue::new(capacity),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Pushes a slot, parking the caller until there's room.
    ///
    /// Only ever called by the single background reader task that owns this
    /// ring; callers must not call this concurrently from multiple tasks.
    pub async fn push(&self, mut slot: RingSlot) {
        loop {
            match self.queue.push(slot) {
                Ok(()) => {
                    self.not_empty.notify_one();
                    return;
                }
                Err(rejected) => {
                    slot = rejected;
                    self.not_full.notified().await;
                }
            }
        }
    }

    /// Non-blocking push; returns the slot back if the ring is full.
    pub fn try_push(&self, slot: RingSlot) -> Result<(), RingSlot> {
        let result = self.queue.push(slot);
        if result.is_ok() {
            self.not_empty.notify_one();
        }
        result
    }

    /// Pops the next slot, parking the caller until one is available.
    ///
    /// Only ever called by the single consuming segment; callers must not
    /// call this concurrently from multiple tasks.
    pub async fn pop(&self) -> RingSlot {
        loop {
            if let Some(slot) = self.queue.pop() {
                self.not_full.notify_one();
                return slot;
            }
            self.not_empty.notified().await;
        }
    }

    /// Parks until a slot frees up (or until a stale stored wakeup resolves
    /// immediately). Used by the background reader in
    /// [`crate::file_reader`] to wait on a whole set of rings at once via
    /// `futures::future::select_all`.
    pub async fn wait_for_space(self: Arc<Self>) {
        self.not_full.notified().await;
    }
}

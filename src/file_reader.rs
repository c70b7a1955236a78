//! The block-flush file reader: an asynchronous, ring-buffered multi-stream
//! reader that lets many per-block segment iterators share one open data
//! file without blocking the merge loop (spec §4.B).
//!
//! Grounded on `disk_v2::reader::Reader`/`RecordReader`'s "one background
//! reader, buffered, with explicit error sentinels" shape, generalized from
//! one SPSC consumer to N, each fed by its own [`BlockRing`] the way
//! `topology::channel::limited_queue` feeds one `LimitedReceiver` -- except
//! here a single background task is the shared producer for all of them.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::task::JoinHandle;

use crate::block::BlockId;
use crate::index::{parse_index_records, IndexError, ShuffleMetaEntry};
use crate::ring::{BlockRing, RingSlot};

/// Bytes read per chunk from the data file; arbitrary but matches the
/// teacher's tendency to keep buffered I/O chunked in the tens-of-KB range.
const CHUNK_SIZE: usize = 64 * 1024;

/// Errors surfaced by [`BlockFlushFileReader`].
#[derive(Debug, Snafu)]
pub enum FileReaderError {
    #[snafu(display("block flush file reader I/O error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("failed to load shuffle index: {}", source))]
    Index { source: IndexError },

    #[snafu(display("block {} was requested after the reader was started", block_id))]
    RegisteredAfterStart { block_id: BlockId },

    #[snafu(display("stream for block {} failed: {}", block_id, reason))]
    StreamFailed { block_id: BlockId, reason: String },
}

enum Phase {
    Building,
    Started,
    Closed,
}

struct ProducerHandle {
    block_id: BlockId,
    offset: u64,
    remaining: u64,
    finished: bool,
    ring: Arc<BlockRing>,
}

struct Inner {
    phase: Phase,
    pending: Vec<ProducerHandle>,
    task: Option<JoinHandle<()>>,
}

/// Opens one (data, index) file pair and serves N concurrent per-block input
/// streams from a single background reader.
pub struct BlockFlushFileReader {
    data_file_path: PathBuf,
    index: HashMap<BlockId, ShuffleMetaEntry>,
    ring_capacity: usize,
    #[allow(dead_code)] // direct I/O is a hint; see module docs on `direct`.
    direct: bool,
    inner: Mutex<Inner>,
}

impl BlockFlushFileReader {
    /// Opens the reader against a data file and its companion index file.
    ///
    /// `direct` mirrors the `merge.direct` config key (spec §6): it signals
    /// a preference for unbuffered/direct I/O. Portable direct I/O isn't
    /// exposed by `tokio::fs`, so this implementation always goes through
    /// the page cache and only threads the flag through for observability;
    /// a platform-specific backend could act on it without changing this
    /// type's public surface.
    pub async fn open<P: AsRef<Path>>(
        data_file_path: P,
        index_file_path: P,
        ring_capacity: usize,
        direct: bool,
    ) -> Result<Self, FileReaderError> {
        let index_bytes = tokio::fs::read(index_file_path.as_ref())
            .await
            .context(IoSnafu)?;
        let entries = parse_index_records(&index_bytes).context(IndexSnafu)?;
        let index = entries.into_iter().map(|e| (e.block_id, e)).collect();

        Ok(Self {
            data_file_path: data_file_path.as_ref().to_path_buf(),
            index,
            ring_capacity,
            direct,
            inner: Mutex::new(Inner {
                phase: Phase::Building,
                pending: Vec::new(),
                task: None,
            }),
        })
    }

    /// Looks up `block_id` in the index and, if present, returns a lazy
    /// stream over its bytes. Returns `Ok(None)` if the block isn't in this
    /// reader's index at all. Fails if called after [`Self::start`].
    pub fn register(&self, block_id: BlockId) -> Result<Option<BlockInputStream>, FileReaderError> {
        let Some(entry) = self.index.get(&block_id).copied() else {
            return Ok(None);
        };

        let mut inner = self.inner.lock();
        if !matches!(inner.phase, Phase::Building) {
            return RegisteredAfterStartSnafu { block_id }.fail();
        }

        let ring = BlockRing::new(self.ring_capacity);
        inner.pending.push(ProducerHandle {
            block_id,
            offset: entry.offset,
            remaining: u64::from(entry.length),
            finished: false,
            ring: ring.clone(),
        });

        Ok(Some(BlockInputStream {
            block_id,
            length: u64::from(entry.length),
            ring,
        }))
    }

    /// Spawns the background reader task. After this, `register` returns an
    /// error; every stream the caller needs must already be registered.
    pub fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if !matches!(inner.phase, Phase::Building) {
            return;
        }
        inner.phase = Phase::Started;
        let streams = std::mem::take(&mut inner.pending);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = this.run_background_reader(streams).await {
                tracing::error!(error = %e, "block flush file reader I/O error");
            }
        });
        inner.task = Some(handle);
    }

    async fn run_background_reader(
        &self,
        mut streams: Vec<ProducerHandle>,
    ) -> Result<(), FileReaderError> {
        let mut file = File::open(&self.data_file_path).await.context(IoSnafu)?;

        loop {
            let mut made_progress = false;
            let mut all_finished = true;

            for stream in &mut streams {
                if stream.finished {
                    continue;
                }
                all_finished = false;

                if stream.ring.is_full() {
                    continue;
                }

                if stream.remaining == 0 {
                    let _ = stream.ring.try_push(RingSlot::Eof);
                    stream.finished = true;
                    made_progress = true;
                    continue;
                }

                let to_read = std::cmp::min(stream.remaining, CHUNK_SIZE as u64) as usize;
                match read_chunk(&mut file, stream.offset, to_read).await {
                    Ok(chunk) => {
                        stream.offset += chunk.len() as u64;
                        stream.remaining -= chunk.len() as u64;
                        let _ = stream.ring.try_push(RingSlot::Chunk(chunk));
                    }
                    Err(e) => {
                        tracing::error!(
                            block_id = stream.block_id,
                            error = %e,
                            "failed to read block from data file"
                        );
                        let _ = stream
                            .ring
                            .try_push(RingSlot::Error(e.to_string()));
                        stream.finished = true;
                    }
                }
                made_progress = true;
            }

            if all_finished {
                break;
            }

            if !made_progress {
                let waiters: Vec<_> = streams
                    .iter()
                    .filter(|s| !s.finished)
                    .map(|s| Box::pin(Arc::clone(&s.ring).wait_for_space()))
                    .collect();
                if waiters.is_empty() {
                    break;
                }
                futures::future::select_all(waiters).await;
            }
        }

        Ok(())
    }

    /// Signals shutdown, drains the background task, and closes the file.
    pub async fn close(self: &Arc<Self>) {
        let task = {
            let mut inner = self.inner.lock();
            inner.phase = Phase::Closed;
            inner.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn read_chunk(file: &mut File, offset: u64, len: usize) -> std::io::Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len];
    let mut read_total = 0;
    while read_total < len {
        let n = file.read(&mut buf[read_total..]).await?;
        if n == 0 {
            break;
        }
        read_total += n;
    }
    buf.truncate(read_total);
    Ok(Bytes::from(buf))
}

/// A lazy, ordered byte stream over one block's portion of a data file.
///
/// No I/O occurs until the owning [`BlockFlushFileReader::start`] is called
/// *and* this stream is actually polled for data (spec §4.B).
pub struct BlockInputStream {
    block_id: BlockId,
    length: u64,
    ring: Arc<BlockRing>,
}

impl BlockInputStream {
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Total number of bytes this stream will ever yield.
    pub fn available(&self) -> u64 {
        self.length
    }

    /// Reads the next chunk of bytes, in file order. Returns `Ok(None)` at
    /// end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, FileReaderError> {
        match self.ring.pop().await {
            RingSlot::Chunk(b) => Ok(Some(b)),
            RingSlot::Eof => Ok(None),
            RingSlot::Error(reason) => StreamFailedSnafu {
                block_id: self.block_id,
                reason,
            }
            .fail(),
        }
    }
}

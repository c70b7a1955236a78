//! An ordered stream of (key, value) records backing one input to the
//! k-way merge (spec §3, §4.C).
//!
//! Two implementations: [`MemorySegment`] wraps an already-resident buffer,
//! [`FileSegment`] wraps a lazy [`crate::file_reader::BlockInputStream`].
//! Both accumulate bytes until the configured [`Serializer`] can decode a
//! full record, mirroring how `disk_v2::reader::RecordReader` accumulates
//! into `aligned_buf` until it has enough bytes for one record.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use snafu::Snafu;

use crate::block::BlockId;
use crate::codec::Serializer;
use crate::file_reader::{BlockInputStream, FileReaderError};

/// Errors surfaced while reading records out of a [`Segment`].
#[derive(Debug, Snafu)]
pub enum SegmentError {
    #[snafu(display("block {} missing from both the memory cache and the data file", block_id))]
    MissingBlock { block_id: BlockId },

    #[snafu(display("failed to read segment for block {}: {}", block_id, source))]
    FileReader {
        block_id: BlockId,
        source: FileReaderError,
    },

    #[snafu(display("record codec error while reading segment for block {}: {}", block_id, reason))]
    Codec { block_id: BlockId, reason: String },
}

/// An ordered stream of (key, value) records.
///
/// Constructed unopened; [`Segment::init`] reads the first record. Consumed
/// monotonically by the merge via [`Segment::pop`]; [`Segment::close`]
/// releases buffers and ring slots.
#[async_trait]
pub trait Segment: Send {
    /// Primes the first record. Must be called once before any other method.
    async fn init(&mut self) -> Result<(), SegmentError>;

    /// The key of the record that would be returned by the next [`Segment::pop`],
    /// or `None` if the segment is exhausted.
    fn current_key(&self) -> Option<&[u8]>;

    /// Consumes and returns the current record, priming the next one.
    ///
    /// # Panics
    ///
    /// Panics if called when [`Segment::current_key`] is `None`; callers
    /// (the merge driver) must always check first.
    async fn pop(&mut self) -> Result<(Bytes, Bytes), SegmentError>;

    /// Releases any buffers or ring slots held by this segment.
    async fn close(&mut self);

    fn block_id(&self) -> BlockId;
}

/// A segment backed by an in-memory block buffer.
pub struct MemorySegment {
    block_id: BlockId,
    serializer: Arc<dyn Serializer>,
    remaining: Bytes,
    current: Option<(Bytes, Bytes)>,
}

impl MemorySegment {
    pub fn new(block_id: BlockId, buffer: Bytes, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            block_id,
            serializer,
            remaining: buffer,
            current: None,
        }
    }

    fn load_next(&mut self) -> Result<(), SegmentError> {
        self.current = self
            .serializer
            .read_record(&mut self.remaining)
            .map_err(|e| CodecSnafu {
                block_id: self.block_id,
                reason: e.to_string(),
            }
            .build())?;
        Ok(())
    }
}

#[async_trait]
impl Segment for MemorySegment {
    async fn init(&mut self) -> Result<(), SegmentError> {
        self.load_next()
    }

    fn current_key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_ref())
    }

    async fn pop(&mut self) -> Result<(Bytes, Bytes), SegmentError> {
        let record = self
            .current
            .take()
            .expect("pop called with no current record primed");
        self.load_next()?;
        Ok(record)
    }

    async fn close(&mut self) {
        self.remaining = Bytes::new();
        self.current = None;
    }

    fn block_id(&self) -> BlockId {
        self.block_id
    }
}

/// A segment backed by a lazy stream over a growing on-disk data file.
pub struct FileSegment {
    block_id: BlockId,
    stream: BlockInputStream,
    serializer: Arc<dyn Serializer>,
    remaining: Bytes,
    current: Option<(Bytes, Bytes)>,
}

impl FileSegment {
    pub fn new(block_id: BlockId, stream: BlockInputStream, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            block_id,
            stream,
            serializer,
            remaining: Bytes::new(),
            current: None,
        }
    }

    async fn load_next(&mut self) -> Result<(), SegmentError> {
        loop {
            let mut probe = self.remaining.clone();
            match self.serializer.read_record(&mut probe) {
                Ok(Some(record)) => {
                    self.remaining = probe;
                    self.current = Some(record);
                    return Ok(());
                }
                Ok(None) => match self.stream.next_chunk().await {
                    Ok(Some(chunk)) => {
                        let mut buf = BytesMut::with_capacity(self.remaining.len() + chunk.len());
                        buf.extend_from_slice(&self.remaining);
                        buf.extend_from_slice(&chunk);
                        self.remaining = buf.freeze();
                    }
                    Ok(None) => {
                        if self.remaining.is_empty() {
                            self.current = None;
                            return Ok(());
                        }
                        return CodecSnafu {
                            block_id: self.block_id,
                            reason: "partial record at end of file-backed stream".to_string(),
                        }
                        .fail();
                    }
                    Err(source) => {
                        return Err(SegmentError::FileReader {
                            block_id: self.block_id,
                            source,
                        });
                    }
                },
                Err(e) => {
                    return CodecSnafu {
                        block_id: self.block_id,
                        reason: e.to_string(),
                    }
                    .fail();
                }
            }
        }
    }
}

#[async_trait]
impl Segment for FileSegment {
    async fn init(&mut self) -> Result<(), SegmentError> {
        self.load_next().await
    }

    fn current_key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_ref())
    }

    async fn pop(&mut self) -> Result<(Bytes, Bytes), SegmentError> {
        let record = self
            .current
            .take()
            .expect("pop called with no current record primed");
        self.load_next().await?;
        Ok(record)
    }

    async fn close(&mut self) {
        self.remaining = Bytes::new();
        self.current = None;
    }

    fn block_id(&self) -> BlockId {
        self.block_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthPrefixedSerializer;

    fn serializer() -> Arc<dyn Serializer> {
        Arc::new(LengthPrefixedSerializer)
    }

    fn encode(records: &[(&[u8], &[u8])]) -> Bytes {
        let codec = LengthPrefixedSerializer;
        let mut buf = BytesMut::new();
        for (k, v) in records {
            codec.write_record(k, v, &mut buf).unwrap();
        }
        buf.freeze()
    }

    #[tokio::test]
    async fn memory_segment_yields_records_in_order() {
        let buf = encode(&[(b"a", b"1"), (b"b", b"2")]);
        let mut seg = MemorySegment::new(1, buf, serializer());
        seg.init().await.unwrap();

        assert_eq!(seg.current_key(), Some(&b"a"[..]));
        let (k, v) = seg.pop().await.unwrap();
        assert_eq!(&k[..], b"a");
        assert_eq!(&v[..], b"1");

        assert_eq!(seg.current_key(), Some(&b"b"[..]));
        let (k, v) = seg.pop().await.unwrap();
        assert_eq!(&k[..], b"b");
        assert_eq!(&v[..], b"2");

        assert_eq!(seg.current_key(), None);
        seg.close().await;
    }

    #[tokio::test]
    async fn memory_segment_handles_empty_input() {
        let mut seg = MemorySegment::new(1, Bytes::new(), serializer());
        seg.init().await.unwrap();
        assert_eq!(seg.current_key(), None);
    }
}

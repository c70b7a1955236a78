//! On-disk shuffle index: a flat sequence of fixed 40-byte big-endian
//! records, and the in-memory cache built from them (spec §3, §4.F, §6).
//!
//! The record codec mirrors `disk_v2::record`'s checksummed-fixed-record
//! shape but without `rkyv`: the wire layout here is fully specified by the
//! spec (`offset:u64 | length:u32 | uncompressed:u32 | crc:u64 | blockId:u64
//! | taskAttemptId:u64`), so a hand-rolled `bytes::Buf`/`BufMut` codec is the
//! idiomatic fit rather than a general-purpose archive format.

use std::collections::HashMap;
use std::io;

use bytes::{Buf, Bytes};
use snafu::{ensure, Snafu};

use crate::block::BlockId;

/// Size in bytes of one index record (spec §6).
pub const INDEX_RECORD_LEN: usize = 40;

/// Errors surfaced while reading or parsing a shuffle index file.
#[derive(Debug, Snafu)]
pub enum IndexError {
    #[snafu(display("failed to read shuffle index: {}", source))]
    Io { source: io::Error },

    #[snafu(display("index record truncated: expected {} bytes, got {}", expected, actual))]
    Truncated { expected: usize, actual: usize },
}

/// One parsed index record.
///
/// `crc`, `uncompressed`, and `task_attempt_id` are retained for API
/// completeness but are deliberately **not** validated against the data file
/// on read -- see the Open Question in spec §9 and `DESIGN.md`. A future
/// revision could validate `crc` here if corruption in the field became a
/// real concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleMetaEntry {
    pub offset: u64,
    pub length: u32,
    pub uncompressed: u32,
    pub crc: u64,
    pub block_id: BlockId,
    pub task_attempt_id: u64,
}

impl ShuffleMetaEntry {
    fn parse(buf: &mut Bytes) -> Result<Self, IndexError> {
        ensure!(
            buf.remaining() >= INDEX_RECORD_LEN,
            TruncatedSnafu {
                expected: INDEX_RECORD_LEN,
                actual: buf.remaining(),
            }
        );
        Ok(Self {
            offset: buf.get_u64(),
            length: buf.get_u32(),
            uncompressed: buf.get_u32(),
            crc: buf.get_u64(),
            block_id: buf.get_u64(),
            task_attempt_id: buf.get_u64(),
        })
    }

    pub fn encode(&self, out: &mut bytes::BytesMut) {
        use bytes::BufMut;
        out.put_u64(self.offset);
        out.put_u32(self.length);
        out.put_u32(self.uncompressed);
        out.put_u64(self.crc);
        out.put_u64(self.block_id);
        out.put_u64(self.task_attempt_id);
    }
}

/// Parses every complete record out of `raw`, in file order.
pub fn parse_index_records(raw: &[u8]) -> Result<Vec<ShuffleMetaEntry>, IndexError> {
    let mut buf = Bytes::copy_from_slice(raw);
    let mut entries = Vec::with_capacity(buf.len() / INDEX_RECORD_LEN);
    while buf.has_remaining() {
        entries.push(ShuffleMetaEntry::parse(&mut buf)?);
    }
    Ok(entries)
}

/// Cached mapping `blockId -> (offset, length)` into a named data file.
///
/// The index may lag behind the actual file; it is reloaded on demand when a
/// queried `blockId` is absent (spec §3, §4.F). To keep repeated reloads
/// cheap as the index grows, the cache remembers how many bytes of the raw
/// index it has already parsed (the watermark) so a reload only parses the
/// new tail.
#[derive(Debug, Default)]
pub struct ShuffleMeta {
    entries: HashMap<BlockId, ShuffleMetaEntry>,
    watermark: usize,
}

impl ShuffleMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, block_id: BlockId) -> Option<ShuffleMetaEntry> {
        self.entries.get(&block_id).copied()
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.entries.contains_key(&block_id)
    }

    /// Reparses only the bytes appended since the last reload, per the
    /// append-only/watermark model in spec §9's "growing-file index reload"
    /// design note.
    pub fn reload(&mut self, full_index_bytes: &[u8]) -> Result<(), IndexError> {
        if full_index_bytes.len() < self.watermark {
            // The index shrank out from under us (e.g. truncated/recreated);
            // reparse from scratch rather than skip bytes that no longer exist.
            self.entries.clear();
            self.watermark = 0;
        }

        let tail = &full_index_bytes[self.watermark..];
        let usable_len = tail.len() - (tail.len() % INDEX_RECORD_LEN);
        let new_entries = parse_index_records(&tail[..usable_len])?;
        for entry in new_entries {
            self.entries.insert(entry.block_id, entry);
        }
        self.watermark += usable_len;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.watermark = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    fn sample(block_id: BlockId, offset: u64, length: u32) -> ShuffleMetaEntry {
        ShuffleMetaEntry {
            offset,
            length,
            uncompressed: length,
            crc: 0xDEAD_BEEF,
            block_id,
            task_attempt_id: 7,
        }
    }

    #[test]
    fn round_trips_a_record() {
        let entry = sample(42, 1024, 256);
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        assert_eq!(buf.len(), INDEX_RECORD_LEN);

        let parsed = parse_index_records(&buf).unwrap();
        assert_eq!(parsed, vec![entry]);
    }

    #[test]
    fn reload_is_incremental_over_the_watermark() {
        let mut meta = ShuffleMeta::new();
        let mut buf = BytesMut::new();
        sample(1, 0, 10).encode(&mut buf);
        meta.reload(&buf).unwrap();
        assert!(meta.contains(1));
        assert!(!meta.contains(2));

        sample(2, 10, 20).encode(&mut buf);
        meta.reload(&buf).unwrap();
        assert!(meta.contains(1));
        assert!(meta.contains(2));
        assert_eq!(meta.get(2).unwrap().offset, 10);
    }

    #[test]
    fn reload_tolerates_a_partially_written_trailing_record() {
        let mut meta = ShuffleMeta::new();
        let mut buf = BytesMut::new();
        sample(1, 0, 10).encode(&mut buf);
        buf.extend_from_slice(&[0u8; 12]); // partial next record, still being written
        meta.reload(&buf).unwrap();
        assert!(meta.contains(1));
        assert_eq!(meta.entries.len(), 1);
    }
}

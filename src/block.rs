use std::fmt;

use bytes::Bytes;

/// Sentinel task-attempt id carried by every merged block (spec §3).
pub const MERGED_BLOCK_TASK_ATTEMPT_ID: u64 = u64::MAX; // wire representation of "-1"

/// Globally-unique (within a partition) identifier for a block.
pub type BlockId = u64;

/// An opaque byte record with a globally unique id; the atomic unit cached
/// and flushed by the shuffle service.
///
/// Input blocks carry the task-attempt id that produced them. Emitted merged
/// blocks use [`MERGED_BLOCK_TASK_ATTEMPT_ID`] and set `crc`/
/// `uncompressed_length` to the encoded length, per spec §3.
#[derive(Clone)]
pub struct Block {
    pub id: BlockId,
    pub data_length: u32,
    pub uncompressed_length: u32,
    pub crc: u64,
    pub task_attempt_id: u64,
    pub payload: Bytes,
}

impl Block {
    /// Builds a block representing one merged output chunk.
    pub fn merged(id: BlockId, payload: Bytes) -> Self {
        let len = payload.len() as u32;
        Self {
            id,
            data_length: len,
            uncompressed_length: len,
            crc: u64::from(crc32fast::hash(&payload)),
            task_attempt_id: MERGED_BLOCK_TASK_ATTEMPT_ID,
            payload,
        }
    }

    pub fn is_merged_output(&self) -> bool {
        self.task_attempt_id == MERGED_BLOCK_TASK_ATTEMPT_ID
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("data_length", &self.data_length)
            .field("uncompressed_length", &self.uncompressed_length)
            .field("crc", &self.crc)
            .field("task_attempt_id", &self.task_attempt_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Lifecycle of a single partition's sort-merge.
///
/// Valid transitions: `Inited -> Merging`, `Inited -> Done` (empty input),
/// `Merging -> Done`, `Merging -> InternalError`, `Inited -> InternalError`.
/// `Done` and `InternalError` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Inited,
    Merging,
    Done,
    InternalError,
}

impl MergeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MergeState::Done | MergeState::InternalError)
    }

    /// Whether a caller may observe emitted blocks while in this state (spec §4.E).
    pub fn allows_block_fetch(self) -> bool {
        matches!(self, MergeState::Merging | MergeState::Done)
    }
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeState::Inited => "INITED",
            MergeState::Merging => "MERGING",
            MergeState::Done => "DONE",
            MergeState::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_block_carries_sentinel_task_attempt_id() {
        let block = Block::merged(7, Bytes::from_static(b"hello"));
        assert!(block.is_merged_output());
        assert_eq!(block.data_length, 5);
        assert_eq!(block.uncompressed_length, 5);
    }

    #[test]
    fn state_terminality() {
        assert!(!MergeState::Inited.is_terminal());
        assert!(!MergeState::Merging.is_terminal());
        assert!(MergeState::Done.is_terminal());
        assert!(MergeState::InternalError.is_terminal());
    }

    #[test]
    fn block_fetch_visibility() {
        assert!(!MergeState::Inited.allows_block_fetch());
        assert!(MergeState::Merging.allows_block_fetch());
        assert!(MergeState::Done.allows_block_fetch());
        assert!(!MergeState::InternalError.allows_block_fetch());
    }
}

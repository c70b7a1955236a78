//! Per-partition sort-merge engine for a remote shuffle service.
//!
//! Assembles the blocks belonging to one (app, shuffle, partition) triple --
//! some still resident in memory, others already flushed to a local data
//! file -- sorts them under a caller-supplied key comparator, and emits a
//! new ordered stream of fixed-size merged blocks. See `SPEC_FULL.md` for
//! the full component breakdown; this crate implements components A-F:
//! [`sink`] (A), [`file_reader`] (B), [`segment_factory`]/[`segment`] (C),
//! [`merge_driver`] (D), [`partition`] (E), and [`reader`] (F).
//!
//! `BufferManager`, `TaskManager`, `StorageManager`, and `EventHandler` are
//! out of scope -- [`collaborators`] declares the trait surface this crate
//! calls plus in-memory reference implementations for tests and the demo
//! binary.

pub mod block;
pub mod codec;
pub mod collaborators;
pub mod config;
pub mod file_reader;
pub mod index;
pub mod merge_driver;
pub mod partition;
pub mod reader;
pub mod ring;
pub mod segment;
pub mod segment_factory;
pub mod sink;

pub use block::{Block, BlockId, MergeState};
pub use config::MergeConfig;
pub use partition::Partition;
pub use reader::MergedBlockReader;

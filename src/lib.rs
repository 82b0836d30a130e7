//! The compaction subsystem of a log-structured merge tree
//! (LSM-tree).
//!
//! ##### NOTE
//!
//! > This crate only provides the compaction machinery of an LSM
//! > storage engine: the job object that merges a pinned set of
//! > sorted, immutable segments into a new sorted set at a target
//! > level, discards obsolete versions, and installs the result
//! > atomically into the level manifest. Picking *which* files to
//! > compact is the embedding engine's job.
//!
//! ##### About
//!
//! A compaction job is handed an immutable [`CompactionPlan`] (input
//! segments, snapshots, knobs) and driven through three phases:
//!
//! - `prepare` (under the engine mutex) pins the inputs and
//!   partitions the key space into subcompactions of roughly equal
//!   size
//! - `run` (without the mutex) executes the subcompactions on
//!   parallel threads, each streaming a merged, snapshot-aware view
//!   of its key range into a sequence of output segments, then
//!   verifies every produced file by reading it back
//! - `install` (under the mutex again) applies one atomic edit to the
//!   level manifest
//!
//! Obsolete versions, tombstones on the bottommost level, resolved
//! merge chains and filtered values are dropped along the way; large
//! values can be extracted into blob files, and garbage in
//! pre-existing blob files is accounted per file.
//!
//! # Example usage
//!
//! ```
//! use lsm_compaction::{
//!     compaction::{CompactionJob, CompactionPlan, InputLevel, JobOptions},
//!     BlockCache, DescriptorTable, VersionSet,
//! };
//! use std::sync::{Arc, Mutex};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let descriptor_table = Arc::new(DescriptorTable::new(folder.path().join("segments")));
//! let block_cache = Arc::new(BlockCache::with_capacity_bytes(8 * 1_024 * 1_024));
//!
//! let versions = VersionSet::create_new(
//!     7,
//!     folder.path(),
//!     descriptor_table.clone(),
//!     block_cache.clone(),
//! )?;
//! let versions = Arc::new(Mutex::new(versions));
//!
//! // The scheduler would hand us real input files here
//! let inputs = vec![InputLevel { level: 0, segments: vec![] }];
//! let plan = CompactionPlan::new(inputs, 0, 1).max_subcompactions(4);
//!
//! let opts = JobOptions::new(1, versions, descriptor_table, block_cache, folder.path());
//! let mut job = CompactionJob::new(plan, opts);
//!
//! // An empty plan is rejected during preparation
//! assert!(job.prepare().is_err());
//! job.cleanup();
//! #
//! # Ok::<(), lsm_compaction::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]

#[doc(hidden)]
pub mod blob;

mod block_cache;
pub mod compaction;
mod descriptor_table;
mod error;
mod events;
mod file;
mod id;

#[doc(hidden)]
pub mod merge;

mod range_tombstone;

#[doc(hidden)]
pub mod segment;

mod serde;
mod sharded;
mod stop_signal;
mod time;
mod value;
mod version;

pub use {
    block_cache::BlockCache,
    compaction::{CompactionJob, CompactionPlan, InputLevel, JobOptions},
    descriptor_table::DescriptorTable,
    error::{Error, Result, StopReason},
    events::EVENTS_TARGET,
    id::FileNumberAllocator,
    range_tombstone::RangeTombstone,
    segment::{
        meta::{CompressionType, Metadata, Temperature},
        Segment,
    },
    serde::{DeserializeError, SerializeError},
    stop_signal::StopSignal,
    value::{ParsedInternalKey, SeqNo, UserKey, UserValue, Value, ValueType},
    version::{VersionEdit, VersionSet},
};

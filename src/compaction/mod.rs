//! The compaction job: merges a pinned set of input segments into a
//! new sorted set at a target level, discarding obsolete versions,
//! and installs the result atomically into the version state
//!
//! A job runs through `prepare` (under the engine mutex), `run`
//! (without it, fanning out one thread per subcompaction), and
//! `install` (under the mutex again); `cleanup` always runs last.

/// Compaction filter and merge operator seams
pub mod filter;

pub(crate) mod install;

/// The snapshot-aware retain/drop transform
pub mod iterator;

/// Job orchestration
pub mod job;

pub(crate) mod planner;

/// Range tombstone collection and routing
pub mod range_del;

/// Per-subcompaction and job-level counters
pub mod stats;

/// The per-subcompaction worker loop
pub mod worker;

pub use filter::{CompactionFilter, Decision, MergeOperator};
pub use job::{CompactionJob, JobOptions};

use crate::{
    segment::meta::{CompressionType, Temperature},
    value::{SeqNo, UserKey},
    Error, Segment,
};
use std::sync::Arc;

/// Maps a sequence number to its visibility stratum
///
/// Versions in the same stratum are indistinguishable to every
/// snapshot; only the newest one of a stratum must survive.
pub(crate) fn visible_stratum(snapshots: &[SeqNo], seqno: SeqNo) -> usize {
    snapshots.partition_point(|s| *s < seqno)
}

/// One input level of a compaction
#[derive(Clone)]
pub struct InputLevel {
    /// LSM level the segments currently live on
    pub level: u8,

    /// Pinned segments of that level, in key order (L1+) or
    /// newest-first (L0)
    pub segments: Vec<Arc<Segment>>,
}

/// Input for a compaction job, immutable for the job's lifetime
///
/// The scheduler picks the files; this crate merges them. The engine
/// guarantees none of the input files is deleted or rewritten until
/// the job completes.
#[derive(Clone)]
pub struct CompactionPlan {
    /// Input files, grouped per level
    pub inputs: Vec<InputLevel>,

    /// Shallowest input level
    pub start_level: u8,

    /// Level the new segments are written to
    pub output_level: u8,

    /// Sequence numbers that must remain visible, ascending
    pub snapshots: Vec<SeqNo>,

    /// Snapshot boundary used by write-conflict checking; single
    /// delete pairs newer than this are kept instead of annihilated
    pub earliest_write_conflict_snapshot: SeqNo,

    /// Segment target size
    ///
    /// If an output reaches the target size, a new one is started.
    /// This results in a sorted "run" of segments.
    pub max_output_file_size: u64,

    /// Upper bound for the parallel fan-out
    pub max_subcompactions: usize,

    /// Compression for output segments
    pub output_compression: CompressionType,

    /// Temperature hint for output segments
    pub output_temperature: Temperature,

    /// Store values of at least `min_blob_size` in blob files
    pub enable_blob_files: bool,

    /// Minimum value size for blob extraction
    pub min_blob_size: u32,

    /// Target size of written blob files
    pub blob_file_target_size: u64,

    /// Fail the job when a single delete meets anything but exactly
    /// one matching value
    pub enforce_single_delete_contracts: bool,

    /// Drop versions newer than this before snapshot resolution
    pub trim_seqno: Option<SeqNo>,

    /// Below this point, all versions of a key collapse to the single
    /// newest one regardless of snapshots
    pub full_history_watermark: Option<SeqNo>,

    /// Optional user transform applied to values
    pub compaction_filter: Option<Arc<dyn CompactionFilter + Send + Sync>>,

    /// Resolves chains of merge operands
    pub merge_operator: Option<Arc<dyn MergeOperator + Send + Sync>>,

    /// Input files whose TTL expired; outputs are cut at their
    /// boundaries so re-compacting them stays cheap
    pub files_to_cut_for_ttl: Vec<u64>,

    /// Cut an output early once it overlaps this many bytes at the
    /// grandparent level, bounding future write amplification
    pub max_grandparent_overlap_bytes: u64,
}

impl CompactionPlan {
    /// Creates a plan with default knobs
    #[must_use]
    pub fn new(inputs: Vec<InputLevel>, start_level: u8, output_level: u8) -> Self {
        Self {
            inputs,
            start_level,
            output_level,
            snapshots: Vec::new(),
            earliest_write_conflict_snapshot: SeqNo::MAX,
            max_output_file_size: 64 * 1_024 * 1_024,
            max_subcompactions: 1,
            output_compression: CompressionType::default(),
            output_temperature: Temperature::default(),
            enable_blob_files: false,
            min_blob_size: 0,
            blob_file_target_size: 256 * 1_024 * 1_024,
            enforce_single_delete_contracts: false,
            trim_seqno: None,
            full_history_watermark: None,
            compaction_filter: None,
            merge_operator: None,
            files_to_cut_for_ttl: Vec::new(),
            max_grandparent_overlap_bytes: 10 * 64 * 1_024 * 1_024,
        }
    }

    /// Sets the snapshots that must remain visible
    #[must_use]
    pub fn snapshots(mut self, snapshots: Vec<SeqNo>) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Sets the output segment target size
    #[must_use]
    pub fn max_output_file_size(mut self, bytes: u64) -> Self {
        self.max_output_file_size = bytes;
        self.max_grandparent_overlap_bytes = 10 * bytes;
        self
    }

    /// Sets the upper bound for the parallel fan-out
    #[must_use]
    pub fn max_subcompactions(mut self, n: usize) -> Self {
        self.max_subcompactions = n;
        self
    }

    /// Sets the merge operator
    #[must_use]
    pub fn merge_operator(mut self, op: Arc<dyn MergeOperator + Send + Sync>) -> Self {
        self.merge_operator = Some(op);
        self
    }

    /// Sets the compaction filter
    #[must_use]
    pub fn compaction_filter(mut self, f: Arc<dyn CompactionFilter + Send + Sync>) -> Self {
        self.compaction_filter = Some(f);
        self
    }

    /// Iterates over all input segments
    pub fn all_segments(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.inputs.iter().flat_map(|input| input.segments.iter())
    }

    /// Returns the file numbers of all input segments
    #[must_use]
    pub fn input_file_numbers(&self) -> Vec<u64> {
        self.all_segments()
            .map(|segment| segment.metadata.file_number)
            .collect()
    }

    /// Returns the total size of all input segments in bytes
    #[must_use]
    pub fn input_bytes(&self) -> u64 {
        self.all_segments()
            .map(|segment| segment.metadata.file_size)
            .sum()
    }

    /// Computes the user key range spanned by all inputs
    #[must_use]
    pub fn key_range(&self) -> Option<(UserKey, UserKey)> {
        let mut range: Option<(UserKey, UserKey)> = None;

        for segment in self.all_segments() {
            let (lo, hi) = &segment.metadata.key_range;

            range = Some(match range {
                None => (lo.clone(), hi.clone()),
                Some((cur_lo, cur_hi)) => (
                    if *lo < cur_lo { lo.clone() } else { cur_lo },
                    if *hi > cur_hi { hi.clone() } else { cur_hi },
                ),
            });
        }

        range
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.start_level > self.output_level {
            return Err(Error::InvalidArgument(format!(
                "start level {} is below output level {}",
                self.start_level, self.output_level,
            )));
        }

        if self.inputs.iter().all(|input| input.segments.is_empty()) {
            return Err(Error::InvalidArgument("no input files".into()));
        }

        if !self.snapshots.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::InvalidArgument(
                "snapshot list is not strictly ascending".into(),
            ));
        }

        if let Some(filter) = &self.compaction_filter {
            if !filter.ignore_snapshots() {
                return Err(Error::NotSupported(format!(
                    "compaction filter {:?} wants snapshot-aware filtering",
                    filter.name(),
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_visible_stratum() {
        let snapshots = [6, 10];

        // Seen by snapshot 6
        assert_eq!(0, visible_stratum(&snapshots, 2));
        assert_eq!(0, visible_stratum(&snapshots, 6));

        // Seen by snapshot 10 only
        assert_eq!(1, visible_stratum(&snapshots, 7));

        // Newer than every snapshot
        assert_eq!(2, visible_stratum(&snapshots, 11));

        // No snapshots: everything shares one stratum
        assert_eq!(0, visible_stratum(&[], 5));
    }
}

use super::visible_stratum;
use crate::{
    range_tombstone::RangeTombstone,
    value::{SeqNo, UserKey},
};
use std::cmp::Reverse;

/// Collects the range tombstones of a subcompaction's inputs and
/// routes them into the right output files
///
/// The aggregator is fully populated while the input iterator is
/// built; during the key loop it is only read.
#[allow(clippy::module_name_repetitions)]
pub struct RangeDelAggregator {
    tombstones: Vec<RangeTombstone>,
    snapshots: Vec<SeqNo>,
    bottommost: bool,
}

impl RangeDelAggregator {
    /// Creates an empty aggregator for the given snapshot list
    #[must_use]
    pub fn new(snapshots: Vec<SeqNo>, bottommost: bool) -> Self {
        Self {
            tombstones: Vec::new(),
            snapshots,
            bottommost,
        }
    }

    /// Adds a tombstone, clipped to the worker's `[start, end)` bounds
    ///
    /// Tombstones that end up empty after clipping are discarded.
    pub fn add_clipped(
        &mut self,
        mut tombstone: RangeTombstone,
        start: Option<&UserKey>,
        end: Option<&UserKey>,
    ) {
        if let Some(start) = start {
            if tombstone.start < *start {
                tombstone.start = start.clone();
            }
        }

        if let Some(end) = end {
            if tombstone.end > *end {
                tombstone.end = end.clone();
            }
        }

        if tombstone.is_valid() {
            self.tombstones.push(tombstone);
        }
    }

    /// Sorts the collected tombstones; must be called once all inputs
    /// are registered
    pub fn freeze(&mut self) {
        self.tombstones
            .sort_by(|a, b| (&a.start, Reverse(a.seqno)).cmp(&(&b.start, Reverse(b.seqno))));
    }

    /// Returns `true` if no tombstones were collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    fn stratum(&self, seqno: SeqNo) -> usize {
        visible_stratum(&self.snapshots, seqno)
    }

    /// Returns `true` if the tombstone is no longer observable and can
    /// be garbage-collected
    fn is_obsolete(&self, tombstone: &RangeTombstone) -> bool {
        // Safe on the bottommost level once no snapshot is older than
        // the tombstone: everything it deletes dies in this compaction
        self.bottommost && self.stratum(tombstone.seqno) == 0
    }

    /// Returns `true` if some tombstone deletes the given version of the key
    ///
    /// A tombstone only deletes versions in its own visibility
    /// stratum; a snapshot between the two forces both to survive.
    #[must_use]
    pub fn covers(&self, key: &[u8], seqno: SeqNo) -> bool {
        let stratum = self.stratum(seqno);

        self.tombstones
            .iter()
            .any(|t| t.covers(key, seqno) && self.stratum(t.seqno) == stratum)
    }

    /// Emits the tombstones an output file must carry
    ///
    /// Selects every surviving tombstone overlapping the half-open
    /// range `[lo, hi)` (`None` = unbounded), truncated to that range.
    /// Tombstones with identical ranges in the same stratum collapse
    /// to the newest one.
    #[must_use]
    pub fn for_output(
        &self,
        lo: Option<&UserKey>,
        hi: Option<&UserKey>,
    ) -> Vec<RangeTombstone> {
        let mut out: Vec<RangeTombstone> = Vec::new();

        for tombstone in &self.tombstones {
            if self.is_obsolete(tombstone) {
                continue;
            }

            let mut truncated = tombstone.clone();

            if let Some(lo) = lo {
                if truncated.start < *lo {
                    truncated.start = lo.clone();
                }
            }

            if let Some(hi) = hi {
                if truncated.end > *hi {
                    truncated.end = hi.clone();
                }
            }

            if !truncated.is_valid() {
                continue;
            }

            // Collapse per boundary: identical ranges in the same
            // stratum only keep their newest representative
            if let Some(prev) = out.iter_mut().find(|other| {
                other.start == truncated.start
                    && other.end == truncated.end
                    && self.stratum(other.seqno) == self.stratum(truncated.seqno)
            }) {
                if truncated.seqno > prev.seqno {
                    *prev = truncated;
                }
                continue;
            }

            out.push(truncated);
        }

        out.sort_by(|a, b| (&a.start, Reverse(a.seqno)).cmp(&(&b.start, Reverse(b.seqno))));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_covers_respects_strata() {
        let mut agg = RangeDelAggregator::new(vec![6], false);
        agg.add_clipped(RangeTombstone::new(*b"a", *b"m", 8), None, None);
        agg.freeze();

        // Same stratum (both above snapshot 6)
        assert!(agg.covers(b"c", 7));

        // Version is pinned by snapshot 6, tombstone is not
        assert!(!agg.covers(b"c", 3));

        // Outside the range
        assert!(!agg.covers(b"x", 7));
    }

    #[test]
    fn test_bottommost_drops_tombstones() {
        let mut agg = RangeDelAggregator::new(vec![], true);
        agg.add_clipped(RangeTombstone::new(*b"a", *b"m", 8), None, None);
        agg.freeze();

        // Still deletes covered keys during this compaction...
        assert!(agg.covers(b"c", 3));

        // ...but is not written into any output
        assert!(agg.for_output(None, None).is_empty());
    }

    #[test]
    fn test_clipping_to_worker_bounds() {
        let mut agg = RangeDelAggregator::new(vec![], false);

        let start: UserKey = (*b"d").into();
        let end: UserKey = (*b"k").into();

        agg.add_clipped(RangeTombstone::new(*b"a", *b"m", 8), Some(&start), Some(&end));

        // Fully outside the bounds
        agg.add_clipped(RangeTombstone::new(*b"n", *b"z", 9), Some(&start), Some(&end));
        agg.freeze();

        let out = agg.for_output(None, None);

        assert_eq!(vec![RangeTombstone::new(*b"d", *b"k", 8)], out);
    }

    #[test]
    fn test_identical_ranges_collapse_per_stratum() {
        let mut agg = RangeDelAggregator::new(vec![5], false);
        agg.add_clipped(RangeTombstone::new(*b"a", *b"m", 9), None, None);
        agg.add_clipped(RangeTombstone::new(*b"a", *b"m", 8), None, None);
        agg.add_clipped(RangeTombstone::new(*b"a", *b"m", 3), None, None);
        agg.freeze();

        let out = agg.for_output(None, None);

        // 9 + 8 collapse (same stratum), 3 survives under snapshot 5
        assert_eq!(
            vec![
                RangeTombstone::new(*b"a", *b"m", 9),
                RangeTombstone::new(*b"a", *b"m", 3),
            ],
            out
        );
    }
}

use super::{
    filter::{CompactionFilter, Decision, MergeOperator},
    range_del::RangeDelAggregator,
    stats::SubcompactionStats,
    visible_stratum, CompactionPlan,
};
use crate::{
    blob::BlobFileWriter,
    merge::BoxedIterator,
    value::{SeqNo, UserKey, UserValue, ValueType},
    Error, Value,
};
use std::{cmp::Reverse, collections::VecDeque, sync::Arc};

/// Single-pass transform of the merged input stream into the records
/// that survive the compaction
///
/// Consumes versions grouped by user key (newest first) and decides,
/// per visibility stratum, which version every snapshot will keep
/// seeing: hidden versions are dropped, tombstones are
/// garbage-collected on the bottommost level, merge chains are
/// resolved, single-delete contracts are checked, the compaction
/// filter runs, and large values are extracted into blob files.
///
/// Errors are terminal: after the first `Err`, the iterator fuses.
#[allow(clippy::module_name_repetitions)]
pub struct CompactionIterator<'a> {
    inner: BoxedIterator<'a>,
    peeked: Option<Value>,
    pending: VecDeque<Value>,
    failed: bool,
    skip_until: Option<UserKey>,

    snapshots: Vec<SeqNo>,
    earliest_write_conflict_snapshot: SeqNo,
    bottommost: bool,
    output_level: u8,
    enforce_single_delete_contracts: bool,
    full_history_watermark: Option<SeqNo>,

    filter: Option<Arc<dyn CompactionFilter + Send + Sync>>,
    merge_operator: Option<Arc<dyn MergeOperator + Send + Sync>>,
    range_del: Arc<RangeDelAggregator>,

    enable_blob_files: bool,
    min_blob_size: u32,
    blob_writer: Option<BlobFileWriter>,

    stats: SubcompactionStats,
}

impl<'a> CompactionIterator<'a> {
    /// Wraps the merged input stream of one subcompaction
    pub fn new(
        inner: BoxedIterator<'a>,
        plan: &CompactionPlan,
        bottommost: bool,
        range_del: Arc<RangeDelAggregator>,
        blob_writer: Option<BlobFileWriter>,
    ) -> Self {
        Self {
            inner,
            peeked: None,
            pending: VecDeque::new(),
            failed: false,
            skip_until: None,

            snapshots: plan.snapshots.clone(),
            earliest_write_conflict_snapshot: plan.earliest_write_conflict_snapshot,
            bottommost,
            output_level: plan.output_level,
            enforce_single_delete_contracts: plan.enforce_single_delete_contracts,
            full_history_watermark: plan.full_history_watermark,

            filter: plan.compaction_filter.clone(),
            merge_operator: plan.merge_operator.clone(),
            range_del,

            enable_blob_files: plan.enable_blob_files,
            min_blob_size: plan.min_blob_size,
            blob_writer,

            stats: SubcompactionStats::default(),
        }
    }

    /// Gives back the blob file writer for finalization
    pub fn take_blob_writer(&mut self) -> Option<BlobFileWriter> {
        self.blob_writer.take()
    }

    /// Returns the counters collected so far
    #[must_use]
    pub fn stats(&self) -> &SubcompactionStats {
        &self.stats
    }

    fn stratum_of(&self, seqno: SeqNo) -> usize {
        visible_stratum(&self.snapshots, seqno)
    }

    fn next_input(&mut self) -> Option<crate::Result<Value>> {
        if let Some(peeked) = self.peeked.take() {
            Some(Ok(peeked))
        } else {
            self.inner.next()
        }
    }

    /// Reads all versions of the next user key, newest first
    ///
    /// Groups skipped over by `RemoveAndSkipUntil` are consumed here.
    fn read_group(&mut self) -> crate::Result<Option<Vec<Value>>> {
        loop {
            let Some(first) = self.next_input() else {
                return Ok(None);
            };
            let mut group = vec![first?];

            loop {
                match self.next_input() {
                    None => break,
                    Some(Err(e)) => return Err(e),
                    Some(Ok(next)) => {
                        // NOTE: Just pushed above, never empty
                        #[allow(clippy::expect_used)]
                        let last = group.last().expect("group is not empty");

                        if next.key == last.key {
                            let prev = (Reverse(last.seqno), Reverse(u8::from(last.value_type)));
                            let cur = (Reverse(next.seqno), Reverse(u8::from(next.value_type)));

                            if cur <= prev {
                                return Err(Error::InvalidArgument(format!(
                                    "non-ascending input stream at key {:?}",
                                    next.key,
                                )));
                            }

                            group.push(next);
                        } else if next.key < last.key {
                            return Err(Error::InvalidArgument(format!(
                                "non-ascending input stream at key {:?}",
                                next.key,
                            )));
                        } else {
                            self.peeked = Some(next);
                            break;
                        }
                    }
                }
            }

            self.stats.records_in += group.len() as u64;

            if let Some(target) = &self.skip_until {
                // NOTE: Just pushed above, never empty
                #[allow(clippy::expect_used)]
                let first = group.first().expect("group is not empty");

                if first.key < *target {
                    self.stats.dropped_filtered += group.len() as u64;
                    continue;
                }
            }
            self.skip_until = None;

            return Ok(Some(group));
        }
    }

    fn push_output(&mut self, item: Value) {
        self.stats.records_out += 1;
        self.pending.push_back(item);
    }

    /// Emits a value, extracting it into a blob file when configured
    fn emit_value(&mut self, mut item: Value) -> crate::Result<()> {
        if self.enable_blob_files
            && item.value_type == ValueType::Value
            && item.value.len() >= self.min_blob_size as usize
        {
            if let Some(writer) = &mut self.blob_writer {
                let idx = writer.add(&item.key, &item.value)?;

                self.stats.blob_bytes_written += item.value.len() as u64;

                item = Value {
                    key: item.key,
                    value: idx.encode(),
                    seqno: item.seqno,
                    value_type: ValueType::Indirection,
                };
            }
        }

        self.push_output(item);
        Ok(())
    }

    /// Runs the compaction filter over a plain value, then emits it
    fn emit_filtered_value(&mut self, mut item: Value) -> crate::Result<()> {
        let filter = self.filter.clone();

        if let Some(filter) = filter {
            match filter.filter(self.output_level, &item.key, &item.value) {
                Decision::Keep => {}
                Decision::Remove => {
                    self.stats.dropped_filtered += 1;
                    return Ok(());
                }
                Decision::ChangeValue(new_value) => {
                    item.value = new_value;
                }
                Decision::RemoveAndSkipUntil(target) => {
                    self.stats.dropped_filtered += 1;

                    // A skip target at or before the current key would
                    // make no forward progress
                    if target > item.key {
                        self.skip_until = Some(target);
                    }

                    return Ok(());
                }
            }
        }

        self.emit_value(item)
    }

    /// Resolves a chain of merge operands starting at `versions[i]`
    ///
    /// Operands never merge across a snapshot boundary; a partial
    /// result per stratum keeps older snapshots intact.
    fn process_merge_chain(
        &mut self,
        key: &UserKey,
        versions: &[Value],
        i: usize,
        stratum: usize,
    ) -> crate::Result<usize> {
        let n = versions.len();

        let mut j = i;
        while j < n {
            // NOTE: Index is bounded by the loop condition
            #[allow(clippy::expect_used)]
            let v = versions.get(j).expect("index is in bounds");

            if v.value_type != ValueType::Merge || self.stratum_of(v.seqno) != stratum {
                break;
            }
            j += 1;
        }

        let operand_count = (j - i) as u64;

        // Oldest-first, the order the merge operator applies them in
        let operands: Vec<UserValue> = versions[i..j].iter().rev().map(|v| v.value.clone()).collect();

        let operator = self.merge_operator.clone().ok_or_else(|| {
            Error::NotSupported(format!("merge operands for key {key:?} but no merge operator"))
        })?;

        // NOTE: j > i, the head of the chain is a merge operand
        #[allow(clippy::expect_used)]
        let newest_seqno = versions.get(i).expect("index is in bounds").seqno;

        let base = versions
            .get(j)
            .filter(|base| self.stratum_of(base.seqno) == stratum);

        if let Some(base) = base {
            let merged = match base.value_type {
                ValueType::Value => operator.full_merge(key, Some(&base.value), &operands),
                ValueType::Tombstone | ValueType::SingleTombstone => {
                    operator.full_merge(key, None, &operands)
                }
                ValueType::Indirection => {
                    return Err(Error::NotSupported(format!(
                        "merge against blob-extracted value for key {key:?}",
                    )));
                }
                // The operand loop above consumed all merges of this stratum
                ValueType::Merge => {
                    return Err(Error::Corruption(format!(
                        "unconsumed merge operand for key {key:?}",
                    )));
                }
            };

            let merged = merged.ok_or_else(|| {
                Error::Corruption(format!("merge operator failed for key {key:?}"))
            })?;

            self.stats.merged_records += operand_count;
            self.stats.dropped_hidden += 1;

            self.emit_value(Value {
                key: key.clone(),
                value: merged,
                seqno: newest_seqno,
                value_type: ValueType::Value,
            })?;

            return Ok(j + 1);
        }

        // No base value in this stratum
        if j == n && self.bottommost && stratum == 0 {
            // Nothing older exists anywhere: resolve with an empty base
            let merged = operator.full_merge(key, None, &operands).ok_or_else(|| {
                Error::Corruption(format!("merge operator failed for key {key:?}"))
            })?;

            self.stats.merged_records += operand_count;

            self.emit_value(Value {
                key: key.clone(),
                value: merged,
                seqno: newest_seqno,
                value_type: ValueType::Value,
            })?;
        } else if operand_count > 1 {
            if let Some(partial) = operator.partial_merge(key, &operands) {
                self.stats.merged_records += operand_count - 1;

                self.push_output(Value {
                    key: key.clone(),
                    value: partial,
                    seqno: newest_seqno,
                    value_type: ValueType::Merge,
                });
            } else {
                // Carry the operands through unmerged
                for v in &versions[i..j] {
                    self.push_output(v.clone());
                }
            }
        } else {
            // NOTE: operand_count == 1
            #[allow(clippy::expect_used)]
            self.push_output(versions.get(i).cloned().expect("index is in bounds"));
        }

        Ok(j)
    }

    /// Handles a single-delete marker at `versions[i]`
    fn process_single_delete(
        &mut self,
        key: &UserKey,
        versions: &[Value],
        i: usize,
        stratum: usize,
    ) -> crate::Result<usize> {
        // NOTE: Index is bounded by the caller
        #[allow(clippy::expect_used)]
        let marker = versions.get(i).cloned().expect("index is in bounds");

        let Some(next) = versions.get(i + 1) else {
            // No match in the inputs
            if self.bottommost {
                // Nothing below either: zero matches
                self.stats.single_delete_mismatches += 1;

                if self.enforce_single_delete_contracts {
                    return Err(Error::Corruption(format!(
                        "single delete without matching value for key {key:?}",
                    )));
                }

                self.stats.dropped_obsolete += 1;
            } else {
                // The match may live on a deeper level
                self.push_output(marker);
            }

            return Ok(i + 1);
        };

        match next.value_type {
            ValueType::Value | ValueType::Indirection => {
                let same_stratum = self.stratum_of(next.seqno) == stratum;

                if same_stratum && marker.seqno <= self.earliest_write_conflict_snapshot {
                    // Marker and value annihilate each other
                    self.stats.dropped_obsolete += 2;

                    let leftover_values = versions.get(i + 2..).unwrap_or_default().iter().any(|v| {
                        matches!(
                            v.value_type,
                            ValueType::Value | ValueType::Indirection | ValueType::Merge
                        )
                    });

                    if leftover_values {
                        self.stats.single_delete_mismatches += 1;

                        if self.enforce_single_delete_contracts {
                            return Err(Error::Corruption(format!(
                                "single delete met more than one value for key {key:?}",
                            )));
                        }
                    }

                    Ok(i + 2)
                } else {
                    // A snapshot or conflict check still needs the value
                    self.stats.single_delete_fallthroughs += 1;
                    self.push_output(marker);
                    Ok(i + 1)
                }
            }
            ValueType::Tombstone | ValueType::SingleTombstone | ValueType::Merge => {
                self.stats.single_delete_mismatches += 1;

                if self.enforce_single_delete_contracts {
                    return Err(Error::Corruption(format!(
                        "single delete met {:?} for key {key:?}",
                        next.value_type,
                    )));
                }

                self.push_output(marker);
                Ok(i + 1)
            }
        }
    }

    fn process_group(&mut self, mut versions: Vec<Value>) -> crate::Result<()> {
        let Some(first) = versions.first() else {
            return Ok(());
        };
        let key = first.key.clone();

        // Below the watermark, snapshots no longer pin old versions
        if let Some(watermark) = self.full_history_watermark {
            if first.seqno < watermark && versions.len() > 1 {
                self.stats.dropped_hidden += (versions.len() - 1) as u64;
                versions.truncate(1);
            }
        }

        let n = versions.len();
        let mut i = 0;

        // Stratum that already has its visible version decided
        let mut emitted_stratum: Option<usize> = None;

        // Set once a tombstone was garbage-collected; everything below
        // it is unobservable
        let mut group_obsolete = false;

        while i < n {
            // NOTE: Index is bounded by the loop condition
            #[allow(clippy::expect_used)]
            let v = versions.get(i).expect("index is in bounds");
            let stratum = self.stratum_of(v.seqno);

            if group_obsolete {
                self.stats.dropped_obsolete += 1;
                i += 1;
                continue;
            }

            if emitted_stratum == Some(stratum) {
                if v.is_tombstone() && !self.bottommost {
                    // Keep shadowed deletion markers above the
                    // bottommost level; deeper levels may still hold
                    // matching data that must not resurface
                    let v = v.clone();
                    self.push_output(v);
                } else {
                    self.stats.dropped_hidden += 1;
                }
                i += 1;
                continue;
            }

            // v is the newest version of its stratum
            if self.range_del.covers(&key, v.seqno) {
                self.stats.dropped_covered += 1;
                emitted_stratum = Some(stratum);
                i += 1;
                continue;
            }

            match v.value_type {
                ValueType::Merge => {
                    i = self.process_merge_chain(&key, &versions, i, stratum)?;
                    emitted_stratum = Some(stratum);
                }
                ValueType::Value => {
                    let v = v.clone();
                    self.emit_filtered_value(v)?;
                    emitted_stratum = Some(stratum);
                    i += 1;

                    if self.skip_until.is_some() {
                        // The filter asked to fast-forward; drop the
                        // older versions of this key as well
                        self.stats.dropped_filtered += (n - i) as u64;
                        return Ok(());
                    }
                }
                ValueType::Indirection => {
                    let v = v.clone();
                    self.push_output(v);
                    emitted_stratum = Some(stratum);
                    i += 1;
                }
                ValueType::Tombstone => {
                    if self.bottommost && stratum == 0 {
                        // No snapshot is older than the tombstone and
                        // no data exists below: its effect is complete
                        self.stats.dropped_obsolete += 1;
                        group_obsolete = true;
                    } else {
                        let v = v.clone();
                        self.push_output(v);
                    }
                    emitted_stratum = Some(stratum);
                    i += 1;
                }
                ValueType::SingleTombstone => {
                    i = self.process_single_delete(&key, &versions, i, stratum)?;
                    emitted_stratum = Some(stratum);
                }
            }
        }

        Ok(())
    }
}

impl<'a> Iterator for CompactionIterator<'a> {
    type Item = crate::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }

            if self.failed {
                return None;
            }

            match self.read_group() {
                Ok(None) => return None,
                Ok(Some(group)) => {
                    if let Err(e) = self.process_group(group) {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::{CompactionPlan, InputLevel};
    use test_log::test;

    fn plan() -> CompactionPlan {
        CompactionPlan::new(
            vec![InputLevel {
                level: 0,
                segments: Vec::new(),
            }],
            0,
            1,
        )
    }

    fn run(
        items: Vec<Value>,
        plan: &CompactionPlan,
        bottommost: bool,
    ) -> (crate::Result<Vec<Value>>, SubcompactionStats) {
        let range_del = Arc::new(RangeDelAggregator::new(plan.snapshots.clone(), bottommost));
        run_with_range_del(items, plan, bottommost, range_del)
    }

    fn run_with_range_del(
        items: Vec<Value>,
        plan: &CompactionPlan,
        bottommost: bool,
        range_del: Arc<RangeDelAggregator>,
    ) -> (crate::Result<Vec<Value>>, SubcompactionStats) {
        let inner = Box::new(items.into_iter().map(Ok)) as BoxedIterator<'static>;

        let mut iter = CompactionIterator::new(inner, plan, bottommost, range_del, None);
        let result = iter.by_ref().collect::<crate::Result<Vec<_>>>();
        let stats = iter.stats().clone();

        (result, stats)
    }

    fn v(key: &[u8], value: &[u8], seqno: SeqNo) -> Value {
        Value::new(key, value, seqno, ValueType::Value)
    }

    fn del(key: &[u8], seqno: SeqNo) -> Value {
        Value::new(key, *b"", seqno, ValueType::Tombstone)
    }

    #[test]
    fn test_hidden_versions_are_dropped() -> crate::Result<()> {
        // Merged stream of L0 {a@5, c@4}, {b@6} and L1 {a@2, b@1}
        let items = vec![
            v(b"a", b"V1", 5),
            v(b"a", b"V0", 2),
            v(b"b", b"V3", 6),
            v(b"b", b"Vold", 1),
            v(b"c", b"V2", 4),
        ];

        let (result, stats) = run(items, &plan(), false);
        let result = result?;

        assert_eq!(
            vec![v(b"a", b"V1", 5), v(b"b", b"V3", 6), v(b"c", b"V2", 4)],
            result
        );
        assert_eq!(5, stats.records_in);
        assert_eq!(3, stats.records_out);
        assert_eq!(2, stats.dropped_hidden);

        Ok(())
    }

    #[test]
    fn test_tombstone_gc_at_bottommost() -> crate::Result<()> {
        let items = vec![del(b"k", 10), v(b"k", b"V", 3)];

        let (result, stats) = run(items, &plan(), true);

        assert!(result?.is_empty());
        assert_eq!(2, stats.records_in);
        assert_eq!(0, stats.records_out);
        assert_eq!(2, stats.dropped_obsolete);

        Ok(())
    }

    #[test]
    fn test_tombstone_kept_above_bottommost() -> crate::Result<()> {
        let items = vec![del(b"k", 10), v(b"k", b"V", 3)];

        let (result, stats) = run(items, &plan(), false);

        // The tombstone must keep shadowing deeper levels
        assert_eq!(vec![del(b"k", 10)], result?);
        assert_eq!(1, stats.dropped_hidden);

        Ok(())
    }

    #[test]
    fn test_snapshot_retention() -> crate::Result<()> {
        let items = vec![v(b"k", b"V2", 10), v(b"k", b"V1", 5), del(b"k", 2)];

        let plan = plan().snapshots(vec![6]);
        let (result, stats) = run(items, &plan, false);

        // V1 is the newest at snapshot 6; the shadowed tombstone stays
        // because deeper levels may hold older versions of k
        assert_eq!(
            vec![v(b"k", b"V2", 10), v(b"k", b"V1", 5), del(b"k", 2)],
            result?
        );
        assert_eq!(0, stats.dropped_hidden);

        Ok(())
    }

    #[test]
    fn test_snapshot_collapse_of_values() -> crate::Result<()> {
        let items = vec![v(b"k", b"V3", 10), v(b"k", b"V2", 5), v(b"k", b"V1", 4)];

        let plan = plan().snapshots(vec![6]);
        let (result, stats) = run(items, &plan, false);

        // V2 and V1 map to snapshot 6; only the newer of the two stays
        assert_eq!(vec![v(b"k", b"V3", 10), v(b"k", b"V2", 5)], result?);
        assert_eq!(1, stats.dropped_hidden);

        Ok(())
    }

    #[test]
    fn test_range_tombstone_covering() -> crate::Result<()> {
        let items = vec![
            v(b"a", b"V", 1),
            v(b"f", b"V", 1),
            v(b"m", b"V", 1),
            v(b"z", b"V", 1),
        ];

        let mut agg = RangeDelAggregator::new(vec![], true);
        agg.add_clipped(crate::range_tombstone::RangeTombstone::new(*b"a", *b"m", 8), None, None);
        agg.freeze();

        let (result, stats) = run_with_range_del(items, &plan(), true, Arc::new(agg));

        assert_eq!(vec![v(b"m", b"V", 1), v(b"z", b"V", 1)], result?);
        assert_eq!(2, stats.dropped_covered);

        Ok(())
    }

    #[test]
    fn test_merge_resolution_with_base() -> crate::Result<()> {
        struct Concat;

        impl MergeOperator for Concat {
            fn name(&self) -> &str {
                "concat"
            }

            fn full_merge(
                &self,
                _key: &[u8],
                base: Option<&[u8]>,
                operands: &[UserValue],
            ) -> Option<UserValue> {
                let mut out = base.map(<[u8]>::to_vec).unwrap_or_default();
                for op in operands {
                    out.extend_from_slice(op);
                }
                Some(out.into())
            }
        }

        let items = vec![
            Value::new(*b"k", *b"+c", 5, ValueType::Merge),
            Value::new(*b"k", *b"+b", 4, ValueType::Merge),
            v(b"k", b"a", 2),
        ];

        let plan = plan().merge_operator(Arc::new(Concat));
        let (result, stats) = run(items, &plan, false);

        // Operands apply oldest-first on top of the base
        assert_eq!(vec![v(b"k", b"a+b+c", 5)], result?);
        assert_eq!(2, stats.merged_records);

        Ok(())
    }

    #[test]
    fn test_merge_not_resolved_across_snapshot() -> crate::Result<()> {
        struct Concat;

        impl MergeOperator for Concat {
            fn name(&self) -> &str {
                "concat"
            }

            fn full_merge(
                &self,
                _key: &[u8],
                base: Option<&[u8]>,
                operands: &[UserValue],
            ) -> Option<UserValue> {
                let mut out = base.map(<[u8]>::to_vec).unwrap_or_default();
                for op in operands {
                    out.extend_from_slice(op);
                }
                Some(out.into())
            }
        }

        let items = vec![
            Value::new(*b"k", *b"+c", 9, ValueType::Merge),
            v(b"k", b"a", 2),
        ];

        // Snapshot 5 must keep seeing the bare base value
        let plan = plan().snapshots(vec![5]).merge_operator(Arc::new(Concat));
        let (result, _) = run(items, &plan, false);
        let result = result?;

        assert_eq!(
            vec![
                Value::new(*b"k", *b"+c", 9, ValueType::Merge),
                v(b"k", b"a", 2),
            ],
            result
        );

        Ok(())
    }

    #[test]
    fn test_merge_without_operator_fails() {
        let items = vec![Value::new(*b"k", *b"+a", 5, ValueType::Merge)];

        let (result, _) = run(items, &plan(), true);

        assert!(matches!(result, Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_single_delete_annihilation() -> crate::Result<()> {
        let items = vec![
            Value::new(*b"k", *b"", 9, ValueType::SingleTombstone),
            v(b"k", b"V", 8),
        ];

        let (result, stats) = run(items, &plan(), false);

        assert!(result?.is_empty());
        assert_eq!(2, stats.dropped_obsolete);
        assert_eq!(0, stats.single_delete_mismatches);

        Ok(())
    }

    #[test]
    fn test_single_delete_mismatch_fails_when_enforced() {
        let items = vec![
            Value::new(*b"k", *b"", 9, ValueType::SingleTombstone),
            v(b"k", b"V", 8),
            v(b"k", b"V", 5),
        ];

        let mut plan = plan();
        plan.enforce_single_delete_contracts = true;

        let (result, _) = run(items, &plan, false);

        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_single_delete_fallthrough_on_snapshot() -> crate::Result<()> {
        let items = vec![
            Value::new(*b"k", *b"", 9, ValueType::SingleTombstone),
            v(b"k", b"V", 3),
        ];

        // Snapshot 5 pins the value
        let plan = plan().snapshots(vec![5]);
        let (result, stats) = run(items, &plan, false);
        let result = result?;

        assert_eq!(2, result.len());
        assert_eq!(1, stats.single_delete_fallthroughs);

        Ok(())
    }

    #[test]
    fn test_full_history_watermark_collapses() -> crate::Result<()> {
        let items = vec![v(b"k", b"V2", 5), v(b"k", b"V1", 3)];

        // Snapshot 4 would normally pin V1
        let mut plan = plan().snapshots(vec![4]);
        plan.full_history_watermark = Some(10);

        let (result, stats) = run(items, &plan, false);

        assert_eq!(vec![v(b"k", b"V2", 5)], result?);
        assert_eq!(1, stats.dropped_hidden);

        Ok(())
    }

    #[test]
    fn test_filter_remove_and_skip() -> crate::Result<()> {
        struct DropPrefixA;

        impl CompactionFilter for DropPrefixA {
            fn name(&self) -> &str {
                "drop-prefix-a"
            }

            fn filter(&self, _level: u8, key: &[u8], _value: &[u8]) -> Decision {
                if key.starts_with(b"a") {
                    Decision::RemoveAndSkipUntil((*b"b").into())
                } else {
                    Decision::Keep
                }
            }
        }

        let items = vec![
            v(b"a1", b"x", 1),
            v(b"a2", b"x", 1),
            v(b"a3", b"x", 1),
            v(b"b1", b"x", 1),
        ];

        let plan = plan().compaction_filter(Arc::new(DropPrefixA));
        let (result, stats) = run(items, &plan, false);

        assert_eq!(vec![v(b"b1", b"x", 1)], result?);
        assert_eq!(3, stats.dropped_filtered);

        Ok(())
    }

    #[test]
    fn test_error_is_terminal() {
        let items: Vec<crate::Result<Value>> = vec![
            Ok(v(b"a", b"x", 1)),
            Err(Error::Corruption("boom".into())),
            Ok(v(b"b", b"x", 1)),
        ];

        let inner = Box::new(items.into_iter()) as BoxedIterator<'static>;
        let plan = plan();
        let range_del = Arc::new(RangeDelAggregator::new(vec![], false));

        let mut iter = CompactionIterator::new(inner, &plan, false, range_del, None);

        assert!(matches!(iter.next(), Some(Err(Error::Corruption(_)))));
        assert!(iter.next().is_none());
    }
}

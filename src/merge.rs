use crate::{
    blob::BlobRefMeter,
    value::{SeqNo, UserKey, ValueType},
    Segment, Value,
};
use min_max_heap::MinMaxHeap;
use std::sync::Arc;

pub type BoxedIterator<'a> = Box<dyn Iterator<Item = crate::Result<Value>> + 'a>;

type IteratorIndex = usize;

#[derive(Debug)]
struct IteratorValue((IteratorIndex, Value));

impl std::ops::Deref for IteratorValue {
    type Target = Value;

    fn deref(&self) -> &Self::Target {
        &self.0 .1
    }
}

impl PartialEq for IteratorValue {
    fn eq(&self, other: &Self) -> bool {
        self.0 .1 == other.0 .1
    }
}
impl Eq for IteratorValue {}

impl PartialOrd for IteratorValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IteratorValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0 .1.cmp(&other.0 .1)
    }
}

/// This iterator can iterate through N iterators simultaneously in order
/// This is achieved by advancing the iterators that yield the lowest item
/// and merging using a simple k-way merge algorithm
///
/// Within one user key, versions come out newest first; deciding which
/// versions survive is the compaction iterator's job, not this one's.
#[allow(clippy::module_name_repetitions)]
pub struct MergeIterator<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: MinMaxHeap<IteratorValue>,
}

impl<'a> MergeIterator<'a> {
    /// Initializes a new merge iterator
    #[must_use]
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        Self {
            iterators,
            heap: MinMaxHeap::new(),
        }
    }

    /// Builds a merge iterator over full scans of the given segments
    #[must_use]
    pub fn from_segments(segments: &[Arc<Segment>]) -> MergeIterator<'a> {
        let mut iter_vec: Vec<BoxedIterator<'a>> = Vec::with_capacity(segments.len());

        for segment in segments {
            let iter = Box::new(segment.iter(false));
            iter_vec.push(iter);
        }

        MergeIterator::new(iter_vec)
    }

    fn advance_iter(&mut self, idx: usize) -> crate::Result<()> {
        // NOTE: Index comes off the heap, where only valid indexes are pushed
        #[allow(clippy::expect_used)]
        let iterator = self.iterators.get_mut(idx).expect("iter should exist");

        if let Some(value) = iterator.next() {
            self.heap.push(IteratorValue((idx, value?)));
        }

        Ok(())
    }

    fn push_next(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            self.advance_iter(idx)?;
        }

        Ok(())
    }
}

impl<'a> Iterator for MergeIterator<'a> {
    type Item = crate::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.heap.is_empty() {
            if let Err(e) = self.push_next() {
                return Some(Err(e));
            };
        }

        if let Some(head) = self.heap.pop_min() {
            let (iter_idx_consumed, _) = head.0;
            if let Err(e) = self.advance_iter(iter_idx_consumed) {
                return Some(Err(e));
            }

            return Some(Ok(head.0 .1));
        }

        None
    }
}

/// Enforces half-open `[start, end)` bounds on a sorted stream
///
/// Adjacent subcompactions share their boundary key; the half-open
/// semantics make sure it is processed by exactly one of them.
pub struct ClippingIter<'a> {
    inner: BoxedIterator<'a>,
    start: Option<UserKey>,
    end: Option<UserKey>,
    exhausted: bool,
}

impl<'a> ClippingIter<'a> {
    #[must_use]
    pub fn new(inner: BoxedIterator<'a>, start: Option<UserKey>, end: Option<UserKey>) -> Self {
        Self {
            inner,
            start,
            end,
            exhausted: false,
        }
    }
}

impl<'a> Iterator for ClippingIter<'a> {
    type Item = crate::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        loop {
            let item = match self.inner.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            if let Some(start) = &self.start {
                if item.key < *start {
                    continue;
                }
            }

            if let Some(end) = &self.end {
                if item.key >= *end {
                    self.exhausted = true;
                    return None;
                }
            }

            return Some(Ok(item));
        }
    }
}

/// Drops versions newer than the trim point before they reach the
/// compaction iterator
pub struct HistoryTrimmingIter<'a> {
    inner: BoxedIterator<'a>,
    trim_seqno: SeqNo,
}

impl<'a> HistoryTrimmingIter<'a> {
    #[must_use]
    pub fn new(inner: BoxedIterator<'a>, trim_seqno: SeqNo) -> Self {
        Self { inner, trim_seqno }
    }
}

impl<'a> Iterator for HistoryTrimmingIter<'a> {
    type Item = crate::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = match self.inner.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            if item.seqno > self.trim_seqno {
                continue;
            }

            return Some(Ok(item));
        }
    }
}

/// Counts blob references entering a subcompaction
///
/// Together with the per-output reference counts this yields the
/// garbage a compaction created in existing blob files.
pub struct BlobCountingIter<'a> {
    inner: BoxedIterator<'a>,
    meter: BlobRefMeter,
}

impl<'a> BlobCountingIter<'a> {
    #[must_use]
    pub fn new(inner: BoxedIterator<'a>, meter: BlobRefMeter) -> Self {
        Self { inner, meter }
    }
}

impl<'a> Iterator for BlobCountingIter<'a> {
    type Item = crate::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = match self.inner.next()? {
            Ok(item) => item,
            Err(e) => return Some(Err(e)),
        };

        if item.value_type == ValueType::Indirection {
            match crate::blob::BlobIndex::decode(&item.value) {
                Ok(idx) => self.meter.record(&idx),
                Err(_) => {
                    return Some(Err(crate::Error::Corruption(format!(
                        "malformed blob pointer under key {:?}",
                        item.key,
                    ))))
                }
            }
        }

        Some(Ok(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use test_log::test;

    fn v(key: &[u8], value: &[u8], seqno: SeqNo) -> Value {
        Value::new(key, value, seqno, ValueType::Value)
    }

    #[test]
    fn test_non_overlapping() -> crate::Result<()> {
        let iter0 = (0u64..5).map(|x| v(&x.to_be_bytes(), b"old", 0));
        let iter1 = (5u64..10).map(|x| v(&x.to_be_bytes(), b"new", 3));

        let iter0 = Box::new(iter0.map(Ok));
        let iter1 = Box::new(iter1.map(Ok));

        let merge_iter = MergeIterator::new(vec![iter0, iter1]);

        for (idx, item) in merge_iter.enumerate() {
            let item = item?;
            assert_eq!(item.key, (idx as u64).to_be_bytes().into());
        }

        Ok(())
    }

    #[test]
    fn test_versions_come_out_newest_first() -> crate::Result<()> {
        let vec0 = vec![v(b"a", b"old", 0), v(b"b", b"old", 0)];
        let vec1 = vec![v(b"a", b"new", 1), v(b"b", b"new", 1)];

        let iter0 = Box::new(vec0.iter().cloned().map(Ok)) as BoxedIterator<'_>;
        let iter1 = Box::new(vec1.iter().cloned().map(Ok)) as BoxedIterator<'_>;

        let merge_iter = MergeIterator::new(vec![iter0, iter1]);
        let items = merge_iter.collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(
            items,
            vec![
                v(b"a", b"new", 1),
                v(b"a", b"old", 0),
                v(b"b", b"new", 1),
                v(b"b", b"old", 0),
            ]
        );

        Ok(())
    }

    #[test]
    fn test_clipping() -> crate::Result<()> {
        let items = vec![
            v(b"a", b"", 0),
            v(b"b", b"", 0),
            v(b"c", b"", 0),
            v(b"d", b"", 0),
        ];

        let inner = Box::new(items.iter().cloned().map(Ok)) as BoxedIterator<'_>;

        let clipped = ClippingIter::new(inner, Some((*b"b").into()), Some((*b"d").into()));
        let keys: Vec<_> = clipped
            .collect::<crate::Result<Vec<_>>>()?
            .into_iter()
            .map(|item| item.key)
            .collect();

        // Half-open: start inclusive, end exclusive
        assert_eq!(vec![UserKey::from(*b"b"), UserKey::from(*b"c")], keys);

        Ok(())
    }

    #[test]
    fn test_history_trimming() -> crate::Result<()> {
        let items = vec![v(b"a", b"3", 3), v(b"a", b"2", 2), v(b"a", b"1", 1)];

        let inner = Box::new(items.iter().cloned().map(Ok)) as BoxedIterator<'_>;

        let trimmed = HistoryTrimmingIter::new(inner, 2);
        let seqnos: Vec<_> = trimmed
            .collect::<crate::Result<Vec<_>>>()?
            .into_iter()
            .map(|item| item.seqno)
            .collect();

        assert_eq!(vec![2, 1], seqnos);

        Ok(())
    }

    #[test]
    fn test_blob_counting() -> crate::Result<()> {
        use crate::blob::BlobIndex;

        let ptr = BlobIndex {
            blob_file: 4,
            offset: 0,
            len: 100,
        };

        let items = vec![
            Value::new(*b"a", ptr.encode(), 1, ValueType::Indirection),
            v(b"b", b"inline", 1),
        ];

        let inner = Box::new(items.iter().cloned().map(Ok)) as BoxedIterator<'_>;

        let meter = BlobRefMeter::default();
        let counted = BlobCountingIter::new(inner, meter.clone());
        assert_eq!(2, counted.count());

        let snapshot = meter.snapshot();
        let stats = snapshot.get(&4).copied().unwrap_or_default();
        assert_eq!(1, stats.count);
        assert_eq!(100, stats.bytes);

        Ok(())
    }
}

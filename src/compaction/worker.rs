use super::{
    iterator::CompactionIterator, range_del::RangeDelAggregator, stats::SubcompactionStats,
    CompactionPlan,
};
use crate::{
    blob::{BlobFileMeta, BlobFileWriter, BlobGarbage, BlobRefMeter},
    events,
    id::FileNumberAllocator,
    merge::{BlobCountingIter, BoxedIterator, ClippingIter, HistoryTrimmingIter, MergeIterator},
    segment::{
        meta::Metadata,
        writer::{Options as WriterOptions, WriteLifetimeHint, Writer},
    },
    stop_signal::StopSignal,
    value::UserKey,
    Error, Segment, StopReason, Value,
};
use serde_json::json;
use std::{ops::Bound, path::PathBuf, sync::Arc, time::Instant};

/// Everything a subcompaction worker needs; shared immutably between
/// all workers of one job
pub(crate) struct WorkerEnv {
    pub plan: Arc<CompactionPlan>,
    pub bottommost: bool,
    pub write_hint: WriteLifetimeHint,
    pub segment_folder: PathBuf,
    pub blob_folder: PathBuf,
    pub block_size: u32,
    pub file_numbers: FileNumberAllocator,
    pub stop_signal: StopSignal,
    pub manual_cancel: StopSignal,
    pub closing: StopSignal,
    pub job_id: u64,

    /// Largest keys of TTL-flagged input files, ascending; outputs are
    /// cut when the key stream passes one of them
    pub ttl_cut_keys: Vec<UserKey>,

    /// Files at `output_level + 1` overlapping the compaction, in key
    /// order; used to bound future write amplification
    pub grandparents: Vec<Arc<Segment>>,
}

/// State owned by one subcompaction
///
/// Workers receive exclusive mutable access; the job aggregates after
/// joining all threads.
pub struct SubcompactionState {
    /// Index of this subcompaction within the job
    pub sub_id: u32,

    /// Key range `[start, end)` this worker owns; `None` = unbounded
    pub bounds: (Option<UserKey>, Option<UserKey>),

    /// Finished output files, in key order
    pub outputs: Vec<Metadata>,

    /// Finished blob files
    pub blob_files: Vec<BlobFileMeta>,

    /// Garbage this worker discovered in pre-existing blob files
    pub blob_garbage: BlobGarbage,

    /// First error of the worker; later errors are suppressed
    pub status: crate::Result<()>,

    /// Statistics collected for this subcompaction
    pub stats: SubcompactionStats,
}

impl SubcompactionState {
    pub(crate) fn new(sub_id: u32, bounds: (Option<UserKey>, Option<UserKey>)) -> Self {
        Self {
            sub_id,
            bounds,
            outputs: Vec::new(),
            blob_files: Vec::new(),
            blob_garbage: BlobGarbage::new(),
            status: Ok(()),
            stats: SubcompactionStats::default(),
        }
    }
}

/// Runs one subcompaction to completion, recording status and stats
pub(crate) fn run_subcompaction(env: &WorkerEnv, state: &mut SubcompactionState) {
    let start_time = Instant::now();

    events::emit(&json!({
        "type": "subcompaction_begin",
        "job_id": env.job_id,
        "sub_id": state.sub_id,
        "start": state.bounds.0.as_deref().map(hex_key),
        "end": state.bounds.1.as_deref().map(hex_key),
    }));

    if let Err(e) = process(env, state) {
        log::debug!(
            "compactor: subcompaction {} of job {} stopped: {e:?}",
            state.sub_id,
            env.job_id,
        );
        state.status = Err(e);
    }

    // NOTE: Truncation is fine, compactions don't run for 500k years
    #[allow(clippy::cast_possible_truncation)]
    {
        state.stats.micros = start_time.elapsed().as_micros() as u64;
    }

    events::emit(&json!({
        "type": "subcompaction_completed",
        "job_id": env.job_id,
        "sub_id": state.sub_id,
        "ok": state.status.is_ok(),
        "outputs": state.outputs.len(),
        "records_in": state.stats.records_in,
        "records_out": state.stats.records_out,
        "micros": state.stats.micros,
    }));
}

fn hex_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

fn bounds_for_overlap(
    start: Option<&UserKey>,
    end: Option<&UserKey>,
) -> (Bound<UserKey>, Bound<UserKey>) {
    (
        start.map_or(Bound::Unbounded, |key| Bound::Included(key.clone())),
        end.map_or(Bound::Unbounded, |key| Bound::Excluded(key.clone())),
    )
}

fn process(env: &WorkerEnv, state: &mut SubcompactionState) -> crate::Result<()> {
    let (start, end) = (state.bounds.0.clone(), state.bounds.1.clone());
    let overlap_bounds = bounds_for_overlap(start.as_ref(), end.as_ref());

    // Gather the range tombstones of all inputs, clipped to our bounds
    let mut range_del = RangeDelAggregator::new(env.plan.snapshots.clone(), env.bottommost);

    for segment in env.plan.all_segments() {
        if segment.metadata.range_tombstone_count == 0 {
            continue;
        }

        for tombstone in segment.range_tombstones()? {
            range_del.add_clipped(tombstone, start.as_ref(), end.as_ref());
        }
    }

    range_del.freeze();
    let range_del = Arc::new(range_del);

    // Layer the input pipeline: merge -> clip -> blob counting -> trim
    let mut iters: Vec<BoxedIterator<'_>> = Vec::new();

    for segment in env.plan.all_segments() {
        if !segment.check_key_range_overlap(&overlap_bounds) {
            continue;
        }

        iters.push(Box::new(segment.iter(false)));
    }

    let mut input: BoxedIterator<'_> = Box::new(MergeIterator::new(iters));
    input = Box::new(ClippingIter::new(input, start.clone(), end.clone()));

    let blob_meter = BlobRefMeter::default();
    let has_blob_inputs = env
        .plan
        .all_segments()
        .any(|segment| segment.metadata.oldest_blob_file.is_some());

    if has_blob_inputs {
        input = Box::new(BlobCountingIter::new(input, blob_meter.clone()));
    }

    if let Some(trim_seqno) = env.plan.trim_seqno {
        input = Box::new(HistoryTrimmingIter::new(input, trim_seqno));
    }

    let blob_writer = env.plan.enable_blob_files.then(|| {
        BlobFileWriter::new(
            env.blob_folder.clone(),
            env.file_numbers.clone(),
            env.plan.blob_file_target_size,
        )
    });

    let mut iter = CompactionIterator::new(
        input,
        &env.plan,
        env.bottommost,
        Arc::clone(&range_del),
        blob_writer,
    );

    let mut outputs = OutputSet::new(env, end.clone(), Arc::clone(&range_del));

    let run_result = (|| -> crate::Result<()> {
        for item in iter.by_ref() {
            // Cancellation is observed once per emitted key
            if env.stop_signal.is_stopped() {
                return Err(Error::Stopped(StopReason::Shutdown));
            }
            if env.closing.is_stopped() {
                return Err(Error::Stopped(StopReason::Closed));
            }
            if env.manual_cancel.is_stopped() {
                return Err(Error::Stopped(StopReason::ManualPause));
            }

            outputs.write(item?)?;
        }

        Ok(())
    })();

    state.stats.merge(iter.stats());
    let blob_writer = iter.take_blob_writer();

    match run_result {
        Ok(()) => {
            outputs.finish(&mut state.outputs)?;

            if let Some(blob_writer) = blob_writer {
                state.blob_files = blob_writer.finish()?;
            }

            state.stats.bytes_written +=
                state.outputs.iter().map(|meta| meta.file_size).sum::<u64>();

            account_blob_garbage(state, &blob_meter);

            Ok(())
        }
        Err(e) => {
            if e.is_stopped() {
                // A canceled worker still seals what it has; cleanup
                // removes the files if the job is not installed
                outputs.finish(&mut state.outputs).ok();
            } else {
                outputs.abort();

                // Already-sealed outputs become orphans; track them so
                // cleanup can delete their files
                state.outputs.append(&mut outputs.results);
            }

            if let Some(blob_writer) = blob_writer {
                blob_writer.abandon();
            }

            Err(e)
        }
    }
}

/// Garbage per blob file = references that flowed in minus references
/// that survived into the outputs
fn account_blob_garbage(state: &mut SubcompactionState, meter: &BlobRefMeter) {
    for (blob_file, inflow) in meter.snapshot() {
        let mut surviving_count = 0u64;
        let mut surviving_bytes = 0u64;

        for output in &state.outputs {
            if let Some(stats) = output.blob_refs.get(&blob_file) {
                surviving_count += stats.count;
                surviving_bytes += stats.bytes;
            }
        }

        let count = inflow.count.saturating_sub(surviving_count);
        let bytes = inflow.bytes.saturating_sub(surviving_bytes);

        if count > 0 || bytes > 0 {
            let entry = state.blob_garbage.entry(blob_file).or_default();
            entry.count += count;
            entry.bytes += bytes;
        }
    }
}

/// Streams the retained key/value pairs into a sequence of output
/// files, rotating at safe cut points
///
/// A cut is safe only at a user key change, so all versions of one
/// key stay in one file. Size cuts are disabled for L0 outputs, whose
/// files may overlap anyway.
struct OutputSet<'a> {
    env: &'a WorkerEnv,
    upper_bound: Option<UserKey>,
    range_del: Arc<RangeDelAggregator>,

    writer: Option<Writer>,
    results: Vec<Metadata>,

    /// Everything below this cursor has been assigned to a sealed
    /// output; `None` = subcompaction start
    lower_cursor: Option<UserKey>,

    pending_size_cut: bool,
    last_user_key: Option<UserKey>,

    ttl_cut_idx: usize,
    grandparent_idx: usize,
    grandparent_overlap: u64,
}

impl<'a> OutputSet<'a> {
    fn new(
        env: &'a WorkerEnv,
        upper_bound: Option<UserKey>,
        range_del: Arc<RangeDelAggregator>,
    ) -> Self {
        Self {
            env,
            lower_cursor: None,
            upper_bound,
            range_del,
            writer: None,
            results: Vec::new(),
            pending_size_cut: false,
            last_user_key: None,
            ttl_cut_idx: 0,
            grandparent_idx: 0,
            grandparent_overlap: 0,
        }
    }

    fn open(&mut self) -> crate::Result<()> {
        let file_number = self.env.file_numbers.next();

        let writer = Writer::new(
            file_number,
            WriterOptions {
                folder: self.env.segment_folder.clone(),
                block_size: self.env.block_size,
                compression: self.env.plan.output_compression,
                temperature: self.env.plan.output_temperature,
                write_hint: self.env.write_hint,
                preallocate_bytes: self.env.plan.max_output_file_size,
            },
        )?;

        self.grandparent_overlap = 0;
        self.pending_size_cut = false;
        self.writer = Some(writer);

        Ok(())
    }

    /// Decides whether the current output must end before `key`
    fn should_cut_before(&mut self, key: &UserKey) -> bool {
        let mut cut = self.pending_size_cut && self.env.plan.output_level != 0;

        // Output ranges of TTL-flagged inputs are not extended past
        // their end, so re-compacting them stays cheap
        while self
            .env
            .ttl_cut_keys
            .get(self.ttl_cut_idx)
            .is_some_and(|cut_key| cut_key < key)
        {
            self.ttl_cut_idx += 1;
            cut = true;
        }

        // Bound the overlap with the grandparent level, which caps the
        // write amplification of the *next* compaction of this output
        while let Some(grandparent) = self.env.grandparents.get(self.grandparent_idx) {
            if grandparent.metadata.key_range.1 >= *key {
                break;
            }

            self.grandparent_overlap += grandparent.metadata.file_size;
            self.grandparent_idx += 1;
        }

        if self.grandparent_overlap > self.env.plan.max_grandparent_overlap_bytes {
            self.grandparent_overlap = 0;
            cut = true;
        }

        cut
    }

    fn write(&mut self, item: Value) -> crate::Result<()> {
        let key_changed = self.last_user_key.as_ref() != Some(&item.key);

        if key_changed && self.writer.is_some() && self.should_cut_before(&item.key) {
            self.seal(Some(&item.key))?;
        }

        self.last_user_key = Some(item.key.clone());

        let target_size = self.env.plan.max_output_file_size;

        if self.writer.is_none() {
            self.open()?;
        }

        // NOTE: Opened above
        #[allow(clippy::expect_used)]
        let writer = self.writer.as_mut().expect("writer was just opened");

        writer.write(item)?;

        if writer.file_pos >= target_size {
            // Cut at the next user key change, never inside a key
            self.pending_size_cut = true;
        }

        Ok(())
    }

    /// Seals the open output: assigns it the range tombstones between
    /// the cursor and `upper`, finishes the file, records metadata
    fn seal(&mut self, upper: Option<&UserKey>) -> crate::Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        for tombstone in self.range_del.for_output(self.lower_cursor.as_ref(), upper) {
            writer.add_range_tombstone(tombstone)?;
        }

        writer.finish()?;

        let oldest_ancestor_time = self.oldest_ancestor_time(&writer);

        let Some(metadata) = writer.into_metadata(oldest_ancestor_time) else {
            return Ok(());
        };

        events::emit(&json!({
            "type": "table_file_created",
            "job_id": self.env.job_id,
            "file_number": metadata.file_number,
            "file_size": metadata.file_size,
            "items": metadata.item_count,
            "range_tombstones": metadata.range_tombstone_count,
        }));

        self.lower_cursor = upper.cloned();
        self.results.push(metadata);

        Ok(())
    }

    /// Minimum `oldest_ancestor_time` over the input files overlapping
    /// this output's final key range; now if undefined
    fn oldest_ancestor_time(&self, writer: &Writer) -> u64 {
        let oldest = writer.key_range().and_then(|(lo, hi)| {
            let bounds = (Bound::Included(lo), Bound::Included(hi));

            self.env
                .plan
                .all_segments()
                .filter(|segment| segment.check_key_range_overlap(&bounds))
                .map(|segment| segment.metadata.oldest_ancestor_time)
                .filter(|time| *time > 0)
                .min()
        });

        oldest.unwrap_or_else(|| crate::time::unix_timestamp().as_secs())
    }

    /// Seals the last output; creates a dedicated file if only range
    /// tombstones remain
    fn finish(&mut self, out: &mut Vec<Metadata>) -> crate::Result<()> {
        if self.writer.is_some() {
            let upper = self.upper_bound.clone();
            self.seal(upper.as_ref())?;
        } else if self.results.is_empty() {
            let survivors = self
                .range_del
                .for_output(self.lower_cursor.as_ref(), self.upper_bound.as_ref());

            if !survivors.is_empty() {
                self.open()?;

                // NOTE: Writer is Some, assigned by open() above
                #[allow(clippy::expect_used)]
                let mut writer = self.writer.take().expect("writer was just created");

                for tombstone in survivors {
                    writer.add_range_tombstone(tombstone)?;
                }

                writer.finish()?;

                let oldest_ancestor_time = self.oldest_ancestor_time(&writer);

                if let Some(metadata) = writer.into_metadata(oldest_ancestor_time) {
                    self.results.push(metadata);
                }
            }
        }

        out.append(&mut self.results);
        Ok(())
    }

    /// Removes the partial output after a failure
    fn abort(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

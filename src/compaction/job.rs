use super::{
    install, planner,
    stats::JobStats,
    worker::{run_subcompaction, SubcompactionState, WorkerEnv},
    CompactionPlan,
};
use crate::{
    events,
    file::{blob_file_path, fsync_directory, segment_file_path, BLOBS_FOLDER},
    id::FileNumberAllocator,
    segment::{
        meta::{fold_content_hash, Metadata},
        writer::WriteLifetimeHint,
    },
    stop_signal::StopSignal,
    value::{SeqNo, UserKey},
    version::VersionSet,
    BlockCache, DescriptorTable, Error, Segment,
};
use serde_json::json;
use std::{
    cmp::Reverse,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, Mutex,
    },
    time::Instant,
};

/// Environment handles a compaction job runs against
pub struct JobOptions {
    /// Job id, used to tag event records
    pub job_id: u64,

    /// Version state, guarded by the engine mutex
    pub versions: Arc<Mutex<VersionSet>>,

    /// Open file descriptors of live segments
    pub descriptor_table: Arc<DescriptorTable>,

    /// Shared data block cache; verification reads warm it up
    pub block_cache: Arc<BlockCache>,

    /// Base folder containing the segment and blob folders
    pub base_folder: PathBuf,

    /// Block size for output segments
    pub block_size: u32,

    /// Engine-wide shutdown signal
    pub stop_signal: StopSignal,

    /// Cancellation signal for this (manual) compaction
    pub manual_cancel: StopSignal,

    /// Set when the owning keyspace is being closed or dropped
    pub closing: StopSignal,
}

impl JobOptions {
    /// Creates job options with default block size and fresh signals
    pub fn new<P: Into<PathBuf>>(
        job_id: u64,
        versions: Arc<Mutex<VersionSet>>,
        descriptor_table: Arc<DescriptorTable>,
        block_cache: Arc<BlockCache>,
        base_folder: P,
    ) -> Self {
        Self {
            job_id,
            versions,
            descriptor_table,
            block_cache,
            base_folder: base_folder.into(),
            block_size: 4_096,
            stop_signal: StopSignal::default(),
            manual_cancel: StopSignal::default(),
            closing: StopSignal::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum JobState {
    Created,
    Prepared,
    Running,
    Verified,
    Installed,
    Failed,
    Cleaned,
}

fn write_hint_for_level(output_level: u8, last_level: u8) -> WriteLifetimeHint {
    if output_level == 0 {
        WriteLifetimeHint::Medium
    } else if output_level >= last_level {
        WriteLifetimeHint::Extreme
    } else {
        WriteLifetimeHint::Long
    }
}

/// Plans, executes, verifies and installs one compaction
///
/// ```text
/// Created -> Prepared -> Running -> Verified -> Installed -> Cleaned
///                              \-> Failed ----------------> Cleaned
/// ```
///
/// `prepare` and `install` take the engine mutex internally; `run`
/// only takes it for the bounded size queries of boundary planning.
/// A job is not retryable: on failure, create a new one.
#[allow(clippy::module_name_repetitions)]
pub struct CompactionJob {
    opts: JobOptions,
    plan: Arc<CompactionPlan>,
    state: JobState,

    bottommost: bool,
    write_hint: WriteLifetimeHint,
    file_numbers: FileNumberAllocator,
    grandparents: Vec<Arc<Segment>>,
    ttl_cut_keys: Vec<UserKey>,

    subs: Vec<SubcompactionState>,
    job_stats: JobStats,
}

impl CompactionJob {
    /// Creates a new compaction job from the given plan and options.
    #[must_use]
    pub fn new(plan: CompactionPlan, opts: JobOptions) -> Self {
        Self {
            opts,
            plan: Arc::new(plan),
            state: JobState::Created,
            bottommost: false,
            write_hint: WriteLifetimeHint::default(),
            file_numbers: FileNumberAllocator::default(),
            grandparents: Vec::new(),
            ttl_cut_keys: Vec::new(),
            subs: Vec::new(),
            job_stats: JobStats::default(),
        }
    }

    fn segment_folder(&self) -> PathBuf {
        self.opts
            .base_folder
            .join(crate::file::SEGMENTS_FOLDER)
    }

    fn blob_folder(&self) -> PathBuf {
        self.opts.base_folder.join(BLOBS_FOLDER)
    }

    /// Returns the per-subcompaction states
    #[must_use]
    pub fn subcompactions(&self) -> &[SubcompactionState] {
        &self.subs
    }

    /// Returns the aggregated job counters; filled after [`CompactionJob::run`]
    #[must_use]
    pub fn stats(&self) -> &JobStats {
        &self.job_stats
    }

    /// Returns `true` if the compaction writes to the deepest level
    /// holding data for its key range
    #[must_use]
    pub fn is_bottommost(&self) -> bool {
        self.bottommost
    }

    /// Plans the job: computes the bottommost flag and write hint,
    /// pins the inputs, partitions the key space into subcompactions
    pub fn prepare(&mut self) -> crate::Result<()> {
        if self.state != JobState::Created {
            return Err(Error::InvalidArgument("job was already prepared".into()));
        }

        self.plan.validate()?;

        let Some((lo, hi)) = self.plan.key_range() else {
            return Err(Error::InvalidArgument(
                "input segments span no key range".into(),
            ));
        };

        {
            let mut versions = self.opts.versions.lock().expect("lock is poisoned");

            self.bottommost = versions.is_bottommost(self.plan.output_level, &lo, &hi);
            self.write_hint =
                write_hint_for_level(self.plan.output_level, versions.last_level_index());
            self.file_numbers = versions.file_number_allocator();

            if self.plan.output_level < versions.last_level_index() {
                self.grandparents =
                    versions.overlapping_segments(self.plan.output_level + 1, &lo, &hi);
            }

            versions.hide_segments(&self.plan.input_file_numbers());
        }

        let mut ttl_cut_keys: Vec<UserKey> = self
            .plan
            .all_segments()
            .filter(|segment| {
                self.plan
                    .files_to_cut_for_ttl
                    .contains(&segment.metadata.file_number)
            })
            .map(|segment| segment.metadata.key_range.1.clone())
            .collect();
        ttl_cut_keys.sort();
        ttl_cut_keys.dedup();
        self.ttl_cut_keys = ttl_cut_keys;

        // Takes and releases the version lock per size query
        let boundaries = planner::plan_boundaries(&self.opts.versions, &self.plan);

        let mut subs = Vec::with_capacity(boundaries.len() + 1);

        for i in 0..=boundaries.len() {
            let start = if i == 0 {
                None
            } else {
                boundaries.get(i - 1).cloned()
            };
            let end = boundaries.get(i).cloned();

            // NOTE: Truncation is fine, there are at most
            // max_subcompactions partitions
            #[allow(clippy::cast_possible_truncation)]
            subs.push(SubcompactionState::new(i as u32, (start, end)));
        }

        self.subs = subs;
        self.state = JobState::Prepared;

        log::debug!(
            "compactor: prepared job {} ({} subcompactions, bottommost: {})",
            self.opts.job_id,
            self.subs.len(),
            self.bottommost,
        );

        Ok(())
    }

    /// Executes all subcompactions, syncs the output directories and
    /// verifies every produced file by reading it back
    ///
    /// Must not be called while holding the engine mutex.
    pub fn run(&mut self) -> crate::Result<()> {
        if self.state != JobState::Prepared {
            return Err(Error::InvalidArgument("job was not prepared".into()));
        }
        self.state = JobState::Running;

        let start_time = Instant::now();

        events::emit(&json!({
            "type": "compaction_started",
            "job_id": self.opts.job_id,
            "start_level": self.plan.start_level,
            "output_level": self.plan.output_level,
            "bottommost": self.bottommost,
            "subcompactions": self.subs.len(),
            "inputs": self
                .plan
                .inputs
                .iter()
                .map(|input| json!({
                    "level": input.level,
                    "files": input
                        .segments
                        .iter()
                        .map(|s| s.metadata.file_number)
                        .collect::<Vec<_>>(),
                }))
                .collect::<Vec<_>>(),
            "input_bytes": self.plan.input_bytes(),
        }));

        let env = WorkerEnv {
            plan: Arc::clone(&self.plan),
            bottommost: self.bottommost,
            write_hint: self.write_hint,
            segment_folder: self.segment_folder(),
            blob_folder: self.blob_folder(),
            block_size: self.opts.block_size,
            file_numbers: self.file_numbers.clone(),
            stop_signal: self.opts.stop_signal.clone(),
            manual_cancel: self.opts.manual_cancel.clone(),
            closing: self.opts.closing.clone(),
            job_id: self.opts.job_id,
            ttl_cut_keys: self.ttl_cut_keys.clone(),
            grandparents: self.grandparents.clone(),
        };
        let env = &env;

        // One thread per subcompaction, with subcompaction 0 running
        // on the caller's thread
        std::thread::scope(|scope| {
            let mut iter = self.subs.iter_mut();

            // NOTE: prepare() always creates at least one subcompaction
            #[allow(clippy::expect_used)]
            let first = iter.next().expect("at least one subcompaction");

            let mut handles = Vec::new();

            for sub in iter {
                handles.push(scope.spawn(move || run_subcompaction(env, sub)));
            }

            run_subcompaction(env, first);

            for handle in handles {
                // NOTE: Worker threads report errors through their state
                #[allow(clippy::expect_used)]
                handle.join().expect("subcompaction thread panicked");
            }
        });

        // Aggregate counters before looking at errors, so failed jobs
        // still report what they did
        let mut job_stats = JobStats::default();

        for sub in &self.subs {
            job_stats.stats.merge(&sub.stats);
            job_stats.output_files += sub.outputs.len();
            job_stats.output_bytes += sub.outputs.iter().map(|m| m.file_size).sum::<u64>();
        }

        job_stats.input_files = self.plan.all_segments().count();
        job_stats.input_bytes = self.plan.input_bytes();

        // NOTE: Truncation is fine, compactions don't run for 500k years
        #[allow(clippy::cast_possible_truncation)]
        {
            job_stats.micros = start_time.elapsed().as_micros() as u64;
        }

        self.job_stats = job_stats;

        // First non-OK status wins
        let mut status: crate::Result<()> = Ok(());

        for sub in &mut self.subs {
            if status.is_ok() && sub.status.is_err() {
                status = std::mem::replace(&mut sub.status, Ok(()));
            }
        }

        if status.is_ok() {
            status = fsync_directory(self.segment_folder()).map_err(Error::from);
        }

        if status.is_ok() && self.subs.iter().any(|sub| !sub.blob_files.is_empty()) {
            status = fsync_directory(self.blob_folder()).map_err(Error::from);
        }

        if status.is_ok() {
            status = self.verify_outputs();
        }

        match status {
            Ok(()) => {
                self.state = JobState::Verified;

                log::debug!(
                    "compactor: job {} wrote {} files ({} records) in {}ms",
                    self.opts.job_id,
                    self.job_stats.output_files,
                    self.job_stats.stats.records_out,
                    self.job_stats.micros / 1_000,
                );

                Ok(())
            }
            Err(e) => {
                self.state = JobState::Failed;
                Err(e)
            }
        }
    }

    /// Reads back every produced file through the table cache,
    /// re-checking block checksums, key order and the content digest
    /// captured at build time
    ///
    /// Reads go through the block cache on purpose: freshly compacted
    /// data is what user reads will ask for next.
    fn verify_outputs(&self) -> crate::Result<()> {
        let files: Vec<&Metadata> = self.subs.iter().flat_map(|sub| sub.outputs.iter()).collect();

        if files.is_empty() {
            return Ok(());
        }

        let next_file_idx = AtomicUsize::new(0);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (1..self.subs.len())
                .map(|_| {
                    scope.spawn(|| {
                        verify_worker(&files, &next_file_idx, &first_error, &self.opts);
                    })
                })
                .collect();

            verify_worker(&files, &next_file_idx, &first_error, &self.opts);

            for handle in handles {
                // NOTE: Verification errors travel through first_error
                #[allow(clippy::expect_used)]
                handle.join().expect("verification thread panicked");
            }
        });

        let mut first_error = first_error.lock().expect("lock is poisoned");

        match first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Installs the results into the version state
    ///
    /// Builds one version edit from all subcompaction results and
    /// applies it atomically; afterwards, the input files are deleted.
    /// May be called at most once, and only after [`CompactionJob::run`]
    /// returned `Ok`.
    pub fn install(&mut self) -> crate::Result<()> {
        if self.state != JobState::Verified {
            return Err(Error::InvalidArgument(
                "job is not in an installable state".into(),
            ));
        }

        if let Err(e) = install::install_results(
            &self.opts.versions,
            &self.plan,
            &self.subs,
            &self.opts.descriptor_table,
            &self.opts.block_cache,
        ) {
            self.state = JobState::Failed;
            return Err(e);
        }

        // The manifest no longer references the inputs; their files
        // can go now
        let segment_folder = self.segment_folder();

        for segment in self.plan.all_segments() {
            let file_number = segment.metadata.file_number;
            let path = segment_file_path(&segment_folder, file_number);

            self.opts.descriptor_table.evict(file_number);

            if let Err(e) = std::fs::remove_file(&path) {
                log::error!("Failed to remove input segment {}: {e:?}", path.display());
            }

            events::emit(&json!({
                "type": "table_file_deleted",
                "job_id": self.opts.job_id,
                "file_number": file_number,
            }));
        }

        self.state = JobState::Installed;

        log::debug!("compactor: installed job {}", self.opts.job_id);

        Ok(())
    }

    /// Releases the pinned inputs and removes uninstalled outputs
    ///
    /// Must be called exactly once, whatever the job's outcome.
    pub fn cleanup(&mut self) {
        if self.state == JobState::Cleaned {
            return;
        }

        let installed = self.state == JobState::Installed;

        if !installed {
            let segment_folder = self.segment_folder();
            let blob_folder = self.blob_folder();

            for sub in &self.subs {
                for metadata in &sub.outputs {
                    let path = segment_file_path(&segment_folder, metadata.file_number);

                    self.opts.descriptor_table.evict(metadata.file_number);

                    if let Err(e) = std::fs::remove_file(&path) {
                        log::error!(
                            "Failed to remove orphaned output {}: {e:?}",
                            path.display()
                        );
                    }
                }

                for blob_file in &sub.blob_files {
                    let path = blob_file_path(&blob_folder, blob_file.file_number);

                    if let Err(e) = std::fs::remove_file(&path) {
                        log::error!(
                            "Failed to remove orphaned blob file {}: {e:?}",
                            path.display()
                        );
                    }
                }
            }
        }

        {
            let mut versions = self.opts.versions.lock().expect("lock is poisoned");
            versions.show_segments(&self.plan.input_file_numbers());
        }

        events::emit(&json!({
            "type": "compaction_finished",
            "job_id": self.opts.job_id,
            "installed": installed,
            "output_files": self.job_stats.output_files,
            "output_bytes": self.job_stats.output_bytes,
            "records_in": self.job_stats.stats.records_in,
            "records_out": self.job_stats.stats.records_out,
            "micros": self.job_stats.micros,
        }));

        self.state = JobState::Cleaned;
    }
}

impl Drop for CompactionJob {
    fn drop(&mut self) {
        // Forgetting cleanup leaks pinned inputs and orphan files
        debug_assert!(
            matches!(self.state, JobState::Cleaned | JobState::Created),
            "compaction job dropped without cleanup",
        );
    }
}

fn verify_worker(
    files: &[&Metadata],
    next_file_idx: &AtomicUsize,
    first_error: &Mutex<Option<Error>>,
    opts: &JobOptions,
) {
    loop {
        if first_error.lock().expect("lock is poisoned").is_some() {
            return;
        }

        let idx = next_file_idx.fetch_add(1, Relaxed);

        let Some(metadata) = files.get(idx) else {
            return;
        };

        if let Err(e) = verify_one(opts, metadata) {
            let mut slot = first_error.lock().expect("lock is poisoned");

            if slot.is_none() {
                *slot = Some(e);
            }

            return;
        }
    }
}

fn verify_one(opts: &JobOptions, metadata: &Metadata) -> crate::Result<()> {
    use std::hash::Hasher;

    let segment = Segment::open(
        (*metadata).clone(),
        opts.descriptor_table.clone(),
        opts.block_cache.clone(),
    )?;

    let mut hasher = seahash::SeaHasher::default();
    let mut item_count = 0u64;
    let mut last: Option<(UserKey, SeqNo, u8)> = None;

    for item in segment.iter(true).verify_checksums(true) {
        let item = item?;
        let tag = u8::from(item.value_type);

        if let Some((last_key, last_seqno, last_tag)) = &last {
            let prev = (last_key, Reverse(*last_seqno), Reverse(*last_tag));
            let cur = (&item.key, Reverse(item.seqno), Reverse(tag));

            if cur <= prev {
                return Err(Error::Corruption(format!(
                    "out-of-order entries in output segment {}",
                    metadata.file_number,
                )));
            }
        }
        last = Some((item.key.clone(), item.seqno, tag));

        fold_content_hash(&mut hasher, &item);
        item_count += 1;
    }

    if item_count != metadata.item_count {
        return Err(Error::Corruption(format!(
            "output segment {} has {item_count} entries, expected {}",
            metadata.file_number, metadata.item_count,
        )));
    }

    if hasher.finish() != metadata.content_hash {
        return Err(Error::Corruption(format!(
            "content digest mismatch in output segment {}",
            metadata.file_number,
        )));
    }

    Ok(())
}

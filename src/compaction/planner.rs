use super::CompactionPlan;
use crate::{value::UserKey, version::VersionSet};
use std::sync::{Arc, Mutex};

// A subcompaction is only worth scheduling once it covers this share
// of an output file
const MIN_FILE_FILL_PERCENT: f64 = 4.0 / 5.0;

/// Partitions the compaction's key space into at most
/// `max_subcompactions` contiguous ranges of roughly equal size
///
/// Returns the inner boundary keys; `n` boundaries mean `n + 1`
/// subcompactions. The version lock is taken per size query and
/// released in between, so a long planning phase does not stall
/// writers.
pub(crate) fn plan_boundaries(
    versions: &Arc<Mutex<VersionSet>>,
    plan: &CompactionPlan,
) -> Vec<UserKey> {
    if plan.max_subcompactions <= 1 {
        return Vec::new();
    }

    // Collect candidate boundary keys: L0 files may overlap arbitrarily,
    // so both bounds of every file count; inner levels only contribute
    // their level-wide bounds; the output level additionally contributes
    // each file's smallest key, since those boundaries align with the
    // existing partitioning
    let mut bounds: Vec<UserKey> = Vec::new();

    for input in &plan.inputs {
        if input.segments.is_empty() {
            continue;
        }

        if input.level == 0 {
            for segment in &input.segments {
                bounds.push(segment.metadata.key_range.0.clone());
                bounds.push(segment.metadata.key_range.1.clone());
            }
        } else {
            let mut segments = input.segments.clone();
            segments.sort_by(|a, b| a.metadata.key_range.0.cmp(&b.metadata.key_range.0));

            // NOTE: Emptiness is checked above
            #[allow(clippy::expect_used)]
            {
                bounds.push(
                    segments
                        .first()
                        .expect("level is not empty")
                        .metadata
                        .key_range
                        .0
                        .clone(),
                );
                bounds.push(
                    segments
                        .last()
                        .expect("level is not empty")
                        .metadata
                        .key_range
                        .1
                        .clone(),
                );
            }

            if input.level == plan.output_level {
                for segment in segments.iter().skip(1) {
                    bounds.push(segment.metadata.key_range.0.clone());
                }
            }
        }
    }

    bounds.sort();
    bounds.dedup();

    if bounds.len() < 2 {
        return Vec::new();
    }

    // Combine consecutive pairs of boundaries into ranges with an
    // approximate size of data covered by keys in that range
    let mut sum = 0u64;
    let mut ranges: Vec<(UserKey, u64)> = Vec::with_capacity(bounds.len() - 1);

    for window in bounds.windows(2) {
        let (a, b) = (&window[0], &window[1]);

        // Size queries walk the in-memory block indexes; take the
        // version lock per query only, to reduce contention
        let size = {
            let versions = versions.lock().expect("lock is poisoned");
            versions.approximate_size(a, b, plan.start_level, plan.output_level)
        };

        ranges.push((b.clone(), size));
        sum += size;
    }

    // NOTE: Ranges of less than 80% of an output file are not worth
    // their own thread; prefer fewer but larger subcompactions
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let max_output_files = (sum as f64 / MIN_FILE_FILL_PERCENT
        / plan.max_output_file_size.max(1) as f64)
        .ceil() as u64;

    let mut subcompactions = (ranges.len() as u64)
        .min(plan.max_subcompactions as u64)
        .min(max_output_files);

    let mut boundaries = Vec::new();

    if subcompactions > 1 {
        #[allow(clippy::cast_precision_loss)]
        let mean = sum as f64 / subcompactions as f64;

        // Greedily add ranges to the subcompaction until the sum of
        // the ranges' sizes becomes >= the expected mean size
        let mut acc = 0u64;

        for (i, (right, size)) in ranges.iter().enumerate() {
            if i + 1 == ranges.len() {
                // The last range is implicit
                break;
            }

            acc += size;

            if subcompactions == 1 {
                // The remaining ranges all go into the last
                // subcompaction; no more boundaries needed
                continue;
            }

            #[allow(clippy::cast_precision_loss)]
            if acc as f64 >= mean {
                boundaries.push(right.clone());
                subcompactions -= 1;
                acc = 0;
            }
        }
    }

    boundaries
}

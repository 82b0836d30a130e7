use super::{worker::SubcompactionState, CompactionPlan};
use crate::{
    version::{VersionEdit, VersionSet},
    BlockCache, DescriptorTable, Segment,
};
use std::sync::{Arc, Mutex};

/// Builds the version edit describing the whole compaction
///
/// Input deletions, output additions, blob file additions, blob
/// garbage deltas, and the round-robin cursor for the start level all
/// go into one edit; applying it is atomic.
pub(crate) fn build_edit(plan: &CompactionPlan, subs: &[SubcompactionState]) -> VersionEdit {
    let mut edit = VersionEdit::default();

    for input in &plan.inputs {
        for segment in &input.segments {
            edit.deleted_files
                .push((input.level, segment.metadata.file_number));
        }
    }

    for sub in subs {
        for metadata in &sub.outputs {
            edit.added_files.push((plan.output_level, metadata.clone()));
        }

        edit.added_blob_files.extend(sub.blob_files.iter().cloned());

        for (blob_file, garbage) in &sub.blob_garbage {
            let entry = edit.blob_garbage.entry(*blob_file).or_default();
            entry.count += garbage.count;
            entry.bytes += garbage.bytes;
        }
    }

    // The next round-robin compaction of the start level picks up
    // where this one ended
    edit.compaction_cursor = plan
        .inputs
        .iter()
        .filter(|input| input.level == plan.start_level)
        .flat_map(|input| input.segments.iter())
        .map(|segment| segment.metadata.key_range.1.clone())
        .max()
        .map(|key| (plan.start_level, key));

    edit
}

/// Applies the edit under the engine mutex
///
/// Output segments are opened (and their footers validated) before
/// the lock is taken; the lock only covers the in-memory swap and the
/// manifest write.
pub(crate) fn install_results(
    versions: &Arc<Mutex<VersionSet>>,
    plan: &CompactionPlan,
    subs: &[SubcompactionState],
    descriptor_table: &Arc<DescriptorTable>,
    block_cache: &Arc<BlockCache>,
) -> crate::Result<()> {
    let edit = build_edit(plan, subs);

    let mut new_segments = Vec::with_capacity(edit.added_files.len());

    for (_, metadata) in &edit.added_files {
        new_segments.push(Arc::new(Segment::open(
            metadata.clone(),
            descriptor_table.clone(),
            block_cache.clone(),
        )?));
    }

    let mut versions = versions.lock().expect("lock is poisoned");
    versions.log_and_apply(edit, new_segments)
}

use crate::{
    blob::{BlobFileMeta, BlobGarbage},
    segment::meta::Metadata,
    value::UserKey,
};

/// One atomic change to the version state
///
/// Built by the installer from the results of all subcompactions and
/// applied through [`super::VersionSet::log_and_apply`]; the manifest
/// rewrite is the single linearization point of a compaction.
#[derive(Debug, Default)]
pub struct VersionEdit {
    /// Files to remove, as (level, file number)
    pub deleted_files: Vec<(u8, u64)>,

    /// Files to add, as (level, metadata)
    pub added_files: Vec<(u8, Metadata)>,

    /// Newly written blob files
    pub added_blob_files: Vec<BlobFileMeta>,

    /// Garbage that this compaction discovered in existing blob files
    pub blob_garbage: BlobGarbage,

    /// Where the next round-robin compaction of this level should start
    pub compaction_cursor: Option<(u8, UserKey)>,
}

impl VersionEdit {
    /// Returns `true` if the edit changes nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deleted_files.is_empty()
            && self.added_files.is_empty()
            && self.added_blob_files.is_empty()
            && self.blob_garbage.is_empty()
            && self.compaction_cursor.is_none()
    }
}

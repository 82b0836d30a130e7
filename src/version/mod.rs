//! Version state: which segment lives on which level, plus the level
//! manifest that makes that assignment durable

pub mod edit;

pub use edit::VersionEdit;

use crate::{
    blob::BlobFileMeta,
    file::{rewrite_atomic, LEVELS_MANIFEST_FILE, SEGMENTS_FOLDER},
    id::FileNumberAllocator,
    segment::meta::{Metadata, CHECKSUM_SCHEME},
    value::UserKey,
    BlockCache, DescriptorTable, Error, Segment,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    ops::Bound,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Deserialize, Serialize)]
struct Manifest {
    checksum_scheme: String,
    next_file_number: u64,
    levels: Vec<Vec<Metadata>>,
    blob_files: Vec<BlobFileMeta>,
    compaction_cursors: BTreeMap<u8, UserKey>,
}

/// Tracks the set of live files per level
///
/// Guarded by the engine mutex; compaction `prepare` and `install`
/// run while holding it, the key/value loop never does.
pub struct VersionSet {
    folder: PathBuf,
    manifest_path: PathBuf,

    levels: Vec<Vec<Arc<Segment>>>,
    blob_files: BTreeMap<u64, BlobFileMeta>,

    /// Set of file numbers that are pinned by a running compaction
    ///
    /// While being consumed they will not be handed to another
    /// compaction, and they will not be deleted.
    hidden_set: HashSet<u64>,

    compaction_cursors: BTreeMap<u8, UserKey>,

    file_numbers: FileNumberAllocator,
    descriptor_table: Arc<DescriptorTable>,
    block_cache: Arc<BlockCache>,
}

impl VersionSet {
    /// Creates a fresh version state with `level_count` empty levels
    pub fn create_new<P: AsRef<Path>>(
        level_count: u8,
        folder: P,
        descriptor_table: Arc<DescriptorTable>,
        block_cache: Arc<BlockCache>,
    ) -> crate::Result<Self> {
        assert!(level_count > 0, "level_count should be >= 1");

        let folder = folder.as_ref().to_path_buf();
        std::fs::create_dir_all(folder.join(SEGMENTS_FOLDER))?;

        let mut version_set = Self {
            manifest_path: folder.join(LEVELS_MANIFEST_FILE),
            folder,
            levels: (0..level_count).map(|_| Vec::new()).collect(),
            blob_files: BTreeMap::new(),
            hidden_set: HashSet::with_capacity(10),
            compaction_cursors: BTreeMap::new(),
            file_numbers: FileNumberAllocator::new(1),
            descriptor_table,
            block_cache,
        };
        version_set.write_to_disk()?;

        Ok(version_set)
    }

    /// Recovers the version state from the manifest, re-opening all segments
    pub fn recover<P: AsRef<Path>>(
        folder: P,
        descriptor_table: Arc<DescriptorTable>,
        block_cache: Arc<BlockCache>,
    ) -> crate::Result<Self> {
        let folder = folder.as_ref().to_path_buf();
        let manifest_path = folder.join(LEVELS_MANIFEST_FILE);

        let manifest = std::fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = serde_json::from_str(&manifest)
            .map_err(|e| Error::Corruption(format!("malformed level manifest: {e}")))?;

        if manifest.checksum_scheme != CHECKSUM_SCHEME {
            return Err(Error::NotSupported(format!(
                "unknown checksum scheme {:?}",
                manifest.checksum_scheme,
            )));
        }

        let mut levels = Vec::with_capacity(manifest.levels.len());

        for level in manifest.levels {
            let mut segments = Vec::with_capacity(level.len());

            for metadata in level {
                segments.push(Arc::new(Segment::open(
                    metadata,
                    descriptor_table.clone(),
                    block_cache.clone(),
                )?));
            }

            levels.push(segments);
        }

        Ok(Self {
            manifest_path,
            folder,
            levels,
            blob_files: manifest
                .blob_files
                .into_iter()
                .map(|meta| (meta.file_number, meta))
                .collect(),
            hidden_set: HashSet::with_capacity(10),
            compaction_cursors: manifest.compaction_cursors,
            file_numbers: FileNumberAllocator::new(manifest.next_file_number),
            descriptor_table,
            block_cache,
        })
    }

    pub(crate) fn write_to_disk(&mut self) -> crate::Result<()> {
        log::trace!("Writing level manifest to {}", self.manifest_path.display());

        let manifest = Manifest {
            checksum_scheme: CHECKSUM_SCHEME.into(),
            next_file_number: self.file_numbers.peek(),
            levels: self
                .levels
                .iter()
                .map(|level| level.iter().map(|s| s.metadata.clone()).collect())
                .collect(),
            blob_files: self.blob_files.values().cloned().collect(),
            compaction_cursors: self.compaction_cursors.clone(),
        };

        // NOTE: Serialization can't fail here
        #[allow(clippy::expect_used)]
        let json = serde_json::to_string_pretty(&manifest).expect("should serialize");

        // NOTE: Compaction threads don't have concurrent access to the
        // manifest because it is behind a mutex
        // *However*, the file still needs to be rewritten atomically, because
        // the system could crash at any moment, so
        //
        // a) truncating is not an option, because for a short moment, the file is empty
        // b) just overwriting corrupts the file content
        rewrite_atomic(&self.manifest_path, json.as_bytes())?;

        Ok(())
    }

    /// Returns the folder that holds the segment files
    #[must_use]
    pub fn segment_folder(&self) -> PathBuf {
        self.folder.join(SEGMENTS_FOLDER)
    }

    /// Returns the amount of levels in the tree
    #[must_use]
    pub fn depth(&self) -> u8 {
        // NOTE: Level count is u8
        #[allow(clippy::cast_possible_truncation)]
        {
            self.levels.len() as u8
        }
    }

    /// Returns the index of the deepest level
    #[must_use]
    pub fn last_level_index(&self) -> u8 {
        self.depth() - 1
    }

    /// Returns the amount of segments, summed over all levels
    #[must_use]
    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Returns `true` if there are no segments
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the segments of one level
    #[must_use]
    pub fn level(&self, level: u8) -> &[Arc<Segment>] {
        self.levels
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns the live blob files
    #[must_use]
    pub fn blob_files(&self) -> &BTreeMap<u64, BlobFileMeta> {
        &self.blob_files
    }

    /// Returns the round-robin cursor of a level, if set
    #[must_use]
    pub fn compaction_cursor(&self, level: u8) -> Option<&UserKey> {
        self.compaction_cursors.get(&level)
    }

    /// Hands out the allocator for new file numbers
    #[must_use]
    pub fn file_number_allocator(&self) -> FileNumberAllocator {
        self.file_numbers.clone()
    }

    /// Allocates the next file number
    #[must_use]
    pub fn next_file_number(&self) -> u64 {
        self.file_numbers.next()
    }

    /// Sorts a level: L0 newest-first, deeper levels by key
    fn sort_level(level_no: u8, level: &mut [Arc<Segment>]) {
        if level_no == 0 {
            level.sort_by(|a, b| b.metadata.seqnos.1.cmp(&a.metadata.seqnos.1));
        } else {
            level.sort_by(|a, b| a.metadata.key_range.0.cmp(&b.metadata.key_range.0));
        }
    }

    pub(crate) fn insert_into_level(&mut self, level_no: u8, segment: Arc<Segment>) {
        let last_level_index = self.last_level_index();
        let index = level_no.clamp(0, last_level_index);

        // NOTE: Clamped to existing levels above
        #[allow(clippy::expect_used)]
        let level = self
            .levels
            .get_mut(index as usize)
            .expect("level should exist");

        level.push(segment);
        Self::sort_level(index, level);
    }

    pub(crate) fn remove(&mut self, file_number: u64) {
        for level in &mut self.levels {
            level.retain(|segment| segment.metadata.file_number != file_number);
        }
    }

    /// Returns the segments of a level that overlap `[lo, hi]`, in key order
    #[must_use]
    pub fn overlapping_segments(&self, level: u8, lo: &UserKey, hi: &UserKey) -> Vec<Arc<Segment>> {
        let bounds = (Bound::Included(lo.clone()), Bound::Included(hi.clone()));

        let mut segments: Vec<_> = self
            .level(level)
            .iter()
            .filter(|segment| segment.check_key_range_overlap(&bounds))
            .cloned()
            .collect();

        segments.sort_by(|a, b| a.metadata.key_range.0.cmp(&b.metadata.key_range.0));
        segments
    }

    /// Returns `true` if no level below `output_level` holds data for `[lo, hi]`
    #[must_use]
    pub fn is_bottommost(&self, output_level: u8, lo: &UserKey, hi: &UserKey) -> bool {
        ((output_level + 1)..self.depth())
            .all(|level| self.overlapping_segments(level, lo, hi).is_empty())
    }

    /// Estimates the bytes stored for keys in `[lo, hi]` across the
    /// given levels (both inclusive)
    ///
    /// Cheap: works on the in-memory block indexes, no disk reads.
    #[must_use]
    pub fn approximate_size(&self, lo: &[u8], hi: &[u8], lvl_lo: u8, lvl_hi: u8) -> u64 {
        let mut sum = 0;

        for level in lvl_lo..=lvl_hi.min(self.last_level_index()) {
            for segment in self.level(level) {
                sum += segment.approximate_size_of_range(lo, hi);
            }
        }

        sum
    }

    /// Returns `true` if any segment is currently pinned by a compaction
    #[must_use]
    pub fn is_compacting(&self) -> bool {
        !self.hidden_set.is_empty()
    }

    /// Returns `true` if the given file is pinned by a compaction
    #[must_use]
    pub fn is_hidden(&self, file_number: u64) -> bool {
        self.hidden_set.contains(&file_number)
    }

    pub(crate) fn hide_segments(&mut self, file_numbers: &[u64]) {
        for file_number in file_numbers {
            self.hidden_set.insert(*file_number);
        }
    }

    pub(crate) fn show_segments(&mut self, file_numbers: &[u64]) {
        for file_number in file_numbers {
            self.hidden_set.remove(file_number);
        }
    }

    /// Applies one edit and makes it durable
    ///
    /// `new_segments` holds the opened handles of all files added by
    /// the edit. The in-memory state and the manifest are updated
    /// together; the manifest rewrite is atomic, so a crash either
    /// keeps the old file set or sees the new one.
    pub fn log_and_apply(
        &mut self,
        edit: VersionEdit,
        new_segments: Vec<Arc<Segment>>,
    ) -> crate::Result<()> {
        for (level, metadata) in &edit.added_files {
            let segment = new_segments
                .iter()
                .find(|s| s.metadata.file_number == metadata.file_number)
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "edit adds file {} but no handle was provided",
                        metadata.file_number,
                    ))
                })?;

            self.insert_into_level(*level, segment);
        }

        for (_, file_number) in &edit.deleted_files {
            self.remove(*file_number);
        }

        for blob_file in edit.added_blob_files {
            self.blob_files.insert(blob_file.file_number, blob_file);
        }

        for (blob_file, garbage) in &edit.blob_garbage {
            if let Some(meta) = self.blob_files.get_mut(blob_file) {
                meta.garbage_count += garbage.count;
                meta.garbage_bytes += garbage.bytes;
            }
        }

        if let Some((level, cursor)) = edit.compaction_cursor {
            self.compaction_cursors.insert(level, cursor);
        }

        self.write_to_disk()
    }
}

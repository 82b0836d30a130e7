use lsm_compaction::{
    compaction::JobOptions,
    segment::{
        meta::{CompressionType, Temperature},
        writer::{Options as WriterOptions, WriteLifetimeHint, Writer},
    },
    BlockCache, DescriptorTable, RangeTombstone, Segment, SeqNo, Value, ValueType, VersionEdit,
    VersionSet,
};
use std::sync::{Arc, Mutex};

/// A tiny stand-in for the embedding engine: version state plus the
/// shared caches a compaction runs against
pub struct TestEngine {
    pub versions: Arc<Mutex<VersionSet>>,
    pub descriptor_table: Arc<DescriptorTable>,
    pub block_cache: Arc<BlockCache>,
    pub folder: tempfile::TempDir,
}

#[allow(dead_code)]
pub fn test_engine(level_count: u8) -> lsm_compaction::Result<TestEngine> {
    let folder = tempfile::tempdir()?;

    let descriptor_table = Arc::new(DescriptorTable::new(folder.path().join("segments")));
    let block_cache = Arc::new(BlockCache::with_capacity_bytes(u64::MAX));

    let versions = VersionSet::create_new(
        level_count,
        folder.path(),
        descriptor_table.clone(),
        block_cache.clone(),
    )?;

    Ok(TestEngine {
        versions: Arc::new(Mutex::new(versions)),
        descriptor_table,
        block_cache,
        folder,
    })
}

#[allow(dead_code)]
impl TestEngine {
    /// Writes a segment and registers it on the given level, the way
    /// a flush or an earlier compaction would have
    pub fn put_segment(
        &self,
        level: u8,
        items: &[Value],
        tombstones: &[RangeTombstone],
    ) -> lsm_compaction::Result<Arc<Segment>> {
        let (file_number, segment_folder) = {
            let versions = self.versions.lock().expect("lock is poisoned");
            (versions.next_file_number(), versions.segment_folder())
        };

        let mut writer = Writer::new(
            file_number,
            WriterOptions {
                folder: segment_folder,
                block_size: 4_096,
                compression: CompressionType::Lz4,
                temperature: Temperature::Unknown,
                write_hint: WriteLifetimeHint::NotSet,
                preallocate_bytes: 0,
            },
        )?;

        for item in items {
            writer.write(item.clone())?;
        }

        for tombstone in tombstones {
            writer.add_range_tombstone(tombstone.clone())?;
        }

        writer.finish()?;

        let metadata = writer
            .into_metadata(1)
            .expect("test segment should not be empty");

        let segment = Arc::new(Segment::open(
            metadata.clone(),
            self.descriptor_table.clone(),
            self.block_cache.clone(),
        )?);

        let mut versions = self.versions.lock().expect("lock is poisoned");

        versions.log_and_apply(
            VersionEdit {
                added_files: vec![(level, metadata)],
                ..Default::default()
            },
            vec![segment.clone()],
        )?;

        Ok(segment)
    }

    pub fn job_options(&self, job_id: u64) -> JobOptions {
        JobOptions::new(
            job_id,
            self.versions.clone(),
            self.descriptor_table.clone(),
            self.block_cache.clone(),
            self.folder.path(),
        )
    }

    /// Reads every item of a level, in key order
    pub fn level_contents(&self, level: u8) -> lsm_compaction::Result<Vec<Value>> {
        let segments: Vec<_> = {
            let versions = self.versions.lock().expect("lock is poisoned");
            versions.level(level).to_vec()
        };

        let mut out = Vec::new();

        for segment in segments {
            for item in segment.iter(false) {
                out.push(item?);
            }
        }

        Ok(out)
    }

    pub fn level_len(&self, level: u8) -> usize {
        let versions = self.versions.lock().expect("lock is poisoned");
        versions.level(level).len()
    }

    pub fn segment_files_on_disk(&self) -> lsm_compaction::Result<usize> {
        Ok(std::fs::read_dir(self.folder.path().join("segments"))?.count())
    }
}

#[allow(dead_code)]
pub fn value(key: &[u8], val: &[u8], seqno: SeqNo) -> Value {
    Value::new(key, val, seqno, ValueType::Value)
}

#[allow(dead_code)]
pub fn tombstone(key: &[u8], seqno: SeqNo) -> Value {
    Value::new(key, *b"", seqno, ValueType::Tombstone)
}

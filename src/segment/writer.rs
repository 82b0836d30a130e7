use super::{
    block::{IndexBlock, RangeTombstoneBlock, ValueBlock},
    index::BlockHandle,
    meta::{fold_content_hash, CompressionType, Temperature},
};
use crate::{
    blob::{BlobIndex, BlobRefStats},
    file::segment_file_path,
    range_tombstone::RangeTombstone,
    value::{SeqNo, UserKey, ValueType},
    Error, Value,
};
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

pub(crate) const FOOTER_MAGIC: u32 = 0x4C53_4D31;
pub(crate) const FOOTER_SIZE: u64 = 36;

/// Hint to the file system about how long the written data is
/// expected to live
///
/// Derived from the output level: deeper levels rewrite less often.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum WriteLifetimeHint {
    #[default]
    NotSet,
    Short,
    Medium,
    Long,
    Extreme,
}

pub struct Options {
    pub folder: PathBuf,
    pub block_size: u32,
    pub compression: CompressionType,
    pub temperature: Temperature,
    pub write_hint: WriteLifetimeHint,

    /// Expected maximum file size; the file is preallocated to this
    /// size and truncated to its real length on finish
    pub preallocate_bytes: u64,
}

/// Serializes and compresses values into blocks and writes them to a
/// single segment file
///
/// The file ends with a range tombstone block (if any), the block
/// index and a fixed-size footer.
pub struct Writer {
    pub opts: Options,
    pub file_number: u64,
    path: PathBuf,

    block_writer: BufWriter<File>,
    chunk: ValueBlock,
    index: Vec<BlockHandle>,
    pub(crate) range_tombstones: Vec<RangeTombstone>,

    pub block_count: usize,
    pub item_count: usize,
    pub file_pos: u64,

    /// Only takes user data into account
    pub uncompressed_size: u64,

    pub first_key: Option<UserKey>,
    pub last_key: Option<UserKey>,
    pub tombstone_count: usize,
    pub chunk_size: usize,

    pub lowest_seqno: SeqNo,
    pub highest_seqno: SeqNo,

    pub key_count: usize,
    current_key: Option<UserKey>,

    // (key, seqno, tag) of the last written item, for order checking
    last_internal: Option<(UserKey, SeqNo, u8)>,

    pub(crate) content_hasher: seahash::SeaHasher,
    pub(crate) blob_refs: BTreeMap<u64, BlobRefStats>,
    pub(crate) oldest_blob_file: Option<u64>,
}

impl Writer {
    /// Sets up a new `Writer` for the given file number
    pub fn new(file_number: u64, opts: Options) -> crate::Result<Self> {
        std::fs::create_dir_all(&opts.folder)?;

        let path = segment_file_path(&opts.folder, file_number);

        let file = File::create(&path)?;

        if opts.preallocate_bytes > 0 {
            file.set_len(opts.preallocate_bytes)?;
        }

        log::trace!(
            "Created segment file {} (temperature: {:?}, write hint: {:?})",
            path.display(),
            opts.temperature,
            opts.write_hint,
        );

        let block_writer = BufWriter::with_capacity(512_000, file);

        let chunk = ValueBlock {
            items: Vec::with_capacity(1_000),
            crc: 0,
        };

        Ok(Self {
            opts,
            file_number,
            path,

            block_writer,
            chunk,
            index: Vec::with_capacity(100),
            range_tombstones: Vec::new(),

            block_count: 0,
            item_count: 0,
            file_pos: 0,
            uncompressed_size: 0,

            first_key: None,
            last_key: None,
            chunk_size: 0,
            tombstone_count: 0,

            lowest_seqno: SeqNo::MAX,
            highest_seqno: 0,

            current_key: None,
            key_count: 0,

            last_internal: None,

            content_hasher: seahash::SeaHasher::default(),
            blob_refs: BTreeMap::new(),
            oldest_blob_file: None,
        })
    }

    /// Returns `true` if nothing was written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_count == 0 && self.range_tombstones.is_empty()
    }

    /// Writes a compressed block to disk
    ///
    /// This is triggered when a `Writer::write` causes the buffer to grow to the configured `block_size`
    fn write_block(&mut self) -> crate::Result<()> {
        debug_assert!(!self.chunk.items.is_empty());

        let uncompressed_chunk_size = self
            .chunk
            .items
            .iter()
            .map(|item| item.size() as u64)
            .sum::<u64>();

        self.uncompressed_size += uncompressed_chunk_size;

        self.chunk.crc = ValueBlock::create_crc(&self.chunk.items)?;
        let bytes = self.chunk.pack(self.opts.compression)?;

        // Write to file
        self.block_writer.write_all(&bytes)?;

        // NOTE: Blocks are never bigger than 4 GB anyway,
        // so it's fine to just truncate it
        #[allow(clippy::cast_possible_truncation)]
        let bytes_written = bytes.len() as u32;

        // Expect is fine, because the chunk is not empty
        #[allow(clippy::expect_used)]
        let first = self.chunk.items.first().expect("chunk should not be empty");

        self.index.push(BlockHandle {
            start_key: first.key.clone(),
            offset: self.file_pos,
            size: bytes_written,
        });

        // Adjust metadata
        self.file_pos += u64::from(bytes_written);
        self.item_count += self.chunk.items.len();
        self.block_count += 1;
        self.chunk.items.clear();

        Ok(())
    }

    /// Writes an item
    ///
    /// Items must be written in strictly ascending internal key order.
    pub fn write(&mut self, item: Value) -> crate::Result<()> {
        let tag = u8::from(item.value_type);

        if let Some((last_key, last_seqno, last_tag)) = &self.last_internal {
            let prev = (last_key, Reverse(*last_seqno), Reverse(*last_tag));
            let next = (&item.key, Reverse(item.seqno), Reverse(tag));

            if next <= prev {
                return Err(Error::InvalidArgument(format!(
                    "out-of-order write into segment {}: {:?}:{} after {:?}:{}",
                    self.file_number, item.key, item.seqno, last_key, last_seqno,
                )));
            }
        }
        self.last_internal = Some((item.key.clone(), item.seqno, tag));

        if item.is_tombstone() {
            self.tombstone_count += 1;
        }

        if item.value_type == ValueType::Indirection {
            let idx = BlobIndex::decode(&item.value).map_err(|_| {
                Error::Corruption(format!("malformed blob pointer under key {:?}", item.key))
            })?;

            self.blob_refs
                .entry(idx.blob_file)
                .or_default()
                .add(u64::from(idx.len));

            self.oldest_blob_file = Some(match self.oldest_blob_file {
                Some(n) => n.min(idx.blob_file),
                None => idx.blob_file,
            });
        }

        fold_content_hash(&mut self.content_hasher, &item);

        if Some(&item.key) != self.current_key.as_ref() {
            self.key_count += 1;
            self.current_key = Some(item.key.clone());
        }

        let item_key = item.key.clone();
        let seqno = item.seqno;

        self.chunk_size += item.size();
        self.chunk.items.push(item);

        if self.chunk_size >= self.opts.block_size as usize {
            self.write_block()?;
            self.chunk_size = 0;
        }

        if self.first_key.is_none() {
            self.first_key = Some(item_key.clone());
        }
        self.last_key = Some(item_key);

        if self.lowest_seqno > seqno {
            self.lowest_seqno = seqno;
        }

        if self.highest_seqno < seqno {
            self.highest_seqno = seqno;
        }

        Ok(())
    }

    /// Adds a range tombstone
    ///
    /// Range tombstones go into their own block; they do not need to be
    /// interleaved with the point key stream.
    pub fn add_range_tombstone(&mut self, tombstone: RangeTombstone) -> crate::Result<()> {
        if !tombstone.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "empty range tombstone {:?}..{:?}",
                tombstone.start, tombstone.end,
            )));
        }

        if self.lowest_seqno > tombstone.seqno {
            self.lowest_seqno = tombstone.seqno;
        }
        if self.highest_seqno < tombstone.seqno {
            self.highest_seqno = tombstone.seqno;
        }

        self.range_tombstones.push(tombstone);

        Ok(())
    }

    /// Computes the key range of the output, taking range tombstones into account
    pub(crate) fn key_range(&self) -> Option<(UserKey, UserKey)> {
        let mut lo = self.first_key.clone();
        let mut hi = self.last_key.clone();

        for tombstone in &self.range_tombstones {
            lo = Some(match lo {
                Some(lo) if lo <= tombstone.start => lo,
                _ => tombstone.start.clone(),
            });

            // NOTE: The exclusive end over-approximates the largest
            // affected key, which is safe for overlap checks
            hi = Some(match hi {
                Some(hi) if hi >= tombstone.end => hi,
                _ => tombstone.end.clone(),
            });
        }

        Some((lo?, hi?))
    }

    /// Finishes the segment, making sure all data is written durably
    ///
    /// An empty segment (no items, no range tombstones) deletes its
    /// file instead; check [`Writer::is_empty`] afterwards.
    pub fn finish(&mut self) -> crate::Result<()> {
        if !self.chunk.items.is_empty() {
            self.write_block()?;
        }

        // No data! Just delete the file and return nothing
        if self.is_empty() {
            log::debug!(
                "Deleting empty segment file ({}) because no items were written",
                self.path.display()
            );

            // NOTE: Close the handle before unlinking, for portability
            let file = self.block_writer.get_mut();
            file.sync_all().ok();

            std::fs::remove_file(&self.path)?;
            return Ok(());
        }

        let mut range_tombstone_handle = (0u64, 0u32);

        if !self.range_tombstones.is_empty() {
            self.range_tombstones
                .sort_by(|a, b| (&a.start, Reverse(a.seqno)).cmp(&(&b.start, Reverse(b.seqno))));

            let block = RangeTombstoneBlock {
                crc: RangeTombstoneBlock::create_crc(&self.range_tombstones)?,
                items: std::mem::take(&mut self.range_tombstones),
            };

            let bytes = block.pack(self.opts.compression)?;
            self.block_writer.write_all(&bytes)?;

            // NOTE: Truncation is okay, blocks are never bigger than 4 GB
            #[allow(clippy::cast_possible_truncation)]
            {
                range_tombstone_handle = (self.file_pos, bytes.len() as u32);
            }

            self.file_pos += bytes.len() as u64;
            self.range_tombstones = block.items;
        }

        let index_block = IndexBlock {
            crc: IndexBlock::create_crc(&self.index)?,
            items: std::mem::take(&mut self.index),
        };

        let bytes = index_block.pack(self.opts.compression)?;
        self.block_writer.write_all(&bytes)?;

        // NOTE: Truncation is okay, blocks are never bigger than 4 GB
        #[allow(clippy::cast_possible_truncation)]
        let index_handle = (self.file_pos, bytes.len() as u32);

        self.file_pos += bytes.len() as u64;
        self.index = index_block.items;

        // Footer
        self.block_writer
            .write_u64::<BigEndian>(range_tombstone_handle.0)?;
        self.block_writer
            .write_u32::<BigEndian>(range_tombstone_handle.1)?;
        self.block_writer.write_u64::<BigEndian>(index_handle.0)?;
        self.block_writer.write_u32::<BigEndian>(index_handle.1)?;
        self.block_writer
            .write_u64::<BigEndian>(self.item_count as u64)?;
        self.block_writer.write_u32::<BigEndian>(FOOTER_MAGIC)?;
        self.file_pos += FOOTER_SIZE;

        // First, flush all data
        self.block_writer.flush()?;

        // Give back the preallocated tail, then fsync
        let file = self.block_writer.get_mut();
        file.set_len(self.file_pos)?;
        file.sync_all()?;

        // fsync folder
        crate::file::fsync_directory(&self.opts.folder)?;

        log::debug!(
            "Written {} items in {} blocks into new segment file, written {} KiB",
            self.item_count,
            self.block_count,
            self.file_pos / 1_024,
        );

        Ok(())
    }

    /// Consumes the finished writer, producing the segment's metadata
    ///
    /// Returns `None` for an empty writer, whose file was already
    /// deleted by [`Writer::finish`].
    #[must_use]
    pub fn into_metadata(self, oldest_ancestor_time: u64) -> Option<super::meta::Metadata> {
        if self.is_empty() {
            None
        } else {
            Some(super::meta::Metadata::from_writer(
                self,
                oldest_ancestor_time,
            ))
        }
    }

    /// Aborts the writer, removing the partial file
    ///
    /// Used when the input stream failed; the half-written output must
    /// not survive.
    pub fn abort(self) {
        let path = self.path.clone();
        drop(self);

        if let Err(e) = std::fs::remove_file(&path) {
            log::error!(
                "Failed to remove aborted segment file {}: {e:?}",
                path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        segment::meta::Metadata, value::ValueType, BlockCache, DescriptorTable, Value,
    };
    use std::sync::Arc;
    use test_log::test;

    fn writer_options(folder: &std::path::Path) -> Options {
        Options {
            folder: folder.into(),
            block_size: 4_096,
            compression: CompressionType::Lz4,
            temperature: Temperature::Unknown,
            write_hint: WriteLifetimeHint::NotSet,
            preallocate_bytes: 0,
        }
    }

    #[test]
    fn test_write_and_read() -> crate::Result<()> {
        const ITEM_COUNT: u64 = 100;

        let folder = tempfile::tempdir()?.into_path();

        let mut writer = Writer::new(1, writer_options(&folder))?;

        let items = (0u64..ITEM_COUNT).map(|i| {
            Value::new(
                i.to_be_bytes(),
                nanoid::nanoid!().as_bytes(),
                1_000 + i,
                ValueType::Value,
            )
        });

        for item in items {
            writer.write(item)?;
        }

        writer.finish()?;
        assert_eq!(ITEM_COUNT, writer.item_count as u64);
        assert_eq!(ITEM_COUNT, writer.key_count as u64);

        let metadata = Metadata::from_writer(writer, 0);

        let descriptor_table = Arc::new(DescriptorTable::new(&folder));
        let block_cache = Arc::new(BlockCache::with_capacity_bytes(u64::MAX));

        let segment = crate::Segment::open(metadata, descriptor_table, block_cache)?;

        assert_eq!(
            ITEM_COUNT,
            segment.iter(true).count() as u64,
        );

        Ok(())
    }

    #[test]
    fn test_rejects_out_of_order() -> crate::Result<()> {
        let folder = tempfile::tempdir()?.into_path();

        let mut writer = Writer::new(1, writer_options(&folder))?;

        writer.write(Value::new(*b"b", *b"x", 5, ValueType::Value))?;

        assert!(matches!(
            writer.write(Value::new(*b"a", *b"x", 5, ValueType::Value)),
            Err(Error::InvalidArgument(_))
        ));

        // Same key: seqnos must descend
        assert!(matches!(
            writer.write(Value::new(*b"b", *b"x", 7, ValueType::Value)),
            Err(Error::InvalidArgument(_))
        ));

        writer.write(Value::new(*b"b", *b"x", 3, ValueType::Value))?;

        Ok(())
    }

    #[test]
    fn test_empty_output_is_deleted() -> crate::Result<()> {
        let folder = tempfile::tempdir()?.into_path();

        let mut writer = Writer::new(7, writer_options(&folder))?;
        writer.finish()?;

        assert!(writer.is_empty());
        assert!(!segment_file_path(&folder, 7).try_exists()?);

        Ok(())
    }

    #[test]
    fn test_range_tombstones_only_output_is_kept() -> crate::Result<()> {
        let folder = tempfile::tempdir()?.into_path();

        let mut writer = Writer::new(8, writer_options(&folder))?;
        writer.add_range_tombstone(RangeTombstone::new(*b"a", *b"m", 4))?;
        writer.finish()?;

        assert!(!writer.is_empty());
        assert!(segment_file_path(&folder, 8).try_exists()?);

        let metadata = Metadata::from_writer(writer, 0);
        assert_eq!(1, metadata.range_tombstone_count);
        assert_eq!((4, 4), metadata.seqnos);

        let descriptor_table = Arc::new(DescriptorTable::new(&folder));
        let block_cache = Arc::new(BlockCache::with_capacity_bytes(u64::MAX));

        let segment = crate::Segment::open(metadata, descriptor_table, block_cache)?;
        let tombstones = segment.range_tombstones()?;

        assert_eq!(vec![RangeTombstone::new(*b"a", *b"m", 4)], tombstones);

        Ok(())
    }

    #[test]
    fn test_preallocation_is_truncated() -> crate::Result<()> {
        let folder = tempfile::tempdir()?.into_path();

        let mut opts = writer_options(&folder);
        opts.preallocate_bytes = 1_024 * 1_024;

        let mut writer = Writer::new(9, opts)?;
        writer.write(Value::new(*b"a", *b"x", 1, ValueType::Value))?;
        writer.finish()?;

        let len = std::fs::metadata(segment_file_path(&folder, 9))?.len();
        assert!(len < 1_024 * 1_024);
        assert_eq!(len, writer.file_pos);

        Ok(())
    }
}

pub mod block;
pub mod index;
pub mod meta;
pub mod reader;
pub mod writer;

use self::{
    block::{IndexBlock, RangeTombstoneBlock},
    index::BlockHandle,
    meta::Metadata,
    reader::Reader,
};
use crate::{
    range_tombstone::RangeTombstone,
    serde::DeserializeError,
    value::UserKey,
    BlockCache, DescriptorTable, Error,
};
use byteorder::{BigEndian, ReadBytesExt};
use std::{
    io::{Read, Seek, SeekFrom},
    ops::Bound,
    sync::Arc,
};

/// Disk segment (a.k.a. `SSTable`, `sorted string table`)
///
/// A segment is an immutable, sorted list of key-value pairs split
/// into compressed blocks, followed by an optional range tombstone
/// block, a block index and a footer.
///
/// Segments are merged together during compaction to remove obsolete
/// versions, reducing disk space and improving read performance.
pub struct Segment {
    /// Segment metadata (lives in the level manifest)
    pub metadata: Metadata,

    pub(crate) descriptor_table: Arc<DescriptorTable>,

    /// Block cache
    pub(crate) block_cache: Arc<BlockCache>,

    /// Translates key (first item of a block) to block offset and size
    pub(crate) block_index: Arc<Vec<BlockHandle>>,

    // (offset, size) of the range tombstone block, if any
    range_tombstone_handle: Option<(u64, u32)>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Segment:{}", self.metadata.file_number)
    }
}

struct Footer {
    range_tombstone_handle: Option<(u64, u32)>,
    index_handle: (u64, u32),
}

fn read_footer<R: Read + Seek>(reader: &mut R, item_count: u64) -> crate::Result<Footer> {
    reader.seek(SeekFrom::End(-(writer::FOOTER_SIZE as i64)))?;

    let rt_offset = reader.read_u64::<BigEndian>()?;
    let rt_size = reader.read_u32::<BigEndian>()?;
    let index_offset = reader.read_u64::<BigEndian>()?;
    let index_size = reader.read_u32::<BigEndian>()?;
    let footer_item_count = reader.read_u64::<BigEndian>()?;
    let magic = reader.read_u32::<BigEndian>()?;

    if magic != writer::FOOTER_MAGIC {
        return Err(Error::Deserialize(DeserializeError::InvalidTrailer));
    }

    if footer_item_count != item_count {
        return Err(Error::Corruption(format!(
            "footer item count {footer_item_count} does not match manifest item count {item_count}",
        )));
    }

    Ok(Footer {
        range_tombstone_handle: (rt_size > 0).then_some((rt_offset, rt_size)),
        index_handle: (index_offset, index_size),
    })
}

impl Segment {
    /// Opens a segment from its manifest metadata, reading footer and block index
    pub fn open(
        metadata: Metadata,
        descriptor_table: Arc<DescriptorTable>,
        block_cache: Arc<BlockCache>,
    ) -> crate::Result<Self> {
        let shards = descriptor_table.access(metadata.file_number)?;

        let (footer, index_block) = {
            let mut file = shards.lock_one();

            let footer = read_footer(&mut *file, metadata.item_count)?;

            let index_block = IndexBlock::from_file_compressed(
                &mut *file,
                footer.index_handle.0,
                footer.index_handle.1,
                metadata.compression,
            )?;

            (footer, index_block)
        };

        if !index_block.check_crc(index_block.crc)? {
            return Err(Error::Corruption(format!(
                "index checksum mismatch in segment {}",
                metadata.file_number,
            )));
        }

        Ok(Self {
            metadata,
            descriptor_table,
            block_cache,
            block_index: Arc::new(index_block.items),
            range_tombstone_handle: footer.range_tombstone_handle,
        })
    }

    /// Creates a sequential iterator over the `Segment`.
    #[must_use]
    #[allow(clippy::iter_without_into_iter)]
    pub fn iter(&self, use_cache: bool) -> Reader {
        let cache = if use_cache {
            Some(Arc::clone(&self.block_cache))
        } else {
            None
        };

        Reader::new(
            Arc::clone(&self.descriptor_table),
            self.metadata.file_number,
            self.metadata.compression,
            cache,
            Arc::clone(&self.block_index),
        )
    }

    /// Loads the range tombstones of the segment
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn range_tombstones(&self) -> crate::Result<Vec<RangeTombstone>> {
        let Some((offset, size)) = self.range_tombstone_handle else {
            return Ok(Vec::new());
        };

        let shards = self.descriptor_table.access(self.metadata.file_number)?;

        let block = RangeTombstoneBlock::from_file_compressed(
            &mut *shards.lock_one(),
            offset,
            size,
            self.metadata.compression,
        )?;

        if !block.check_crc(block.crc)? {
            return Err(Error::Corruption(format!(
                "range tombstone checksum mismatch in segment {}",
                self.metadata.file_number,
            )));
        }

        Ok(block.items)
    }

    /// Estimates how many bytes of this segment fall into `[lo, hi]`
    ///
    /// Block granularity: a block counts if its start key is inside the
    /// range. Good enough for subcompaction sizing.
    #[must_use]
    pub fn approximate_size_of_range(&self, lo: &[u8], hi: &[u8]) -> u64 {
        if !self.check_key_range_overlap(&(
            Bound::Included(lo.to_vec().into()),
            Bound::Included(hi.to_vec().into()),
        )) {
            return 0;
        }

        let sum: u64 = self
            .block_index
            .iter()
            .filter(|handle| lo <= &*handle.start_key && &*handle.start_key <= hi)
            .map(|handle| u64::from(handle.size))
            .sum();

        // The range may cut into a block whose start key lies before it
        if sum == 0 {
            let avg = self.metadata.file_size / (self.block_index.len().max(1) as u64);
            return avg;
        }

        sum
    }

    /// Returns the amount of tombstone markers in the `Segment`.
    #[must_use]
    pub fn tombstone_count(&self) -> u64 {
        self.metadata.tombstone_count
    }

    /// Checks if a key range is (partially or fully) contained in this segment.
    pub(crate) fn check_key_range_overlap(
        &self,
        bounds: &(Bound<UserKey>, Bound<UserKey>),
    ) -> bool {
        let (lo, hi) = bounds;
        let (segment_lo, segment_hi) = &self.metadata.key_range;

        if *lo == Bound::Unbounded && *hi == Bound::Unbounded {
            return true;
        }

        if *hi == Bound::Unbounded {
            return match lo {
                Bound::Included(key) => key <= segment_hi,
                Bound::Excluded(key) => key < segment_hi,
                Bound::Unbounded => unreachable!(),
            };
        }

        if *lo == Bound::Unbounded {
            return match hi {
                Bound::Included(key) => key >= segment_lo,
                Bound::Excluded(key) => key > segment_lo,
                Bound::Unbounded => unreachable!(),
            };
        }

        let lo_included = match lo {
            Bound::Included(key) => key <= segment_hi,
            Bound::Excluded(key) => key < segment_hi,
            Bound::Unbounded => unreachable!(),
        };

        let hi_included = match hi {
            Bound::Included(key) => key >= segment_lo,
            Bound::Excluded(key) => key > segment_lo,
            Bound::Unbounded => unreachable!(),
        };

        lo_included && hi_included
    }
}

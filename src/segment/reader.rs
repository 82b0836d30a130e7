use super::{
    block::{load_and_cache_data_block, ValueBlock},
    index::BlockHandle,
    meta::CompressionType,
};
use crate::{BlockCache, DescriptorTable, Error, Value};
use std::{collections::VecDeque, sync::Arc};

/// Sequentially iterates through the entries of a segment
///
/// This does not interpret tombstones; compaction needs every
/// version, including deletion markers.
pub struct Reader {
    descriptor_table: Arc<DescriptorTable>,
    block_cache: Option<Arc<BlockCache>>,

    file_number: u64,
    compression: CompressionType,
    handles: Arc<Vec<BlockHandle>>,

    current: VecDeque<Value>,
    next_block_idx: usize,
    verify_checksums: bool,
}

impl Reader {
    pub fn new(
        descriptor_table: Arc<DescriptorTable>,
        file_number: u64,
        compression: CompressionType,
        block_cache: Option<Arc<BlockCache>>,
        handles: Arc<Vec<BlockHandle>>,
    ) -> Self {
        Self {
            descriptor_table,
            block_cache,

            file_number,
            compression,
            handles,

            current: VecDeque::new(),
            next_block_idx: 0,
            verify_checksums: false,
        }
    }

    /// Re-checks every block's CRC while reading
    ///
    /// Used by the post-compaction verification pass.
    #[must_use]
    pub fn verify_checksums(mut self, v: bool) -> Self {
        self.verify_checksums = v;
        self
    }

    fn load_next_block(&mut self) -> crate::Result<bool> {
        let Some(handle) = self.handles.get(self.next_block_idx) else {
            return Ok(false);
        };
        self.next_block_idx += 1;

        let block = if let Some(block_cache) = &self.block_cache {
            load_and_cache_data_block(
                &self.descriptor_table,
                block_cache,
                self.file_number,
                self.compression,
                handle,
            )?
        } else {
            let shards = self.descriptor_table.access(self.file_number)?;
            let block = ValueBlock::from_file_compressed(
                &mut *shards.lock_one(),
                handle.offset,
                handle.size,
                self.compression,
            )?;
            Arc::new(block)
        };

        if self.verify_checksums && !block.check_crc(block.crc)? {
            return Err(Error::Corruption(format!(
                "block checksum mismatch in segment {} at offset {}",
                self.file_number, handle.offset,
            )));
        }

        self.current = block.items.clone().into();

        Ok(true)
    }
}

impl Iterator for Reader {
    type Item = crate::Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.pop_front() {
                return Some(Ok(item));
            }

            match self.load_next_block() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

use crate::{
    range_tombstone::RangeTombstone,
    serde::{Deserializable, DeserializeError, Serializable, SerializeError},
    value::Value,
    BlockCache, DescriptorTable,
};
use byteorder::{BigEndian, ReadBytesExt};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use std::{
    io::{Cursor, Read, Seek, Write},
    sync::Arc,
};

use super::{index::BlockHandle, meta::CompressionType};

/// Contains the items of a block after decompressing & deserializing.
///
/// The integrity of a block can be checked using the CRC value that is saved in it.
#[derive(Clone, Debug)]
pub struct DiskBlock<T: Clone + Serializable + Deserializable> {
    pub items: Vec<T>,
    pub crc: u32,
}

/// Data blocks are the building blocks of a [`crate::Segment`]. Each block is a sorted list of [`Value`]s,
/// and stored in compressed form on disk, in sorted order.
pub type ValueBlock = DiskBlock<Value>;

/// Block holding the range tombstones of a segment
pub type RangeTombstoneBlock = DiskBlock<RangeTombstone>;

/// Block holding the block index of a segment
pub type IndexBlock = DiskBlock<BlockHandle>;

impl ValueBlock {
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.items.iter().map(Value::size).sum::<usize>()
    }
}

impl<T: Clone + Serializable + Deserializable> DiskBlock<T> {
    /// Encodes the block for disk, compressing it as configured
    pub fn pack(&self, compression: CompressionType) -> crate::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(u16::MAX.into());
        self.serialize(&mut bytes)?;

        Ok(match compression {
            CompressionType::None => bytes,
            CompressionType::Lz4 => compress_prepend_size(&bytes),
        })
    }

    pub fn from_reader_compressed<R: Read>(
        reader: &mut R,
        size: u32,
        compression: CompressionType,
    ) -> crate::Result<Self> {
        let mut bytes = vec![0u8; size as usize];
        reader.read_exact(&mut bytes)?;

        let bytes = match compression {
            CompressionType::None => bytes,
            CompressionType::Lz4 => decompress_size_prepended(&bytes)?,
        };
        let mut bytes = Cursor::new(bytes);

        let block = Self::deserialize(&mut bytes)?;

        Ok(block)
    }

    pub fn from_file_compressed<R: Read + Seek>(
        reader: &mut R,
        offset: u64,
        size: u32,
        compression: CompressionType,
    ) -> crate::Result<Self> {
        reader.seek(std::io::SeekFrom::Start(offset))?;
        Self::from_reader_compressed(reader, size, compression)
    }

    /// Calculates the CRC from a list of values
    pub fn create_crc(items: &Vec<T>) -> crate::Result<u32> {
        let mut hasher = crc32fast::Hasher::new();

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        hasher.update(&(items.len() as u32).to_be_bytes());

        for value in items {
            let mut serialized_value = Vec::new();
            value.serialize(&mut serialized_value)?;

            hasher.update(&serialized_value);
        }

        Ok(hasher.finalize())
    }

    pub(crate) fn check_crc(&self, expected_crc: u32) -> crate::Result<bool> {
        let crc = Self::create_crc(&self.items)?;
        Ok(crc == expected_crc)
    }
}

impl<T: Clone + Serializable + Deserializable> Serializable for DiskBlock<T> {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        // Write CRC
        writer.write_all(&self.crc.to_be_bytes())?;

        // Write number of items

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_all(&(self.items.len() as u32).to_be_bytes())?;

        // Serialize each value
        for value in &self.items {
            value.serialize(writer)?;
        }

        Ok(())
    }
}

impl<T: Clone + Serializable + Deserializable> Deserializable for DiskBlock<T> {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        // Read CRC
        let crc = reader.read_u32::<BigEndian>()?;

        // Read number of items
        let item_count = reader.read_u32::<BigEndian>()? as usize;

        // Deserialize each value
        let mut items = Vec::with_capacity(item_count);
        for _ in 0..item_count {
            items.push(T::deserialize(reader)?);
        }

        Ok(Self { items, crc })
    }
}

/// Loads a data block from disk, going through the block cache
pub fn load_and_cache_data_block(
    descriptor_table: &DescriptorTable,
    block_cache: &BlockCache,
    file_number: u64,
    compression: CompressionType,
    handle: &BlockHandle,
) -> crate::Result<Arc<ValueBlock>> {
    if let Some(block) = block_cache.get_data_block(file_number, handle.offset) {
        // Cache hit: Copy from block
        return Ok(block);
    }

    // Cache miss: load from disk
    let shards = descriptor_table.access(file_number)?;

    let block = ValueBlock::from_file_compressed(
        &mut *shards.lock_one(),
        handle.offset,
        handle.size,
        compression,
    )?;

    let block = Arc::new(block);

    block_cache.insert_data_block(file_number, handle.offset, Arc::clone(&block));

    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use test_log::test;

    #[test]
    fn test_block_roundtrip() -> crate::Result<()> {
        let item1 = Value::new(vec![1, 2, 3], vec![4, 5, 6], 42, ValueType::Value);
        let item2 = Value::new(vec![7, 8, 9], vec![10, 11, 12], 43, ValueType::Value);

        let items = vec![item1.clone(), item2.clone()];
        let crc = DiskBlock::create_crc(&items)?;

        let block = DiskBlock { items, crc };

        let mut serialized = Vec::new();
        block.serialize(&mut serialized)?;

        let deserialized = DiskBlock::<Value>::deserialize(&mut &serialized[..])?;

        assert_eq!(2, deserialized.items.len());
        assert_eq!(deserialized.items.first().cloned(), Some(item1));
        assert_eq!(deserialized.items.get(1).cloned(), Some(item2));
        assert_eq!(crc, deserialized.crc);

        Ok(())
    }

    #[test]
    fn test_block_crc_mismatch() -> crate::Result<()> {
        let item1 = Value::new(vec![1, 2, 3], vec![4, 5, 6], 42, ValueType::Value);

        let block = DiskBlock {
            items: vec![item1],
            crc: 12345,
        };

        let mut serialized = Vec::new();
        block.serialize(&mut serialized)?;

        let deserialized = DiskBlock::<Value>::deserialize(&mut &serialized[..])?;

        assert!(!deserialized.check_crc(54321)?);

        Ok(())
    }

    #[test]
    fn test_pack_unpack_lz4() -> crate::Result<()> {
        let items = vec![Value::new(*b"abc", *b"def", 7, ValueType::Value)];
        let crc = DiskBlock::create_crc(&items)?;
        let block = DiskBlock { items, crc };

        let packed = block.pack(CompressionType::Lz4)?;

        // NOTE: Truncation is okay, test blocks are tiny
        #[allow(clippy::cast_possible_truncation)]
        let unpacked = DiskBlock::<Value>::from_reader_compressed(
            &mut &packed[..],
            packed.len() as u32,
            CompressionType::Lz4,
        )?;

        assert_eq!(1, unpacked.items.len());
        assert!(unpacked.check_crc(crc)?);

        Ok(())
    }
}

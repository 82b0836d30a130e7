//! Blob file side channel
//!
//! Large values can be stored outside the tree in blob files; the
//! tree then carries an [`BlobIndex`] pointer instead of the value.
//! Compaction both creates new blob files (extraction) and tracks how
//! much of the existing ones became garbage because the pointing keys
//! were dropped.

pub mod writer;

use crate::serde::{Deserializable, DeserializeError, Serializable, SerializeError};
use crate::value::UserValue;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{Cursor, Read, Write},
    sync::{Arc, Mutex},
};

pub use writer::BlobFileWriter;

/// Pointer from a tree value into a blob file
///
/// # Disk representation
///
/// \[blob file; 8 bytes] \[offset; 8 bytes] \[length; 4 bytes]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobIndex {
    /// File number of the blob file
    pub blob_file: u64,

    /// Offset of the record inside the blob file
    pub offset: u64,

    /// Length of the value in bytes
    pub len: u32,
}

impl BlobIndex {
    /// Encodes the pointer into a value payload
    #[must_use]
    pub fn encode(&self) -> UserValue {
        let mut bytes = Vec::with_capacity(20);

        // NOTE: Serialization into a Vec can't fail
        #[allow(clippy::expect_used)]
        self.serialize(&mut bytes).expect("should serialize");

        bytes.into()
    }

    /// Decodes a pointer from a value payload
    pub fn decode(bytes: &[u8]) -> Result<Self, DeserializeError> {
        let mut reader = Cursor::new(bytes);
        let idx = Self::deserialize(&mut reader)?;

        if reader.position() != bytes.len() as u64 {
            return Err(DeserializeError::InvalidTrailer);
        }

        Ok(idx)
    }
}

impl Serializable for BlobIndex {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        writer.write_u64::<BigEndian>(self.blob_file)?;
        writer.write_u64::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.len)?;
        Ok(())
    }
}

impl Deserializable for BlobIndex {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let blob_file = reader.read_u64::<BigEndian>()?;
        let offset = reader.read_u64::<BigEndian>()?;
        let len = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            blob_file,
            offset,
            len,
        })
    }
}

/// Reference counts into one blob file
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct BlobRefStats {
    /// Number of referencing values
    pub count: u64,

    /// Total bytes referenced
    pub bytes: u64,
}

impl BlobRefStats {
    pub(crate) fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }
}

/// Garbage deltas per blob file, accumulated by a compaction
pub type BlobGarbage = BTreeMap<u64, BlobRefStats>;

/// Metadata of a blob file
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct BlobFileMeta {
    /// File number of the blob file
    pub file_number: u64,

    /// Number of blobs in the file
    pub blob_count: u64,

    /// Total bytes of blob values
    pub total_bytes: u64,

    /// Bytes already known to be garbage
    pub garbage_bytes: u64,

    /// Blobs already known to be garbage
    pub garbage_count: u64,
}

/// Counts blob references flowing into a subcompaction
///
/// Garbage per blob file is the difference between what flowed in and
/// what survived into the outputs.
#[derive(Clone, Default)]
pub struct BlobRefMeter(Arc<Mutex<BlobGarbage>>);

impl BlobRefMeter {
    pub fn record(&self, idx: &BlobIndex) {
        let mut map = self.0.lock().expect("lock is poisoned");
        map.entry(idx.blob_file)
            .or_default()
            .add(u64::from(idx.len));
    }

    #[must_use]
    pub fn snapshot(&self) -> BlobGarbage {
        self.0.lock().expect("lock is poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_blob_index_roundtrip() {
        let idx = BlobIndex {
            blob_file: 7,
            offset: 1234,
            len: 56,
        };

        let encoded = idx.encode();
        assert_eq!(idx, BlobIndex::decode(&encoded).expect("should decode"));
    }

    #[test]
    fn test_blob_index_rejects_trailing_bytes() {
        let mut encoded = BlobIndex {
            blob_file: 1,
            offset: 2,
            len: 3,
        }
        .encode()
        .to_vec();

        encoded.push(0);

        assert!(BlobIndex::decode(&encoded).is_err());
    }
}

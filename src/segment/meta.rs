use crate::{
    blob::BlobRefStats,
    value::{SeqNo, UserKey, Value},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compression applied to the blocks of a segment
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub enum CompressionType {
    /// Blocks are stored as-is
    None,

    /// Blocks are compressed using LZ4
    #[default]
    Lz4,
}

/// Storage temperature hint for a file
///
/// Forwarded to the file system layer when supported; otherwise
/// only recorded for placement decisions of the embedding engine.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub enum Temperature {
    /// No placement preference
    #[default]
    Unknown,

    /// Frequently read data
    Hot,

    /// Occasionally read data
    Warm,

    /// Rarely read data, e.g. on the bottommost level
    Cold,
}

/// Name of the checksum scheme used by segment files
///
/// Recorded in the manifest so readers can reject files written
/// with a different scheme.
pub const CHECKSUM_SCHEME: &str = "crc32+seahash";

/// Metadata of a disk segment
///
/// Stored in the level manifest; the segment file itself only
/// carries its blocks, index and footer.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Metadata {
    /// File number, the segment's identity
    pub file_number: u64,

    /// Compressed file size in bytes
    pub file_size: u64,

    /// Compression of data blocks
    pub compression: CompressionType,

    /// Storage temperature hint
    pub temperature: Temperature,

    /// Number of data blocks
    pub block_count: usize,

    /// Configured block size in bytes (uncompressed)
    pub block_size: u32,

    /// Number of items
    pub item_count: u64,

    /// Number of distinct user keys
    pub key_count: u64,

    /// Number of point tombstones
    pub tombstone_count: u64,

    /// Number of range tombstones
    pub range_tombstone_count: u64,

    /// Key range of the segment
    pub key_range: (UserKey, UserKey),

    /// Sequence number range (inclusive)
    pub seqnos: (SeqNo, SeqNo),

    /// Size of all items, uncompressed
    pub uncompressed_size: u64,

    /// Creation time (unix timestamp in nanos)
    pub created_at: u128,

    /// Creation time of the oldest data that flowed into this segment
    /// (unix timestamp in seconds)
    pub oldest_ancestor_time: u64,

    /// Digest over the emitted key/value stream, checked by the
    /// verification pass after compaction
    pub content_hash: u64,

    /// Lowest blob file referenced by this segment, if any
    pub oldest_blob_file: Option<u64>,

    /// References into blob files, per blob file number
    pub blob_refs: BTreeMap<u64, BlobRefStats>,
}

impl Metadata {
    /// Consumes a finished writer, capturing its counters
    ///
    /// # Panics
    ///
    /// Panics if the writer produced no output (check
    /// [`super::writer::Writer::is_empty`] first).
    pub(crate) fn from_writer(writer: super::writer::Writer, oldest_ancestor_time: u64) -> Self {
        use std::hash::Hasher;

        // NOTE: An empty writer deletes its file instead of producing metadata
        #[allow(clippy::expect_used)]
        let key_range = writer.key_range().expect("writer should not be empty");

        Self {
            file_number: writer.file_number,
            file_size: writer.file_pos,
            compression: writer.opts.compression,
            temperature: writer.opts.temperature,
            block_count: writer.block_count,
            block_size: writer.opts.block_size,
            item_count: writer.item_count as u64,
            key_count: writer.key_count as u64,
            tombstone_count: writer.tombstone_count as u64,
            range_tombstone_count: writer.range_tombstones.len() as u64,
            key_range,
            seqnos: (writer.lowest_seqno, writer.highest_seqno),
            uncompressed_size: writer.uncompressed_size,
            created_at: crate::time::unix_timestamp().as_nanos(),
            oldest_ancestor_time,
            content_hash: writer.content_hasher.finish(),
            oldest_blob_file: writer.oldest_blob_file,
            blob_refs: writer.blob_refs,
        }
    }

    /// Returns `true` if the key is contained in the segment's key range.
    pub fn key_range_contains<K: AsRef<[u8]>>(&self, key: K) -> bool {
        let key = key.as_ref();
        *self.key_range.0 <= *key && *key <= *self.key_range.1
    }
}

/// Folds one emitted item into the content digest of its output file
///
/// The verification pass replays the same folds over the file's items
/// and compares the final digest.
pub fn fold_content_hash(hasher: &mut seahash::SeaHasher, item: &Value) {
    use std::hash::Hasher;

    hasher.write(&item.key);
    hasher.write(&item.seqno.to_be_bytes());
    hasher.write(&[u8::from(item.value_type)]);
    hasher.write(&item.value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use std::hash::Hasher;
    use test_log::test;

    #[test]
    fn test_content_hash_order_sensitive() {
        let a = Value::new(*b"a", *b"x", 1, ValueType::Value);
        let b = Value::new(*b"b", *b"y", 2, ValueType::Value);

        let mut h1 = seahash::SeaHasher::default();
        fold_content_hash(&mut h1, &a);
        fold_content_hash(&mut h1, &b);

        let mut h2 = seahash::SeaHasher::default();
        fold_content_hash(&mut h2, &b);
        fold_content_hash(&mut h2, &a);

        assert_ne!(h1.finish(), h2.finish());
    }
}

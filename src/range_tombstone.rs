use crate::{
    serde::{Deserializable, DeserializeError, Serializable, SerializeError},
    value::{SeqNo, UserKey},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Deletes every key in `[start, end)` with a sequence number
/// below its own
///
/// Range tombstones are not part of the point key stream; they are
/// stored in a dedicated block per segment.
///
/// # Disk representation
///
/// \[seqno; 8 bytes] \[start length; 2 bytes] \[start; N bytes] \[end length; 2 bytes] \[end; N bytes]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeTombstone {
    /// Start of the deleted range (inclusive)
    pub start: UserKey,

    /// End of the deleted range (exclusive)
    pub end: UserKey,

    /// Sequence number
    pub seqno: SeqNo,
}

impl RangeTombstone {
    /// Creates a new [`RangeTombstone`].
    pub fn new<K: Into<UserKey>>(start: K, end: K, seqno: SeqNo) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            seqno,
        }
    }

    /// Returns `true` if the tombstone deletes the given version of the key.
    #[must_use]
    pub fn covers(&self, key: &[u8], seqno: SeqNo) -> bool {
        seqno < self.seqno && &*self.start <= key && key < &*self.end
    }

    /// Returns `true` if the deleted range is non-empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    /// Returns `true` if the tombstone's range intersects `[lo, hi]` (both inclusive).
    #[must_use]
    pub fn overlaps(&self, lo: &[u8], hi: &[u8]) -> bool {
        &*self.start <= hi && lo < &*self.end
    }
}

impl Serializable for RangeTombstone {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<(), SerializeError> {
        writer.write_u64::<BigEndian>(self.seqno)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.start.len() as u16)?;
        writer.write_all(&self.start)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.end.len() as u16)?;
        writer.write_all(&self.end)?;

        Ok(())
    }
}

impl Deserializable for RangeTombstone {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self, DeserializeError> {
        let seqno = reader.read_u64::<BigEndian>()?;

        let start_len = reader.read_u16::<BigEndian>()?;
        let mut start = vec![0; start_len.into()];
        reader.read_exact(&mut start)?;

        let end_len = reader.read_u16::<BigEndian>()?;
        let mut end = vec![0; end_len.into()];
        reader.read_exact(&mut end)?;

        Ok(Self::new(start, end, seqno))
    }
}

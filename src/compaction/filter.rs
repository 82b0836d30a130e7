use crate::value::{UserKey, UserValue};

/// What to do with a value the compaction filter was shown
#[derive(Clone, Debug)]
pub enum Decision {
    /// Keep the value unchanged
    Keep,

    /// Drop the value
    ///
    /// Older versions of the key may become visible again; the filter
    /// owner accepts those semantics.
    Remove,

    /// Replace the value
    ChangeValue(UserValue),

    /// Drop the value and everything up to (excluding) the given key
    RemoveAndSkipUntil(UserKey),
}

/// User-supplied transform applied to each plain value during
/// compaction
///
/// The filter only sees `Value` kinds; tombstones, merge operands and
/// blob pointers pass it by.
#[allow(clippy::module_name_repetitions)]
pub trait CompactionFilter {
    /// Gets the name of the filter.
    fn name(&self) -> &str;

    /// Decides what happens to one value.
    fn filter(&self, level: u8, key: &[u8], value: &[u8]) -> Decision;

    /// Filters that cannot tolerate seeing only some versions of a key
    /// return `false` here; such filters are rejected, because
    /// compaction shows each key to the filter at most once per
    /// visibility stratum.
    fn ignore_snapshots(&self) -> bool {
        true
    }
}

/// User-supplied associative combiner for `Merge` kinds
///
/// Operand lists are passed oldest-first. Returning `None` signals a
/// merge failure, which fails the subcompaction.
pub trait MergeOperator {
    /// Gets the name of the operator.
    fn name(&self) -> &str;

    /// Combines a full chain of operands on top of an optional base value.
    fn full_merge(
        &self,
        key: &[u8],
        base: Option<&[u8]>,
        operands: &[UserValue],
    ) -> Option<UserValue>;

    /// Combines adjacent operands without a base value.
    ///
    /// Optional; when `None` is returned, the operands are carried
    /// through unmerged.
    fn partial_merge(&self, _key: &[u8], _operands: &[UserValue]) -> Option<UserValue> {
        None
    }
}

/// Counters of one subcompaction
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubcompactionStats {
    /// Records consumed from the merged input stream
    pub records_in: u64,

    /// Records written into output segments
    pub records_out: u64,

    /// Versions shadowed by a newer version in the same visibility stratum
    pub dropped_hidden: u64,

    /// Tombstones and the versions below them, garbage-collected on
    /// the bottommost level
    pub dropped_obsolete: u64,

    /// Versions deleted by a range tombstone
    pub dropped_covered: u64,

    /// Values removed or skipped by the compaction filter
    pub dropped_filtered: u64,

    /// Merge operands resolved into their base value
    pub merged_records: u64,

    /// Single deletes that met zero or more than one matching value
    pub single_delete_mismatches: u64,

    /// Single deletes kept because a snapshot still needs the value
    pub single_delete_fallthroughs: u64,

    /// Bytes written into output segments
    pub bytes_written: u64,

    /// Bytes written into blob files
    pub blob_bytes_written: u64,

    /// Wall clock time of the worker, in µs
    pub micros: u64,
}

impl SubcompactionStats {
    pub(crate) fn merge(&mut self, other: &Self) {
        self.records_in += other.records_in;
        self.records_out += other.records_out;
        self.dropped_hidden += other.dropped_hidden;
        self.dropped_obsolete += other.dropped_obsolete;
        self.dropped_covered += other.dropped_covered;
        self.dropped_filtered += other.dropped_filtered;
        self.merged_records += other.merged_records;
        self.single_delete_mismatches += other.single_delete_mismatches;
        self.single_delete_fallthroughs += other.single_delete_fallthroughs;
        self.bytes_written += other.bytes_written;
        self.blob_bytes_written += other.blob_bytes_written;
        self.micros += other.micros;
    }
}

/// Aggregated counters of a whole compaction job
#[derive(Clone, Debug, Default)]
pub struct JobStats {
    /// Sum over all subcompactions
    pub stats: SubcompactionStats,

    /// Number of input files
    pub input_files: usize,

    /// Number of produced output files
    pub output_files: usize,

    /// Total input bytes
    pub input_bytes: u64,

    /// Total output bytes
    pub output_bytes: u64,

    /// Wall clock time of the whole job, in µs
    pub micros: u64,
}

mod common;

use common::{test_engine, tombstone, value};
use lsm_compaction::{
    compaction::{CompactionJob, CompactionPlan, InputLevel},
    Error, RangeTombstone, Value, ValueType,
};
use test_log::test;

#[test]
fn compaction_simple_merge() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let s1 = engine.put_segment(0, &[value(b"a", b"V1", 5), value(b"c", b"V2", 4)], &[])?;
    let s2 = engine.put_segment(0, &[value(b"b", b"V3", 6)], &[])?;
    let s3 = engine.put_segment(1, &[value(b"a", b"V0", 2), value(b"b", b"Vold", 1)], &[])?;

    let plan = CompactionPlan::new(
        vec![
            InputLevel {
                level: 0,
                segments: vec![s1, s2],
            },
            InputLevel {
                level: 1,
                segments: vec![s3],
            },
        ],
        0,
        1,
    );

    let mut job = CompactionJob::new(plan, engine.job_options(1));
    job.prepare()?;
    job.run()?;
    job.install()?;
    job.cleanup();

    assert_eq!(0, engine.level_len(0));
    assert_eq!(1, engine.level_len(1));
    assert_eq!(
        vec![
            value(b"a", b"V1", 5),
            value(b"b", b"V3", 6),
            value(b"c", b"V2", 4),
        ],
        engine.level_contents(1)?
    );

    let stats = job.stats();
    assert_eq!(5, stats.stats.records_in);
    assert_eq!(3, stats.stats.records_out);
    assert_eq!(2, stats.stats.dropped_hidden);

    // The three inputs are gone from disk, one output remains
    assert_eq!(1, engine.segment_files_on_disk()?);

    Ok(())
}

#[test]
fn compaction_tombstone_at_bottom() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let s1 = engine.put_segment(5, &[tombstone(b"k", 10)], &[])?;
    let s2 = engine.put_segment(6, &[value(b"k", b"V", 3)], &[])?;

    let plan = CompactionPlan::new(
        vec![
            InputLevel {
                level: 5,
                segments: vec![s1],
            },
            InputLevel {
                level: 6,
                segments: vec![s2],
            },
        ],
        5,
        6,
    );

    let mut job = CompactionJob::new(plan, engine.job_options(2));
    job.prepare()?;

    assert!(job.is_bottommost());

    job.run()?;
    job.install()?;
    job.cleanup();

    // Everything annihilated; the empty output was never materialized
    assert_eq!(0, engine.level_len(5));
    assert_eq!(0, engine.level_len(6));
    assert_eq!(0, engine.segment_files_on_disk()?);

    let stats = job.stats();
    assert_eq!(2, stats.stats.records_in);
    assert_eq!(0, stats.stats.records_out);
    assert_eq!(2, stats.stats.dropped_obsolete);
    assert_eq!(0, stats.output_files);

    Ok(())
}

#[test]
fn compaction_snapshot_retention() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let input = engine.put_segment(
        0,
        &[
            value(b"k", b"V2", 10),
            value(b"k", b"V1", 5),
            tombstone(b"k", 2),
        ],
        &[],
    )?;

    // Deeper data for the same key, so the output level is not the
    // bottommost one
    engine.put_segment(3, &[value(b"k", b"Vancient", 1)], &[])?;

    let plan = CompactionPlan::new(
        vec![InputLevel {
            level: 0,
            segments: vec![input],
        }],
        0,
        1,
    )
    .snapshots(vec![6]);

    let mut job = CompactionJob::new(plan, engine.job_options(3));
    job.prepare()?;

    assert!(!job.is_bottommost());

    job.run()?;
    job.install()?;
    job.cleanup();

    // The tombstone is visible under snapshot 6 and V1 is the newest
    // at snapshot 6: all three versions survive
    assert_eq!(
        vec![
            value(b"k", b"V2", 10),
            value(b"k", b"V1", 5),
            tombstone(b"k", 2),
        ],
        engine.level_contents(1)?
    );

    Ok(())
}

#[test]
fn compaction_range_tombstone() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let s1 = engine.put_segment(0, &[], &[RangeTombstone::new(*b"a", *b"m", 8)])?;
    let s2 = engine.put_segment(
        1,
        &[
            value(b"a", b"V", 1),
            value(b"f", b"V", 1),
            value(b"m", b"V", 1),
            value(b"z", b"V", 1),
        ],
        &[],
    )?;

    let plan = CompactionPlan::new(
        vec![
            InputLevel {
                level: 0,
                segments: vec![s1],
            },
            InputLevel {
                level: 1,
                segments: vec![s2],
            },
        ],
        0,
        1,
    );

    let mut job = CompactionJob::new(plan, engine.job_options(4));
    job.prepare()?;

    assert!(job.is_bottommost());

    job.run()?;
    job.install()?;
    job.cleanup();

    // [a, m) is gone, and the tombstone itself was dropped on the
    // bottommost level
    assert_eq!(
        vec![value(b"m", b"V", 1), value(b"z", b"V", 1)],
        engine.level_contents(1)?
    );

    let versions = engine.versions.lock().expect("lock is poisoned");
    let output = versions.level(1).first().expect("output should exist");
    assert_eq!(0, output.metadata.range_tombstone_count);
    drop(versions);

    assert_eq!(2, job.stats().stats.dropped_covered);

    Ok(())
}

#[test]
fn compaction_range_tombstone_kept_above_bottom() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let s1 = engine.put_segment(0, &[], &[RangeTombstone::new(*b"a", *b"m", 8)])?;
    let s2 = engine.put_segment(1, &[value(b"f", b"V", 1), value(b"z", b"V", 1)], &[])?;

    // Data below keeps the tombstone alive
    engine.put_segment(4, &[value(b"b", b"Vdeep", 1)], &[])?;

    let plan = CompactionPlan::new(
        vec![
            InputLevel {
                level: 0,
                segments: vec![s1],
            },
            InputLevel {
                level: 1,
                segments: vec![s2],
            },
        ],
        0,
        1,
    );

    let mut job = CompactionJob::new(plan, engine.job_options(5));
    job.prepare()?;

    assert!(!job.is_bottommost());

    job.run()?;
    job.install()?;
    job.cleanup();

    assert_eq!(vec![value(b"z", b"V", 1)], engine.level_contents(1)?);

    // The output still carries the tombstone, to shadow L4
    let versions = engine.versions.lock().expect("lock is poisoned");
    let output = versions.level(1).first().expect("output should exist");
    assert_eq!(1, output.metadata.range_tombstone_count);
    assert_eq!(
        vec![RangeTombstone::new(*b"a", *b"m", 8)],
        output.range_tombstones()?
    );

    Ok(())
}

#[test]
fn compaction_single_delete_mismatch() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let input = engine.put_segment(
        0,
        &[
            Value::new(*b"k", *b"", 9, ValueType::SingleTombstone),
            value(b"k", b"V", 8),
            value(b"k", b"V", 5),
        ],
        &[],
    )?;

    let mut plan = CompactionPlan::new(
        vec![InputLevel {
            level: 0,
            segments: vec![input],
        }],
        0,
        1,
    );
    plan.enforce_single_delete_contracts = true;

    let mut job = CompactionJob::new(plan, engine.job_options(6));
    job.prepare()?;

    assert!(matches!(job.run(), Err(Error::Corruption(_))));

    // A failed job cannot be installed
    assert!(matches!(job.install(), Err(Error::InvalidArgument(_))));

    job.cleanup();

    // Nothing was installed, the input is untouched
    assert_eq!(1, engine.level_len(0));
    assert_eq!(0, engine.level_len(1));
    assert_eq!(1, engine.segment_files_on_disk()?);

    Ok(())
}

#[test]
fn compaction_roundtrip_is_stable() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let s1 = engine.put_segment(
        0,
        &[
            value(b"a", b"new", 9),
            value(b"b", b"x", 4),
            tombstone(b"c", 7),
        ],
        &[],
    )?;
    let s2 = engine.put_segment(
        1,
        &[value(b"a", b"old", 1), value(b"c", b"gone", 2)],
        &[],
    )?;

    // Keep a deeper file around so tombstones survive both rounds
    engine.put_segment(5, &[value(b"c", b"deep", 1)], &[])?;

    let plan = CompactionPlan::new(
        vec![
            InputLevel {
                level: 0,
                segments: vec![s1],
            },
            InputLevel {
                level: 1,
                segments: vec![s2],
            },
        ],
        0,
        1,
    );

    let mut job = CompactionJob::new(plan, engine.job_options(7));
    job.prepare()?;
    job.run()?;
    job.install()?;
    job.cleanup();

    let first_round = engine.level_contents(1)?;

    // Compacting the result again with identical parameters must not
    // change the key set
    let inputs = {
        let versions = engine.versions.lock().expect("lock is poisoned");
        versions.level(1).to_vec()
    };

    let plan = CompactionPlan::new(
        vec![InputLevel {
            level: 1,
            segments: inputs,
        }],
        1,
        2,
    );

    let mut job = CompactionJob::new(plan, engine.job_options(8));
    job.prepare()?;
    job.run()?;
    job.install()?;
    job.cleanup();

    assert_eq!(first_round, engine.level_contents(2)?);

    Ok(())
}

#[test]
fn compaction_blob_extraction_and_garbage() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let big = b"x".repeat(1_000);

    let input = engine.put_segment(
        0,
        &[
            Value::new(*b"a", big.clone(), 1, ValueType::Value),
            Value::new(*b"b", big.clone(), 2, ValueType::Value),
            value(b"c", b"small", 3),
        ],
        &[],
    )?;

    let mut plan = CompactionPlan::new(
        vec![InputLevel {
            level: 0,
            segments: vec![input],
        }],
        0,
        1,
    );
    plan.enable_blob_files = true;
    plan.min_blob_size = 100;

    let mut job = CompactionJob::new(plan, engine.job_options(9));
    job.prepare()?;
    job.run()?;
    job.install()?;
    job.cleanup();

    {
        let versions = engine.versions.lock().expect("lock is poisoned");

        assert_eq!(1, versions.blob_files().len());

        let blob_file = versions.blob_files().values().next().expect("blob file");
        assert_eq!(2, blob_file.blob_count);
        assert_eq!(2_000, blob_file.total_bytes);
        assert_eq!(0, blob_file.garbage_count);
    }

    // a and b are now blob pointers, c stayed inline
    let contents = engine.level_contents(1)?;
    assert_eq!(ValueType::Indirection, contents[0].value_type);
    assert_eq!(ValueType::Indirection, contents[1].value_type);
    assert_eq!(ValueType::Value, contents[2].value_type);

    // Delete a; compacting to the bottom turns its blob into garbage
    let del = engine.put_segment(0, &[tombstone(b"a", 10)], &[])?;
    let inputs = {
        let versions = engine.versions.lock().expect("lock is poisoned");
        versions.level(1).to_vec()
    };

    let plan = CompactionPlan::new(
        vec![
            InputLevel {
                level: 0,
                segments: vec![del],
            },
            InputLevel {
                level: 1,
                segments: inputs,
            },
        ],
        0,
        1,
    );

    let mut job = CompactionJob::new(plan, engine.job_options(10));
    job.prepare()?;
    job.run()?;
    job.install()?;
    job.cleanup();

    let versions = engine.versions.lock().expect("lock is poisoned");
    let blob_file = versions.blob_files().values().next().expect("blob file");

    assert_eq!(1, blob_file.garbage_count);
    assert_eq!(1_000, blob_file.garbage_bytes);

    Ok(())
}

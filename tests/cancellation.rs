mod common;

use common::{test_engine, value};
use lsm_compaction::{
    compaction::{CompactionJob, CompactionPlan, InputLevel},
    Error, StopReason,
};
use test_log::test;

#[test]
fn cancellation_leaves_no_visible_files() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let input = engine.put_segment(
        0,
        &[value(b"a", b"x", 1), value(b"b", b"y", 2)],
        &[],
    )?;

    let plan = CompactionPlan::new(
        vec![InputLevel {
            level: 0,
            segments: vec![input],
        }],
        0,
        1,
    );

    let opts = engine.job_options(1);
    let cancel = opts.manual_cancel.clone();

    let mut job = CompactionJob::new(plan, opts);
    job.prepare()?;

    cancel.send();

    assert!(matches!(
        job.run(),
        Err(Error::Stopped(StopReason::ManualPause))
    ));

    assert!(matches!(job.install(), Err(Error::InvalidArgument(_))));

    job.cleanup();

    // The manifest still only knows the input
    assert_eq!(1, engine.level_len(0));
    assert_eq!(0, engine.level_len(1));

    // No stray outputs on disk either
    assert_eq!(1, engine.segment_files_on_disk()?);

    Ok(())
}

#[test]
fn shutdown_stops_workers() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let input = engine.put_segment(0, &[value(b"a", b"x", 1)], &[])?;

    let plan = CompactionPlan::new(
        vec![InputLevel {
            level: 0,
            segments: vec![input],
        }],
        0,
        1,
    );

    let opts = engine.job_options(2);
    opts.stop_signal.send();

    let mut job = CompactionJob::new(plan, opts);
    job.prepare()?;

    assert!(matches!(
        job.run(),
        Err(Error::Stopped(StopReason::Shutdown))
    ));

    job.cleanup();

    assert_eq!(1, engine.level_len(0));

    Ok(())
}

#[test]
fn job_lifecycle_misuse_is_rejected() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let input = engine.put_segment(0, &[value(b"a", b"x", 1)], &[])?;

    let plan = CompactionPlan::new(
        vec![InputLevel {
            level: 0,
            segments: vec![input.clone()],
        }],
        0,
        1,
    );

    // Running an unprepared job
    let mut job = CompactionJob::new(plan.clone(), engine.job_options(3));
    assert!(matches!(job.run(), Err(Error::InvalidArgument(_))));

    // A completed job cannot be installed twice
    let mut job = CompactionJob::new(plan, engine.job_options(4));
    job.prepare()?;
    job.run()?;
    job.install()?;
    assert!(matches!(job.install(), Err(Error::InvalidArgument(_))));
    job.cleanup();

    // Preparing twice is a programming error, too
    assert!(matches!(job.prepare(), Err(Error::InvalidArgument(_))));

    Ok(())
}

#[test]
fn plan_validation_rejects_bad_inputs() -> lsm_compaction::Result<()> {
    let engine = test_engine(7)?;

    let input = engine.put_segment(0, &[value(b"a", b"x", 1)], &[])?;

    // Inverted levels
    let plan = CompactionPlan::new(
        vec![InputLevel {
            level: 2,
            segments: vec![input.clone()],
        }],
        2,
        1,
    );
    let mut job = CompactionJob::new(plan, engine.job_options(5));
    assert!(matches!(job.prepare(), Err(Error::InvalidArgument(_))));

    // Unsorted snapshot list
    let plan = CompactionPlan::new(
        vec![InputLevel {
            level: 0,
            segments: vec![input],
        }],
        0,
        1,
    )
    .snapshots(vec![9, 3]);
    let mut job = CompactionJob::new(plan, engine.job_options(6));
    assert!(matches!(job.prepare(), Err(Error::InvalidArgument(_))));

    Ok(())
}

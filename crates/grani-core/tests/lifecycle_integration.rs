//! End-to-end walk through the job lifecycle against a mock scheduler:
//! submit, start, run, finish, collect, wipe.

use std::path::PathBuf;
use std::sync::Arc;

use grani_batch::{BatchConfig, BatchSystem};
use grani_core::testing::{LocalSync, MockBatch};
use grani_core::{
    Collector, CoreError, InfoStore, JobSubmission, Killer, LifecycleController, Outcome, Retry,
    Submitter,
};
use grani_types::{JobState, ResourceSpec, Size};

struct Harness {
    _input: tempfile::TempDir,
    _scratch: tempfile::TempDir,
    input_dir: PathBuf,
    scratch_dir: PathBuf,
    batch: Arc<MockBatch>,
    store: Arc<InfoStore>,
    submitter: Submitter,
    lifecycle: LifecycleController,
}

fn harness() -> Harness {
    let input = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let input_dir = input.path().to_path_buf();
    let scratch_dir = scratch.path().to_path_buf();

    let script = input_dir.join("md.sh");
    std::fs::write(&script, "#!/bin/bash\necho running\n").unwrap();

    let batch = Arc::new(MockBatch::new());
    let store = Arc::new(InfoStore::new());
    let config = BatchConfig::default()
        .with_local_host("login1")
        .with_shared_storage(true);

    let submitter = Submitter::new(
        Arc::clone(&batch) as Arc<dyn BatchSystem>,
        Arc::clone(&store),
        config,
    );
    let lifecycle = LifecycleController::new(Arc::clone(&store), Arc::new(LocalSync))
        .with_retry(Retry::once());

    Harness {
        _input: input,
        _scratch: scratch,
        input_dir,
        scratch_dir,
        batch,
        store,
        submitter,
        lifecycle,
    }
}

#[tokio::test]
async fn full_lifecycle_submit_run_finish_wipe() {
    let h = harness();

    // submit with per-node resources: 2 nodes x 4 cpus resolves to 8 total
    let mut submission = JobSubmission::new(h.input_dir.join("md.sh"), "batch");
    submission.resources = ResourceSpec {
        nodes: Some(2),
        cpus_per_node: Some(4),
        mem_per_cpu: Some(Size::from_gb(1)),
        ..Default::default()
    };
    let record = h.submitter.submit(submission).await.unwrap();
    assert_eq!(record.state, JobState::Queued);
    assert_eq!(record.resources.cpus, 8);
    assert_eq!(record.resources.mem, Size::from_gb(8));

    let info_file = record.info_path();
    assert!(info_file.exists());

    // the execution environment allocates a scratch directory and reports in
    let work_dir = h.scratch_dir.join("job");
    std::fs::create_dir(&work_dir).unwrap();
    let record = h
        .lifecycle
        .on_start(&info_file, "node1", vec!["node1".into(), "node2".into()], &work_dir)
        .await
        .unwrap();
    assert_eq!(record.state, JobState::Running);
    assert_eq!(record.work_dir.as_deref(), Some(work_dir.as_path()));

    // the job produces results and runtime logs
    std::fs::write(work_dir.join("md.sh.out"), "stdout").unwrap();
    std::fs::write(work_dir.join("md.sh.err"), "").unwrap();
    std::fs::write(work_dir.join("result.dat"), "42").unwrap();

    // wipe is refused while the job is running
    let err = h.lifecycle.wipe(&info_file).await.unwrap_err();
    assert!(matches!(err, CoreError::NotTerminal(_)));

    // terminal processing copies everything back and reclaims scratch
    let record = h
        .lifecycle
        .on_terminal(&info_file, Outcome::Finished)
        .await
        .unwrap();
    assert_eq!(record.state, JobState::Finished);
    assert!(h.input_dir.join("md.sh.out").exists());
    assert!(h.input_dir.join("result.dat").exists());
    assert!(!work_dir.exists());

    // wiping the already-reclaimed directory is a no-op, twice
    h.lifecycle.wipe(&info_file).await.unwrap();
    h.lifecycle.wipe(&info_file).await.unwrap();
}

#[tokio::test]
async fn killed_job_keeps_diagnostics_and_work_dir() {
    let h = harness();

    let record = h
        .submitter
        .submit(JobSubmission::new(h.input_dir.join("md.sh"), "batch"))
        .await
        .unwrap();
    let info_file = record.info_path();

    let work_dir = h.scratch_dir.join("job");
    std::fs::create_dir(&work_dir).unwrap();
    h.lifecycle
        .on_start(&info_file, "node1", vec!["node1".into()], &work_dir)
        .await
        .unwrap();
    std::fs::write(work_dir.join(record.stdout_name()), "partial output").unwrap();
    std::fs::write(work_dir.join(record.stderr_name()), "error trace").unwrap();
    std::fs::write(work_dir.join("checkpoint.chk"), "state").unwrap();

    let lifecycle = Arc::new(
        LifecycleController::new(Arc::clone(&h.store), Arc::new(LocalSync))
            .with_retry(Retry::once()),
    );
    let killer = Killer::new(
        Arc::clone(&h.batch) as Arc<dyn BatchSystem>,
        Arc::clone(&h.store),
        lifecycle,
    );
    let killed_id = killer.kill(&info_file, false).await.unwrap();
    assert_eq!(killed_id, record.job_id);
    assert_eq!(h.batch.cancelled(), vec![record.job_id.clone()]);

    // diagnostics are in the input directory, the rest stays for inspection
    assert!(h.input_dir.join(record.stdout_name()).exists());
    assert!(h.input_dir.join(record.stderr_name()).exists());
    assert!(!h.input_dir.join("checkpoint.chk").exists());
    assert!(work_dir.join("checkpoint.chk").exists());

    let record = h.store.reload(&info_file).await.unwrap();
    assert_eq!(record.state, JobState::Killed);

    // now reclaim the scratch directory explicitly
    h.lifecycle.wipe(&info_file).await.unwrap();
    assert!(!work_dir.exists());
}

#[tokio::test]
async fn collector_reports_submitted_jobs_in_order() {
    let h = harness();

    let mut job_ids = Vec::new();
    for i in 0..5 {
        let script = h.input_dir.join(format!("job{i}.sh"));
        std::fs::write(&script, "#!/bin/bash\n").unwrap();
        let record = h
            .submitter
            .submit(JobSubmission::new(&script, "batch"))
            .await
            .unwrap();
        job_ids.push(record.job_id);
    }

    let collector = Collector::new(Arc::clone(&h.batch) as Arc<dyn BatchSystem>).with_workers(2);
    let entries = collector.collect_jobs(&job_ids).await;

    let collected: Vec<_> = entries.iter().map(|e| e.job_id.clone()).collect();
    assert_eq!(collected, job_ids);
    assert!(entries.iter().all(|e| e.state == JobState::Queued));
}

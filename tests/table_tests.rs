use hpc_agent::registry::JobTaskTable;

#[test]
fn test_add_creates_job_and_task() {
    let mut table = JobTaskTable::new();

    let (task, is_new) = table.add_job_and_task(1, 1, 0);
    assert!(is_new);
    assert!(!task.exited);
    assert_eq!(task.requeue_count(), 0);

    let found = table.get_task(1, 1).unwrap();
    assert_eq!(found.job_id, 1);
    assert_eq!(found.task_id, 1);
}

#[test]
fn test_re_add_same_attempt_is_not_new() {
    let mut table = JobTaskTable::new();

    let (_, first) = table.add_job_and_task(1, 1, 0);
    let (_, second) = table.add_job_and_task(1, 1, 0);

    assert!(first);
    assert!(!second);
}

#[test]
fn test_requeue_bumps_attempt_and_is_new() {
    let mut table = JobTaskTable::new();

    let (task, _) = table.add_job_and_task(1, 1, 0);
    let first_attempt = task.attempt_id();
    task.exited = true;

    let (task, is_new) = table.add_job_and_task(1, 1, 1);
    assert!(is_new);
    assert!(task.attempt_id() > first_attempt);
    assert_eq!(task.requeue_count(), 1);
    // The requeued slot represents a fresh attempt.
    assert!(!task.exited);
}

#[test]
fn test_attempt_id_strictly_increases_across_requeues() {
    let mut table = JobTaskTable::new();

    let mut last = {
        let (task, _) = table.add_job_and_task(7, 3, 0);
        task.attempt_id()
    };
    for requeue in 1..5 {
        let (task, _) = table.add_job_and_task(7, 3, requeue);
        assert!(task.attempt_id() > last);
        last = task.attempt_id();
    }
}

#[test]
fn test_remove_task_guards_on_attempt() {
    let mut table = JobTaskTable::new();

    let (task, _) = table.add_job_and_task(1, 1, 0);
    let stale_attempt = task.attempt_id();

    // Requeue advances the attempt; removal with the stale id is a no-op.
    table.add_job_and_task(1, 1, 1);
    assert!(!table.remove_task(1, 1, stale_attempt));
    assert!(table.get_task(1, 1).is_some());

    let current = table.get_task(1, 1).unwrap().attempt_id();
    assert!(table.remove_task(1, 1, current));
    assert!(table.get_task(1, 1).is_none());
}

#[test]
fn test_remove_job_returns_tasks() {
    let mut table = JobTaskTable::new();
    table.add_job_and_task(1, 1, 0);
    table.add_job_and_task(1, 2, 0);

    let job = table.remove_job(1).unwrap();
    assert_eq!(job.tasks.len(), 2);
    assert!(table.remove_job(1).is_none());
    assert!(table.get_task(1, 1).is_none());
}

#[test]
fn test_job_survives_task_removal() {
    let mut table = JobTaskTable::new();
    let (task, _) = table.add_job_and_task(1, 1, 0);
    let attempt = task.attempt_id();

    table.remove_task(1, 1, attempt);

    assert!(table.get_task(1, 1).is_none());
    assert_eq!(table.job_count(), 1);
}

#[test]
fn test_resync_flag_carried_by_exactly_one_snapshot() {
    let mut table = JobTaskTable::new();

    let body = table.snapshot();
    assert_eq!(body["NeedResync"], false);

    table.request_resync();
    assert!(table.need_resync());

    let body = table.snapshot();
    assert_eq!(body["NeedResync"], true);

    // Cleared after being observed once.
    let body = table.snapshot();
    assert_eq!(body["NeedResync"], false);
}

#[test]
fn test_snapshot_lists_all_jobs() {
    let mut table = JobTaskTable::new();
    table.add_job_and_task(1, 1, 0);
    table.add_job_and_task(2, 1, 0);
    table.add_job_and_task(2, 2, 0);

    let body = table.snapshot();
    let jobs = body["Jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);

    let job2 = jobs
        .iter()
        .find(|j| j["JobId"] == 2)
        .expect("job 2 missing from snapshot");
    assert_eq!(job2["Tasks"].as_array().unwrap().len(), 2);
}

#[test]
fn test_process_key_tracks_requeue() {
    let mut table = JobTaskTable::new();

    let (task, _) = table.add_job_and_task(1, 1, 0);
    let key0 = task.process_key();

    let (task, _) = table.add_job_and_task(1, 1, 2);
    let key2 = task.process_key();

    assert_ne!(key0, key2);
    assert_eq!(key2.requeue_count, 2);
}

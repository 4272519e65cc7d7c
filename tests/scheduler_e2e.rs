//! End-to-end scenarios from spec §8, driven against a simulated 4-GPU host
//! by pointing `probe_path` at a throwaway shell script that prints a fixed
//! CSV snapshot, exactly like the real `gpu-query` contract in spec §6.

use gpu_scheduler::core::job::{JobConfig, JobStatus};
use gpu_scheduler::core::scheduler::SchedulerState;
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use tempfile::{tempdir, NamedTempFile};

fn fake_probe(rows: &[(u32, u64, u64, u32)]) -> NamedTempFile {
    let mut script = NamedTempFile::new().unwrap();
    writeln!(script, "#!/bin/sh").unwrap();
    for (id, total_mb, used_mb, util_pct) in rows {
        writeln!(
            script,
            "echo '{id},GPU-{id},{total_mb},{used_mb},{util_pct},40,100.0,300.0'"
        )
        .unwrap();
    }
    let mut perms = script.as_file().metadata().unwrap().permissions();
    perms.set_mode(0o755);
    script.as_file().set_permissions(perms).unwrap();
    script
}

fn four_idle_gpus() -> NamedTempFile {
    fake_probe(&[
        (0, 40960, 0, 0),
        (1, 40960, 0, 0),
        (2, 40960, 0, 0),
        (3, 40960, 0, 0),
    ])
}

fn config(command: &str) -> JobConfig {
    JobConfig {
        command: command.to_string(),
        gpu_ids: None,
        num_gpus: 1,
        memory_limit_gb: 5,
        env: HashMap::new(),
        working_dir: None,
        name: None,
        priority: 0,
    }
}

#[test]
fn basic_run_completes_within_two_ticks() {
    let output = tempdir().unwrap();
    let probe = four_idle_gpus();
    let mut state = SchedulerState::new(
        output.path().to_path_buf(),
        probe.path().to_str().unwrap().to_string(),
        1000,
        10,
    );

    let job_id = state.submit(config("sleep 1"), 1).unwrap();
    state.tick(2); // poll + place: job starts running
    assert_eq!(state.store.get(&job_id).unwrap().status, JobStatus::Running);
    assert_eq!(state.store.get(&job_id).unwrap().assigned_gpus.len(), 1);

    std::thread::sleep(std::time::Duration::from_millis(1200));
    state.tick(3); // reap: job has exited
    let job = state.store.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.exit_code, 0);
}

#[test]
fn gpu_inventory_reflects_assignment_immediately_after_launch() {
    let output = tempdir().unwrap();
    let probe = four_idle_gpus();
    let mut state = SchedulerState::new(
        output.path().to_path_buf(),
        probe.path().to_str().unwrap().to_string(),
        1000,
        10,
    );

    let job_id = state.submit(config("sleep 1"), 1).unwrap();
    state.tick(2); // same tick: poll sees all GPUs idle, places and launches
    let job = state.store.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    let gpu_id = job.assigned_gpus[0];

    // No second poll has happened yet; invariants 1/2 must already hold.
    let gpu = state.gpus.get(gpu_id).unwrap();
    assert!(!gpu.is_available);
    assert_eq!(gpu.assigned_job_id.as_deref(), Some(job_id.as_str()));
}

#[test]
fn pinning_assigns_exactly_the_requested_gpu() {
    let output = tempdir().unwrap();
    let probe = four_idle_gpus();
    let mut state = SchedulerState::new(
        output.path().to_path_buf(),
        probe.path().to_str().unwrap().to_string(),
        1000,
        10,
    );

    let mut cfg = config("true");
    cfg.gpu_ids = Some(vec![2]);
    let job_id = state.submit(cfg, 1).unwrap();

    state.tick(2);
    let job = state.store.get(&job_id).unwrap();
    assert_eq!(job.assigned_gpus, vec![2]);
}

#[test]
fn infeasible_pin_does_not_stall_a_feasible_job() {
    let output = tempdir().unwrap();
    // GPU 0 is saturated (over the utilization threshold), 1-3 are idle.
    let probe = fake_probe(&[
        (0, 40960, 0, 95),
        (1, 40960, 0, 0),
        (2, 40960, 0, 0),
        (3, 40960, 0, 0),
    ]);
    let mut state = SchedulerState::new(
        output.path().to_path_buf(),
        probe.path().to_str().unwrap().to_string(),
        1000,
        10,
    );

    let mut pinned = config("true");
    pinned.gpu_ids = Some(vec![0]);
    pinned.priority = 10;
    let j1 = state.submit(pinned, 1).unwrap();

    let mut plain = config("true");
    plain.priority = 0;
    let j2 = state.submit(plain, 2).unwrap();

    state.tick(3);

    assert_eq!(state.store.get(&j1).unwrap().status, JobStatus::Queued);
    assert_eq!(state.store.get(&j2).unwrap().status, JobStatus::Running);
}

#[test]
fn cancel_queued_job_never_runs_even_after_gpus_free_up() {
    let output = tempdir().unwrap();
    let probe = four_idle_gpus();
    let mut state = SchedulerState::new(
        output.path().to_path_buf(),
        probe.path().to_str().unwrap().to_string(),
        1000,
        10,
    );

    let mut hog = config("sleep 1");
    hog.num_gpus = 4;
    let j1 = state.submit(hog, 1).unwrap();

    let j2 = state.submit(config("true"), 2).unwrap();

    state.tick(3); // J1 takes all 4 GPUs, J2 stays queued
    assert_eq!(state.store.get(&j1).unwrap().status, JobStatus::Running);
    assert_eq!(state.store.get(&j2).unwrap().status, JobStatus::Queued);

    assert!(state.cancel(&j2, 4));
    assert_eq!(state.store.get(&j2).unwrap().status, JobStatus::Cancelled);

    std::thread::sleep(std::time::Duration::from_millis(1200));
    state.tick(5); // J1 completes and releases its GPUs
    state.tick(6); // J2 must stay cancelled, not start

    assert_eq!(state.store.get(&j2).unwrap().status, JobStatus::Cancelled);
}

#[test]
fn cancel_running_job_releases_its_gpus() {
    let output = tempdir().unwrap();
    let probe = four_idle_gpus();
    let mut state = SchedulerState::new(
        output.path().to_path_buf(),
        probe.path().to_str().unwrap().to_string(),
        1000,
        10,
    );

    let job_id = state.submit(config("sleep 600"), 1).unwrap();
    state.tick(2);
    assert_eq!(state.store.get(&job_id).unwrap().status, JobStatus::Running);

    assert!(state.cancel(&job_id, 3));
    let job = state.store.get(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.end_time.is_some());

    // The GPU reconciliation on the next poll sees no running job holding
    // it, so it's free again (thresholds permitting).
    state.tick(4);
    assert!(state.gpus.get(0).unwrap().is_available);
}

#[test]
fn round_trip_preserves_submitted_fields() {
    let output = tempdir().unwrap();
    let probe = four_idle_gpus();
    let mut state = SchedulerState::new(
        output.path().to_path_buf(),
        probe.path().to_str().unwrap().to_string(),
        1000,
        10,
    );

    let mut cfg = config("python train.py");
    cfg.priority = 7;
    cfg.memory_limit_gb = 12;
    cfg.name = Some("my-training-run".to_string());
    let job_id = state.submit(cfg, 1).unwrap();

    let job = state.store.get(&job_id).unwrap();
    assert_eq!(job.command, "python train.py");
    assert_eq!(job.num_gpus, 1);
    assert_eq!(job.memory_limit_gb, 12);
    assert_eq!(job.priority, 7);
    assert_eq!(job.name, "my-training-run");
}

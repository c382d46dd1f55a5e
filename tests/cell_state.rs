use omegasim::cell_state::{CellState, Machine, MachineState};
use omegasim::job::{Job, JobType, Task, TaskState};
use omegasim::resources::ResourceVector;
use omegasim::transaction::{CommitMode, Outcome, RejectReason, Transaction};

fn machine(id: u64, cpu: u32, gpu: u32, memory: f64) -> Machine {
    Machine::new(id, "standard", ResourceVector::new(cpu, gpu, memory), id as u32 % 2)
}

fn task(id: u64, job_id: u64, cpu: u32, gpu: u32, memory: f64, duration: f64) -> Task {
    Task::new(id, job_id, ResourceVector::new(cpu, gpu, memory), duration)
}

fn register_job(cell: &mut CellState, job_id: u64, tasks: Vec<Task>) {
    let mut job = Job::new(job_id, JobType::Batch, 1, 0.);
    job.tasks = tasks.iter().map(|t| t.id).collect();
    cell.add_job(job, tasks);
}

#[test]
fn exact_fit_bumps_version_per_placement() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 4, 0, 8.));
    register_job(
        &mut cell,
        1,
        vec![task(1, 1, 2, 0, 4., 10.), task(2, 1, 2, 0, 4., 10.)],
    );

    let mut txn = Transaction::new("batch-0", CommitMode::Incremental);
    txn.add_placement(1, 0, 0);
    txn.add_placement(2, 0, 0);
    let result = cell.commit(&txn);

    assert!(result.committed);
    assert_eq!(result.accepted_count(), 2);
    let m = cell.machine(0);
    assert_eq!(m.version, 2);
    assert_eq!(m.allocated, m.capacity);
    assert_eq!(cell.cell_version(), 1);
    assert_eq!(cell.total_transactions, 1);
    assert_eq!(cell.total_commits, 1);
    assert_eq!(cell.total_conflicts, 0);
    cell.verify_invariants();
}

#[test]
fn snapshot_is_immutable_under_later_commits() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 2, 0, 4., 10.)]);

    let snapshot = cell.snapshot();
    let mut txn = Transaction::new("s", CommitMode::Incremental);
    txn.add_placement(1, 0, 0);
    assert!(cell.commit(&txn).committed);

    let view = snapshot.machine(0).unwrap();
    assert_eq!(view.version, 0);
    assert!(view.allocated.is_zero());
    assert_eq!(snapshot.cell_version, 0);

    let fresh = cell.snapshot();
    assert_eq!(fresh.machine(0).unwrap().version, 1);
    assert!(fresh.cell_version >= snapshot.cell_version);
}

#[test]
fn stale_version_is_rejected() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 6, 0, 10., 10.)]);
    register_job(&mut cell, 2, vec![task(2, 2, 6, 0, 10., 10.)]);

    let snapshot = cell.snapshot();
    let version = snapshot.machine(0).unwrap().version;

    let mut first = Transaction::new("a", CommitMode::Incremental);
    first.add_placement(1, 0, version);
    assert!(cell.commit(&first).committed);

    let mut second = Transaction::new("b", CommitMode::Incremental);
    second.add_placement(2, 0, version);
    let result = cell.commit(&second);

    assert!(!result.committed);
    assert_eq!(
        result.outcomes[0].outcome,
        Outcome::Rejected(RejectReason::VersionStale)
    );
    assert_eq!(cell.total_conflicts, 1);
}

#[test]
fn staleness_is_per_machine() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    cell.add_machine(machine(1, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 2, 0, 4., 10.)]);
    register_job(&mut cell, 2, vec![task(2, 2, 2, 0, 4., 10.)]);

    let snapshot = cell.snapshot();

    // Bump machine 0 between the snapshot and the second commit.
    let mut first = Transaction::new("a", CommitMode::Incremental);
    first.add_placement(1, 0, snapshot.machine(0).unwrap().version);
    assert!(cell.commit(&first).committed);

    // Machine 1 is untouched: its snapshot version must still be accepted.
    let mut second = Transaction::new("b", CommitMode::Incremental);
    second.add_placement(2, 1, snapshot.machine(1).unwrap().version);
    let result = cell.commit(&second);
    assert!(result.committed);
    assert_eq!(result.outcomes[0].outcome, Outcome::Accepted);
}

#[test]
fn duplicate_task_is_rejected() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 2, 0, 4., 10.)]);

    let mut txn = Transaction::new("a", CommitMode::Incremental);
    txn.add_placement(1, 0, 0);
    assert!(cell.commit(&txn).committed);

    let mut again = Transaction::new("a", CommitMode::Incremental);
    again.add_placement(1, 0, 1);
    let result = cell.commit(&again);
    assert_eq!(
        result.outcomes[0].outcome,
        Outcome::Rejected(RejectReason::DuplicateTask)
    );

    // The same task twice within one transaction trips the same check.
    register_job(&mut cell, 2, vec![task(2, 2, 1, 0, 1., 10.)]);
    let mut twice = Transaction::new("a", CommitMode::Incremental);
    let version = cell.machine(0).version;
    twice.add_placement(2, 0, version);
    twice.add_placement(2, 0, version);
    let result = cell.commit(&twice);
    assert_eq!(result.outcomes[0].outcome, Outcome::Accepted);
    assert_eq!(
        result.outcomes[1].outcome,
        Outcome::Rejected(RejectReason::DuplicateTask)
    );
}

#[test]
fn gang_rejection_leaves_no_trace() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 2, 0, 4.));
    cell.add_machine(machine(1, 2, 0, 4.));
    register_job(
        &mut cell,
        1,
        vec![
            task(1, 1, 2, 0, 4., 10.),
            task(2, 1, 2, 0, 4., 10.),
            task(3, 1, 2, 0, 4., 10.),
        ],
    );

    let mut txn = Transaction::new("gang", CommitMode::Gang);
    txn.add_placement(1, 0, 0);
    txn.add_placement(2, 1, 0);
    txn.add_placement(3, 0, 0); // cannot fit next to task 1

    let result = cell.commit(&txn);
    assert!(!result.committed);
    assert!(result.outcomes.iter().all(|o| !o.outcome.is_accepted()));
    assert_eq!(
        result.outcomes[2].outcome,
        Outcome::Rejected(RejectReason::InsufficientResources)
    );
    assert_eq!(cell.machine(0).version, 0);
    assert_eq!(cell.machine(1).version, 0);
    assert_eq!(cell.cell_version(), 0);
    assert_eq!(cell.total_transactions, 1);
    assert_eq!(cell.total_commits, 0);
    for task_id in [1, 2, 3] {
        assert_eq!(cell.task(task_id).state, TaskState::Pending);
    }
    cell.verify_invariants();
}

#[test]
fn incremental_commit_applies_the_valid_part() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    cell.add_machine(machine(1, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 6, 0, 10., 10.)]);
    register_job(
        &mut cell,
        2,
        vec![task(2, 2, 4, 0, 8., 10.), task(3, 2, 4, 0, 8., 10.)],
    );

    let snapshot = cell.snapshot();
    let mut first = Transaction::new("a", CommitMode::Incremental);
    first.add_placement(1, 0, snapshot.machine(0).unwrap().version);
    assert!(cell.commit(&first).committed);

    let cell_version = cell.cell_version();
    let mut second = Transaction::new("b", CommitMode::Incremental);
    second.add_placement(2, 0, snapshot.machine(0).unwrap().version); // stale
    second.add_placement(3, 1, snapshot.machine(1).unwrap().version);
    let result = cell.commit(&second);

    assert!(result.committed);
    assert_eq!(
        result.outcomes[0].outcome,
        Outcome::Rejected(RejectReason::VersionStale)
    );
    assert_eq!(result.outcomes[1].outcome, Outcome::Accepted);
    assert_eq!(cell.machine(1).version, 1);
    assert_eq!(cell.cell_version(), cell_version + 1);
    assert_eq!(cell.task(2).state, TaskState::Pending);
    assert_eq!(cell.task(3).state, TaskState::Scheduled);
    cell.verify_invariants();
}

#[test]
fn release_is_idempotent() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 4, 0, 8., 100.)]);

    let mut txn = Transaction::new("a", CommitMode::Incremental);
    txn.add_placement(1, 0, 0);
    cell.commit(&txn);
    cell.mark_task_running(1, 0.);

    assert!(cell.release(1, 100., TaskState::Completed));
    let version = cell.machine(0).version;
    assert!(cell.machine(0).allocated.is_zero());

    assert!(!cell.release(1, 100., TaskState::Completed));
    assert_eq!(cell.machine(0).version, version);
    cell.verify_invariants();
}

#[test]
fn completed_task_timing_invariant() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 4, 0, 8., 25.)]);

    let mut txn = Transaction::new("a", CommitMode::Incremental);
    txn.add_placement(1, 0, 0);
    cell.commit(&txn);
    cell.mark_task_running(1, 5.);
    cell.release(1, 30., TaskState::Completed);

    let t = cell.task(1);
    assert_eq!(t.machine_id, None);
    assert_eq!(t.end_time, Some(30.));
    cell.verify_invariants();
}

#[test]
fn machine_failure_fails_residents_and_recovery_is_monotonic() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    register_job(
        &mut cell,
        1,
        vec![task(1, 1, 2, 0, 4., 100.), task(2, 1, 2, 0, 4., 100.)],
    );

    let mut txn = Transaction::new("a", CommitMode::Incremental);
    txn.add_placement(1, 0, 0);
    txn.add_placement(2, 0, 0);
    cell.commit(&txn);
    let version_before = cell.machine(0).version;

    let failed = cell.fail_machine(0, 50.);
    assert_eq!(failed, vec![1, 2]);
    assert_eq!(cell.machine(0).state, MachineState::Failed);
    assert!(cell.machine(0).allocated.is_zero());
    assert!(cell.machine(0).version > version_before);
    for task_id in failed {
        let t = cell.task(task_id);
        assert_eq!(t.state, TaskState::Failed);
        assert_eq!(t.machine_id, None);
    }

    let version_failed = cell.machine(0).version;
    cell.recover_machine(0);
    assert_eq!(cell.machine(0).state, MachineState::Healthy);
    assert!(cell.machine(0).version > version_failed);
    assert!(cell.machine(0).allocated.is_zero());
    cell.verify_invariants();
}

#[test]
fn placement_on_failed_machine_is_rejected() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 2, 0, 4., 10.)]);
    cell.fail_machine(0, 0.);

    let mut txn = Transaction::new("a", CommitMode::Incremental);
    txn.add_placement(1, 0, cell.machine(0).version);
    let result = cell.commit(&txn);
    assert_eq!(
        result.outcomes[0].outcome,
        Outcome::Rejected(RejectReason::MachineFailed)
    );

    // Nonexistent machines look the same to the submitter.
    let mut missing = Transaction::new("a", CommitMode::Incremental);
    missing.add_placement(1, 99, 0);
    let result = cell.commit(&missing);
    assert_eq!(
        result.outcomes[0].outcome,
        Outcome::Rejected(RejectReason::MachineFailed)
    );
}

#[test]
fn spawned_clones_join_the_job_and_unlock_dependents() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    cell.add_machine(machine(1, 8, 0, 16.));

    let map = task(1, 1, 2, 0, 4., 10.);
    let reduce = task(2, 1, 2, 0, 4., 10.).with_dependencies([1]);
    let mut job = Job::new(1, JobType::MapReduce, 1, 0.);
    job.tasks = vec![1, 2];
    cell.add_job(job, vec![map, reduce]);

    let mut txn = Transaction::new("mr", CommitMode::Incremental);
    txn.add_placement(1, 0, 0);
    txn.add_placement(2, 0, 0);
    txn.add_spawned(1, 1, 0);
    let result = cell.commit(&txn);

    assert_eq!(result.accepted_count(), 3);
    let clone_id = result.spawned_outcomes[0].task_id;
    assert_ne!(clone_id, 1);
    assert_eq!(cell.job(1).tasks.len(), 3);
    assert!(cell.task(2).dependencies.contains(&clone_id));
    assert_eq!(cell.task(clone_id).requirement, cell.task(1).requirement);
    cell.verify_invariants();
}

#[test]
fn utilization_tracks_allocation() {
    let mut cell = CellState::new();
    cell.add_machine(machine(0, 8, 0, 16.));
    cell.add_machine(machine(1, 8, 0, 16.));
    register_job(&mut cell, 1, vec![task(1, 1, 4, 0, 8., 10.)]);

    let mut txn = Transaction::new("a", CommitMode::Incremental);
    txn.add_placement(1, 0, 0);
    cell.commit(&txn);

    let utilization = cell.utilization();
    assert!((utilization.cpu - 0.25).abs() < 1e-9);
    assert!((utilization.memory - 0.25).abs() < 1e-9);
    assert_eq!(utilization.gpu, 0.);
}

#[test]
fn empty_cluster_cannot_ever_fit() {
    let cell = CellState::new();
    let snapshot = cell.snapshot();
    assert!(!snapshot.could_ever_fit(&ResourceVector::new(1, 0, 0.5)));
}

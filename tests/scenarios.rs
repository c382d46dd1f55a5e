use dslab_core::Simulation;

use omegasim::cell_state::MachineState;
use omegasim::job::{Job, JobType, Task, TaskState};
use omegasim::resources::ResourceVector;
use omegasim::{OmegaSimulation, SimulationConfig};

fn make_sim(yaml: &str) -> OmegaSimulation {
    let config = SimulationConfig::from_yaml(yaml);
    let sim = Simulation::new(config.seed);
    OmegaSimulation::new(sim, config)
}

fn job_of(
    id: u64,
    job_type: JobType,
    task_specs: &[(u64, u32, u32, f64, f64)],
) -> (Job, Vec<Task>) {
    let mut job = Job::new(id, job_type, 1, 0.);
    let tasks = task_specs
        .iter()
        .map(|(task_id, cpu, gpu, memory, duration)| {
            job.tasks.push(*task_id);
            Task::new(*task_id, id, ResourceVector::new(*cpu, *gpu, *memory), *duration)
        })
        .collect();
    (job, tasks)
}

#[test]
fn single_job_single_machine_exact_fit() {
    let mut sim = make_sim(
        r#"
experiment_name: exact_fit
cluster:
  machines:
    - cpu_cores: 4
      memory_gb: 8.0
schedulers:
  - id: batch-0
    type: batch
simulation:
  duration: 100.0
workload:
  enabled: false
"#,
    );

    let (job, tasks) = job_of(1, JobType::Batch, &[(1, 2, 0, 4., 10.), (2, 2, 0, 4., 10.)]);
    sim.submit_job(job, tasks, 0.);
    let results = sim.run();

    assert_eq!(results.completed_jobs, 1);
    assert_eq!(results.failed_jobs, 0);
    assert_eq!(results.cell_state.total_transactions, 1);
    assert_eq!(results.cell_state.total_commits, 1);
    assert_eq!(results.cell_state.total_conflicts, 0);

    let state = sim.cell_state();
    let state = state.borrow();
    // Two placement bumps and two release bumps.
    assert_eq!(state.machine(0).version, 4);
    assert!(state.machine(0).allocated.is_zero());
    for task_id in [1, 2] {
        let task = state.task(task_id);
        assert_eq!(task.state, TaskState::Completed);
        let (start, end) = (task.start_time.unwrap(), task.end_time.unwrap());
        assert!((end - start - 10.).abs() < 1e-9);
    }
    state.verify_invariants();

    // The machine was fully occupied for 10 of the 100 seconds.
    assert!((results.cell_state.utilization.cpu - 0.1).abs() < 1e-6);
    assert!((results.cell_state.utilization.memory - 0.1).abs() < 1e-6);
}

#[test]
fn two_schedulers_conflict_on_one_machine() {
    let mut sim = make_sim(
        r#"
experiment_name: occ_conflict
cluster:
  machines:
    - cpu_cores: 4
      memory_gb: 8.0
schedulers:
  - id: batch-0
    type: batch
  - id: service-0
    type: service
simulation:
  duration: 50.0
workload:
  enabled: false
"#,
    );

    let (batch_job, batch_tasks) = job_of(1, JobType::Batch, &[(1, 4, 0, 8., 1000.)]);
    let (service_job, service_tasks) = job_of(2, JobType::Service, &[(2, 4, 0, 8., 1000.)]);
    sim.submit_job(batch_job, batch_tasks, 0.);
    sim.submit_job(service_job, service_tasks, 0.);

    let results = sim.run();

    // Both planned against the empty machine; the batch commit lands first
    // (decision latency 0.011s vs 1.05s), the service placement goes stale,
    // and the version-refreshed resubmission finds the machine full.
    let batch = &results.schedulers[0];
    assert_eq!(batch.jobs_scheduled, 1);
    assert_eq!(batch.conflicts, 0);

    let service = &results.schedulers[1];
    assert_eq!(service.jobs_scheduled, 0);
    assert_eq!(service.conflicts, 2);

    assert_eq!(results.cell_state.total_transactions, 3);
    assert_eq!(results.cell_state.total_commits, 1);
    assert_eq!(results.cell_state.total_conflicts, 2);
    assert_eq!(results.failed_jobs, 0);

    let state = sim.cell_state();
    let state = state.borrow();
    assert_eq!(state.task(1).state, TaskState::Running);
    assert_eq!(state.task(2).state, TaskState::Pending);
    state.verify_invariants();
}

#[test]
fn service_scheduler_spreads_over_failure_domains() {
    let mut sim = make_sim(
        r#"
experiment_name: domain_spread
cluster:
  machines:
    - cpu_cores: 8
      memory_gb: 16.0
      count: 2
      failure_domain: 0
    - cpu_cores: 8
      memory_gb: 16.0
      count: 2
      failure_domain: 1
schedulers:
  - id: service-0
    type: service
simulation:
  duration: 5.0
workload:
  enabled: false
"#,
    );

    let (job, tasks) = job_of(
        1,
        JobType::Service,
        &[
            (1, 2, 0, 4., 10.),
            (2, 2, 0, 4., 10.),
            (3, 2, 0, 4., 10.),
            (4, 2, 0, 4., 10.),
        ],
    );
    sim.submit_job(job, tasks, 0.);
    sim.run();

    let state = sim.cell_state();
    let state = state.borrow();
    let resident_in_domain = |domain: u32| {
        state
            .machines_in_order()
            .filter(|m| m.failure_domain == domain)
            .map(|m| m.tasks.len())
            .sum::<usize>()
    };
    assert_eq!(resident_in_domain(0), 2);
    assert_eq!(resident_in_domain(1), 2);
    state.verify_invariants();
}

#[test]
fn machine_failure_reschedules_onto_the_survivor() {
    let mut sim = make_sim(
        r#"
experiment_name: failure_recovery
cluster:
  machines:
    - cpu_cores: 4
      memory_gb: 8.0
      count: 2
schedulers:
  - id: batch-0
    type: batch
    placement_strategy: worst_fit
simulation:
  duration: 250.0
workload:
  enabled: false
"#,
    );

    let (job, tasks) = job_of(1, JobType::Batch, &[(1, 2, 0, 4., 100.), (2, 2, 0, 4., 100.)]);
    sim.submit_job(job, tasks, 0.);
    sim.inject_failure_at(0, 50.);

    let results = sim.run();

    assert_eq!(results.machine_failures, 1);
    assert_eq!(results.failed_jobs, 0);
    assert_eq!(results.completed_jobs, 1);

    let state = sim.cell_state();
    let state = state.borrow();
    assert_eq!(state.machine(0).state, MachineState::Failed);
    for task_id in [1, 2] {
        assert_eq!(state.task(task_id).state, TaskState::Completed);
    }
    state.verify_invariants();
}

#[test]
fn mapreduce_scales_into_idle_capacity() {
    let mut sim = make_sim(
        r#"
experiment_name: opportunistic_scale
cluster:
  machines:
    - cpu_cores: 2
      memory_gb: 4.0
      count: 5
schedulers:
  - id: mapreduce-0
    type: mapreduce
    policy: max_parallelism
simulation:
  duration: 10.0
workload:
  enabled: false
"#,
    );

    let (job, tasks) = job_of(
        1,
        JobType::MapReduce,
        &[
            (1, 1, 0, 2., 20.),
            (2, 1, 0, 2., 20.),
            (3, 1, 0, 2., 20.),
            (4, 1, 0, 2., 20.),
        ],
    );
    sim.submit_job(job, tasks, 0.);
    let results = sim.run();

    // One incremental commit placed the 4 base tasks plus 6 clones.
    assert_eq!(results.cell_state.total_transactions, 1);
    assert_eq!(results.cell_state.total_commits, 1);
    assert_eq!(results.schedulers[0].tasks_scheduled, 10);

    let state = sim.cell_state();
    let state = state.borrow();
    assert_eq!(state.job(1).tasks.len(), 10);
    let resident: usize = state.machines_in_order().map(|m| m.tasks.len()).sum();
    assert_eq!(resident, 10);
    state.verify_invariants();
}

#[test]
fn zero_machines_fail_every_job_without_violations() {
    let mut sim = make_sim(
        r#"
experiment_name: empty_cluster
cluster:
  num_machines: 0
schedulers:
  - id: batch-0
    type: batch
simulation:
  duration: 10.0
workload:
  enabled: false
"#,
    );

    let (job, tasks) = job_of(1, JobType::Batch, &[(1, 1, 0, 1., 10.)]);
    sim.submit_job(job, tasks, 0.);
    let results = sim.run();

    assert_eq!(results.failed_jobs, 1);
    assert_eq!(results.completed_jobs, 0);
    sim.cell_state().borrow().verify_invariants();
}

const RANDOM_RUN_CONFIG: &str = r#"
experiment_name: random_run
seed: 42
cluster:
  num_machines: 20
  heterogeneous: true
  failure_domains: 4
schedulers:
  - id: batch-0
    type: batch
  - id: service-0
    type: service
  - id: mapreduce-0
    type: mapreduce
simulation:
  duration: 400.0
workload:
  batch_ratio: 0.8
  include_mapreduce: true
failures:
  enabled: true
  rate: 0.0001
  recovery_mean: 60.0
"#;

#[test]
fn random_workload_run_holds_invariants() {
    let mut sim = make_sim(RANDOM_RUN_CONFIG);
    let results = sim.run();

    assert!(results.cell_state.total_transactions > 0);
    assert!(results.schedulers.iter().any(|s| s.tasks_scheduled > 0));
    sim.cell_state().borrow().verify_invariants();
}

#[test]
fn identical_seeds_give_identical_runs() {
    let run = || {
        let mut sim = make_sim(RANDOM_RUN_CONFIG);
        let results = sim.run();
        (
            results.completed_jobs,
            results.failed_jobs,
            results.cell_state.total_transactions,
            results.cell_state.total_commits,
            results.cell_state.total_conflicts,
        )
    };
    assert_eq!(run(), run());
}

use dslab_core::Simulation;

use omegasim::config::sim_config::WorkloadConfig;
use omegasim::job::JobType;
use omegasim::workload_generators::generator::{GeneratedJob, WorkloadGenerator};
use omegasim::workload_generators::random::RandomWorkloadGenerator;

fn generate(seed: u64, horizon: f64, config: &WorkloadConfig) -> Vec<GeneratedJob> {
    let mut sim = Simulation::new(seed);
    let ctx = sim.create_context("workload");
    RandomWorkloadGenerator::from_config(config).generate(&ctx, horizon)
}

#[test]
fn same_seed_gives_the_same_workload() {
    let config = WorkloadConfig::default();
    let first = generate(42, 1000., &config);
    let second = generate(42, 1000., &config);

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.arrival_time, b.arrival_time);
        assert_eq!(a.job.job_type, b.job.job_type);
        assert_eq!(a.tasks.len(), b.tasks.len());
        for (x, y) in a.tasks.iter().zip(b.tasks.iter()) {
            assert_eq!(x.requirement, y.requirement);
            assert_eq!(x.duration, y.duration);
        }
    }
}

#[test]
fn generated_tasks_respect_the_clamps() {
    let config = WorkloadConfig::default();
    let jobs = generate(7, 2000., &config);
    assert!(!jobs.is_empty());

    for entry in &jobs {
        assert!(!entry.tasks.is_empty());
        assert!(entry.tasks.len() <= 1000);
        for task in &entry.tasks {
            assert!(task.requirement.cpu >= 1);
            assert!(task.requirement.memory >= 0.5);
            assert!(task.duration >= 1.);
        }
    }
}

#[test]
fn arrivals_are_sorted_and_mostly_batch() {
    let config = WorkloadConfig::default();
    let jobs = generate(42, 20000., &config);

    for window in jobs.windows(2) {
        assert!(window[0].arrival_time <= window[1].arrival_time);
    }

    let batch = jobs
        .iter()
        .filter(|j| j.job.job_type == JobType::Batch)
        .count() as f64;
    let ratio = batch / jobs.len() as f64;
    assert!((ratio - 0.8).abs() < 0.1, "batch ratio was {}", ratio);
}

#[test]
fn mapreduce_jobs_are_two_stage_dags() {
    let config = WorkloadConfig {
        include_mapreduce: true,
        ..WorkloadConfig::default()
    };
    let jobs = generate(42, 20000., &config);

    let mapreduce: Vec<&GeneratedJob> = jobs
        .iter()
        .filter(|j| j.job.job_type == JobType::MapReduce)
        .collect();
    assert!(!mapreduce.is_empty());

    for entry in mapreduce {
        let maps: Vec<u64> = entry
            .tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.id)
            .collect();
        let reduces: Vec<&omegasim::Task> = entry
            .tasks
            .iter()
            .filter(|t| !t.dependencies.is_empty())
            .collect();
        assert!(!maps.is_empty());
        assert!(!reduces.is_empty());
        for reduce in reduces {
            for map_id in &maps {
                assert!(reduce.dependencies.contains(map_id));
            }
        }
    }
}

#[test]
fn service_jobs_occasionally_request_gang_placement() {
    let config = WorkloadConfig {
        batch_ratio: 0.,
        gang_fraction: 0.5,
        ..WorkloadConfig::default()
    };
    let jobs = generate(42, 20000., &config);
    assert!(jobs.iter().any(|j| j.job.gang_schedule));
    assert!(jobs.iter().any(|j| !j.job.gang_schedule));
}

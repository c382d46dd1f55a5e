use dslab_core::SimulationContext;
use rand_distr::{Exp, LogNormal, Normal};
use serde::{Deserialize, Serialize};

use crate::config::sim_config::{JobClassOverrides, WorkloadConfig};
use crate::job::{Job, JobId, JobType, Task, TaskId};
use crate::resources::ResourceVector;

use super::generator::{GeneratedJob, WorkloadGenerator};

const MAX_TASKS_PER_JOB: u64 = 1000;

/// Distribution parameters for one job class, following empirical shapes
/// observed in production cluster traces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobClassParams {
    pub task_count_mean: f64,
    pub task_count_std: f64,
    pub duration_mean: f64,
    pub duration_std: f64,
    pub cpu_mean: f64,
    pub cpu_std: f64,
    pub memory_mean: f64,
    pub memory_std: f64,
    pub interarrival_mean: f64,
    pub gpu_fraction: f64,
    pub gpu_max: u32,
    pub priority_min: u32,
    pub priority_max: u32,
}

impl JobClassParams {
    pub fn batch() -> Self {
        Self {
            task_count_mean: 10.,
            task_count_std: 50.,
            duration_mean: 300.,
            duration_std: 600.,
            cpu_mean: 2.,
            cpu_std: 1.,
            memory_mean: 4.,
            memory_std: 2.,
            interarrival_mean: 10.,
            gpu_fraction: 0.1,
            gpu_max: 1,
            priority_min: 1,
            priority_max: 5,
        }
    }

    pub fn service() -> Self {
        Self {
            task_count_mean: 5.,
            task_count_std: 10.,
            duration_mean: 86400.,
            duration_std: 43200.,
            cpu_mean: 4.,
            cpu_std: 2.,
            memory_mean: 8.,
            memory_std: 4.,
            interarrival_mean: 60.,
            gpu_fraction: 0.05,
            gpu_max: 2,
            priority_min: 5,
            priority_max: 10,
        }
    }

    pub fn mapreduce() -> Self {
        Self {
            interarrival_mean: 120.,
            gpu_fraction: 0.,
            ..Self::batch()
        }
    }

    fn apply_overrides(&mut self, overrides: &JobClassOverrides) {
        let fields = [
            (&mut self.task_count_mean, overrides.task_count_mean),
            (&mut self.task_count_std, overrides.task_count_std),
            (&mut self.duration_mean, overrides.duration_mean),
            (&mut self.duration_std, overrides.duration_std),
            (&mut self.cpu_mean, overrides.cpu_mean),
            (&mut self.cpu_std, overrides.cpu_std),
            (&mut self.memory_mean, overrides.memory_mean),
            (&mut self.memory_std, overrides.memory_std),
            (&mut self.gpu_fraction, overrides.gpu_fraction),
        ];
        for (field, value) in fields {
            if let Some(value) = value {
                *field = value;
            }
        }
    }
}

/// Synthetic workload: one Poisson arrival stream drawing the job type per
/// arrival (batch vs service by `batch_ratio`, inter-arrival time of the
/// drawn type), plus an independent stream of two-stage MapReduce DAGs when
/// enabled. Task counts are truncated log-normals, durations log-normals,
/// resource demands clamped normals.
pub struct RandomWorkloadGenerator {
    batch: JobClassParams,
    service: JobClassParams,
    mapreduce: JobClassParams,
    batch_ratio: f64,
    include_mapreduce: bool,
    gang_fraction: f64,
    no_colocation_fraction: f64,

    next_job_id: JobId,
    next_task_id: TaskId,
}

impl RandomWorkloadGenerator {
    pub fn from_config(config: &WorkloadConfig) -> Self {
        let mut batch = JobClassParams::batch();
        batch.interarrival_mean = config.arrival_rate_batch;
        if let Some(overrides) = &config.batch_overrides {
            batch.apply_overrides(overrides);
        }
        let mut service = JobClassParams::service();
        service.interarrival_mean = config.arrival_rate_service;
        if let Some(overrides) = &config.service_overrides {
            service.apply_overrides(overrides);
        }
        let mut mapreduce = JobClassParams::mapreduce();
        mapreduce.interarrival_mean = config.arrival_rate_mapreduce;
        if let Some(overrides) = &config.mapreduce_overrides {
            mapreduce.apply_overrides(overrides);
        }

        Self {
            batch,
            service,
            mapreduce,
            batch_ratio: config.batch_ratio,
            include_mapreduce: config.include_mapreduce,
            gang_fraction: config.gang_fraction,
            no_colocation_fraction: config.no_colocation_fraction,
            next_job_id: 0,
            next_task_id: 0,
        }
    }

    fn sample_task_count(&self, ctx: &SimulationContext, params: &JobClassParams) -> u64 {
        let distribution =
            LogNormal::new(params.task_count_mean.ln(), (params.task_count_std + 1.).ln()).unwrap();
        (ctx.sample_from_distribution(&distribution) as u64).clamp(1, MAX_TASKS_PER_JOB)
    }

    fn generate_task(
        &mut self,
        ctx: &SimulationContext,
        job_id: JobId,
        params: &JobClassParams,
    ) -> Task {
        let cpu_distribution = Normal::new(params.cpu_mean, params.cpu_std).unwrap();
        let cpu = (ctx.sample_from_distribution(&cpu_distribution).round() as i64).max(1) as u32;

        let memory_distribution = Normal::new(params.memory_mean, params.memory_std).unwrap();
        let memory = ctx.sample_from_distribution(&memory_distribution).max(0.5);

        let gpu = if params.gpu_fraction > 0. && ctx.rand() < params.gpu_fraction {
            ctx.gen_range(1..=params.gpu_max.max(1))
        } else {
            0
        };

        let duration_distribution =
            LogNormal::new(params.duration_mean.ln(), (params.duration_std + 1.).ln()).unwrap();
        let duration = ctx.sample_from_distribution(&duration_distribution).max(1.);

        let task = Task::new(
            self.next_task_id,
            job_id,
            ResourceVector::new(cpu, gpu, memory),
            duration,
        );
        self.next_task_id += 1;
        task
    }

    fn generate_job(
        &mut self,
        ctx: &SimulationContext,
        job_type: JobType,
        submit_time: f64,
    ) -> GeneratedJob {
        let params = match job_type {
            JobType::Batch => self.batch.clone(),
            JobType::Service => self.service.clone(),
            JobType::MapReduce => self.mapreduce.clone(),
        };
        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let priority = ctx.gen_range(params.priority_min..=params.priority_max);
        let mut job = Job::new(job_id, job_type, priority, submit_time);
        if job_type == JobType::Service {
            job.gang_schedule = ctx.rand() < self.gang_fraction;
            job.no_colocation = ctx.rand() < self.no_colocation_fraction;
        }

        let task_count = self.sample_task_count(ctx, &params);
        let mut tasks = Vec::with_capacity(task_count as usize);
        for _ in 0..task_count {
            let task = self.generate_task(ctx, job_id, &params);
            job.tasks.push(task.id);
            tasks.push(task);
        }

        GeneratedJob {
            arrival_time: submit_time,
            job,
            tasks,
        }
    }

    /// Two stages: reduce tasks depend on every map task.
    fn generate_dag_job(&mut self, ctx: &SimulationContext, submit_time: f64) -> GeneratedJob {
        let params = self.mapreduce.clone();
        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let priority = ctx.gen_range(params.priority_min..=params.priority_max);
        let mut job = Job::new(job_id, JobType::MapReduce, priority, submit_time);

        let stage_distribution = LogNormal::new(2., 1.).unwrap();
        let map_count = (ctx.sample_from_distribution(&stage_distribution) as u64).max(1);
        let reduce_count = (ctx.sample_from_distribution(&stage_distribution) as u64).max(1);

        let mut tasks = Vec::with_capacity((map_count + reduce_count) as usize);
        let mut map_ids = Vec::with_capacity(map_count as usize);
        for _ in 0..map_count {
            let task = self.generate_task(ctx, job_id, &params);
            map_ids.push(task.id);
            job.tasks.push(task.id);
            tasks.push(task);
        }
        for _ in 0..reduce_count {
            let task = self
                .generate_task(ctx, job_id, &params)
                .with_dependencies(map_ids.iter().copied());
            job.tasks.push(task.id);
            tasks.push(task);
        }

        GeneratedJob {
            arrival_time: submit_time,
            job,
            tasks,
        }
    }
}

impl WorkloadGenerator for RandomWorkloadGenerator {
    fn generate(&mut self, ctx: &SimulationContext, horizon: f64) -> Vec<GeneratedJob> {
        let mut jobs = Vec::new();

        let mut time = 0.;
        while time < horizon {
            let job_type = if ctx.rand() < self.batch_ratio {
                JobType::Batch
            } else {
                JobType::Service
            };
            jobs.push(self.generate_job(ctx, job_type, time));

            let interarrival_mean = match job_type {
                JobType::Batch => self.batch.interarrival_mean,
                _ => self.service.interarrival_mean,
            };
            time += ctx.sample_from_distribution(&Exp::new(1. / interarrival_mean).unwrap());
        }

        if self.include_mapreduce {
            let interarrival = Exp::new(1. / self.mapreduce.interarrival_mean).unwrap();
            let mut time = ctx.sample_from_distribution(&interarrival);
            while time < horizon {
                jobs.push(self.generate_dag_job(ctx, time));
                time += ctx.sample_from_distribution(&interarrival);
            }
        }

        jobs.sort_by(|a, b| a.arrival_time.total_cmp(&b.arrival_time));
        jobs
    }
}

use serde::Serialize;

use crate::cell_state::Utilization;
use crate::job::{Job, JobId, JobType};
use crate::resources::ResourceVector;

/// Piecewise-constant load integrated over virtual time. Each `update`
/// closes the interval since the previous update at the old level; the
/// average is the integral divided by elapsed time and capacity.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ResourceLoad {
    total: f64,
    consumed: f64,
    previous_update: f64,
    previous_update_time: f64,
}

impl ResourceLoad {
    pub fn new(total: f64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn extend(&mut self, amount: f64) {
        self.total += amount;
    }

    pub fn update(&mut self, current_value: f64, time: f64) {
        self.consumed += self.previous_update * (time - self.previous_update_time);
        self.previous_update = current_value;
        self.previous_update_time = time;
    }

    pub fn average_fraction(&self, time: f64) -> f64 {
        if time <= 0. || self.total <= 0. {
            return 0.;
        }
        let consumed = self.consumed + self.previous_update * (time - self.previous_update_time);
        consumed / time / self.total
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobTrace {
    pub id: JobId,
    pub job_type: JobType,
    pub submit_time: f64,
    pub finished_at: f64,
    pub tasks: usize,
    pub failed: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct SchedulerResults {
    pub id: String,
    pub jobs_scheduled: u64,
    pub tasks_scheduled: u64,
    pub conflicts: u64,
    pub conflict_rate: f64,
    pub busy_time: f64,
    pub avg_wait_time: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CellResults {
    pub total_transactions: u64,
    pub total_commits: u64,
    pub total_conflicts: u64,
    pub conflict_rate: f64,
    pub utilization: Utilization,
}

#[derive(Clone, Debug, Serialize)]
pub struct SimulationResults {
    pub experiment_name: String,
    pub simulation_time: f64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub machine_failures: u64,
    pub machine_recoveries: u64,
    pub schedulers: Vec<SchedulerResults>,
    pub cell_state: CellResults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<JobTrace>>,
}

/// Run-wide observability: time-weighted utilization plus job and failure
/// counters. Fed by the cell on every state mutation.
pub struct Monitoring {
    cpu: ResourceLoad,
    gpu: ResourceLoad,
    memory: ResourceLoad,

    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub machine_failures: u64,
    pub machine_recoveries: u64,

    collect_traces: bool,
    traces: Vec<JobTrace>,
}

impl Monitoring {
    pub fn new(collect_traces: bool) -> Self {
        Self {
            cpu: ResourceLoad::default(),
            gpu: ResourceLoad::default(),
            memory: ResourceLoad::default(),
            completed_jobs: 0,
            failed_jobs: 0,
            machine_failures: 0,
            machine_recoveries: 0,
            collect_traces,
            traces: Vec::new(),
        }
    }

    pub fn register_capacity(&mut self, capacity: &ResourceVector) {
        self.cpu.extend(capacity.cpu as f64);
        self.gpu.extend(capacity.gpu as f64);
        self.memory.extend(capacity.memory);
    }

    pub fn update_usage(&mut self, time: f64, used: &ResourceVector) {
        self.cpu.update(used.cpu as f64, time);
        self.gpu.update(used.gpu as f64, time);
        self.memory.update(used.memory, time);
    }

    pub fn job_completed(&mut self, job: &Job, time: f64) {
        self.completed_jobs += 1;
        self.record_trace(job, time, false);
    }

    pub fn job_failed(&mut self, job: &Job, time: f64) {
        self.failed_jobs += 1;
        self.record_trace(job, time, true);
    }

    fn record_trace(&mut self, job: &Job, time: f64, failed: bool) {
        if self.collect_traces {
            self.traces.push(JobTrace {
                id: job.id,
                job_type: job.job_type,
                submit_time: job.submit_time,
                finished_at: time,
                tasks: job.tasks.len(),
                failed,
            });
        }
    }

    pub fn utilization(&self, time: f64) -> Utilization {
        Utilization {
            cpu: self.cpu.average_fraction(time),
            gpu: self.gpu.average_fraction(time),
            memory: self.memory.average_fraction(time),
        }
    }

    pub fn take_traces(&mut self) -> Option<Vec<JobTrace>> {
        if self.collect_traces {
            Some(std::mem::take(&mut self.traces))
        } else {
            None
        }
    }
}

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::cell_state::MachineId;
use crate::resources::ResourceVector;

pub type JobId = u64;
pub type TaskId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Batch,
    Service,
    MapReduce,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub requirement: ResourceVector,
    pub duration: f64,
    pub state: TaskState,
    pub machine_id: Option<MachineId>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub dependencies: FxHashSet<TaskId>,
}

impl Task {
    pub fn new(id: TaskId, job_id: JobId, requirement: ResourceVector, duration: f64) -> Self {
        Self {
            id,
            job_id,
            requirement,
            duration,
            state: TaskState::Pending,
            machine_id: None,
            start_time: None,
            end_time: None,
            dependencies: FxHashSet::default(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn is_placed(&self) -> bool {
        self.machine_id.is_some()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub priority: u32,
    pub submit_time: f64,
    pub tasks: Vec<TaskId>,
    /// All-or-nothing placement: the whole job commits as one gang
    /// transaction or not at all.
    pub gang_schedule: bool,
    /// Hard anti-affinity: no two tasks of this job on the same machine.
    pub no_colocation: bool,
}

impl Job {
    pub fn new(id: JobId, job_type: JobType, priority: u32, submit_time: f64) -> Self {
        Self {
            id,
            job_type,
            priority,
            submit_time,
            tasks: Vec::new(),
            gang_schedule: false,
            no_colocation: false,
        }
    }
}

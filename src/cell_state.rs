use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::job::{Job, JobId, Task, TaskId, TaskState};
use crate::resources::{ResourceVector, MEMORY_EPSILON};
use crate::transaction::{
    CommitMode, Outcome, PlacementOutcome, RejectReason, Transaction, TransactionResult,
};

pub type MachineId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Healthy,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct Machine {
    pub id: MachineId,
    pub machine_type: String,
    pub capacity: ResourceVector,
    pub allocated: ResourceVector,
    pub tasks: FxHashSet<TaskId>,
    pub version: u64,
    pub failure_domain: u32,
    pub state: MachineState,
}

impl Machine {
    pub fn new(
        id: MachineId,
        machine_type: impl Into<String>,
        capacity: ResourceVector,
        failure_domain: u32,
    ) -> Self {
        Self {
            id,
            machine_type: machine_type.into(),
            capacity,
            allocated: ResourceVector::default(),
            tasks: FxHashSet::default(),
            version: 0,
            failure_domain,
            state: MachineState::Healthy,
        }
    }

    pub fn available(&self) -> ResourceVector {
        let mut available = self.capacity;
        available.subtract(&self.allocated);
        available
    }

    pub fn can_fit(&self, requirement: &ResourceVector) -> bool {
        requirement.fits_into(&self.available())
    }
}

/// Point-in-time view of one machine inside a [`Snapshot`].
#[derive(Clone, Debug)]
pub struct MachineView {
    pub id: MachineId,
    pub capacity: ResourceVector,
    pub allocated: ResourceVector,
    pub version: u64,
    pub failure_domain: u32,
    pub state: MachineState,
    pub tasks: FxHashSet<TaskId>,
}

impl MachineView {
    pub fn available(&self) -> ResourceVector {
        let mut available = self.capacity;
        available.subtract(&self.allocated);
        available
    }

    pub fn can_fit(&self, requirement: &ResourceVector) -> bool {
        self.state == MachineState::Healthy && requirement.fits_into(&self.available())
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct Utilization {
    pub cpu: f64,
    pub gpu: f64,
    pub memory: f64,
}

/// Consistent read-only view of the cell. Machines are ordered by id so
/// every planning pass over a snapshot is deterministic.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub cell_version: u64,
    machines: Vec<MachineView>,
}

impl Snapshot {
    pub fn machines(&self) -> &[MachineView] {
        &self.machines
    }

    pub fn machine(&self, id: MachineId) -> Option<&MachineView> {
        self.machines
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|idx| &self.machines[idx])
    }

    /// Whether any healthy machine could hold the requirement on an empty
    /// allocation. Used to detect jobs that can never be placed.
    pub fn could_ever_fit(&self, requirement: &ResourceVector) -> bool {
        self.machines
            .iter()
            .any(|m| m.state == MachineState::Healthy && requirement.fits_into(&m.capacity))
    }

    pub fn total_available(&self) -> ResourceVector {
        let mut total = ResourceVector::default();
        for machine in &self.machines {
            if machine.state == MachineState::Healthy {
                total.add(&machine.available());
            }
        }
        total
    }

    pub fn utilization(&self) -> Utilization {
        let mut capacity = ResourceVector::default();
        let mut allocated = ResourceVector::default();
        for machine in &self.machines {
            capacity.add(&machine.capacity);
            allocated.add(&machine.allocated);
        }
        fraction(&allocated, &capacity)
    }
}

fn fraction(used: &ResourceVector, total: &ResourceVector) -> Utilization {
    let safe_div = |used: f64, total: f64| if total > 0. { used / total } else { 0. };
    Utilization {
        cpu: safe_div(used.cpu as f64, total.cpu as f64),
        gpu: safe_div(used.gpu as f64, total.gpu as f64),
        memory: safe_div(used.memory, total.memory),
    }
}

/// Authoritative cluster state shared by all schedulers.
///
/// Schedulers read consistent snapshots and submit transactions; conflicts
/// are detected per machine through version numbers, so one stale placement
/// never invalidates independent placements of the same incremental commit.
pub struct CellState {
    machines: FxHashMap<MachineId, Machine>,
    machine_order: Vec<MachineId>,
    jobs: FxHashMap<JobId, Job>,
    tasks: FxHashMap<TaskId, Task>,
    cell_version: u64,
    next_task_id: TaskId,

    pub total_transactions: u64,
    pub total_commits: u64,
    pub total_conflicts: u64,
}

impl Default for CellState {
    fn default() -> Self {
        Self::new()
    }
}

impl CellState {
    pub fn new() -> Self {
        Self {
            machines: FxHashMap::default(),
            machine_order: Vec::new(),
            jobs: FxHashMap::default(),
            tasks: FxHashMap::default(),
            cell_version: 0,
            next_task_id: 0,
            total_transactions: 0,
            total_commits: 0,
            total_conflicts: 0,
        }
    }

    pub fn cell_version(&self) -> u64 {
        self.cell_version
    }

    pub fn add_machine(&mut self, machine: Machine) {
        let id = machine.id;
        assert!(
            self.machines.insert(id, machine).is_none(),
            "machine {} registered twice",
            id
        );
        let pos = self.machine_order.partition_point(|&m| m < id);
        self.machine_order.insert(pos, id);
    }

    pub fn machine(&self, id: MachineId) -> &Machine {
        self.machines
            .get(&id)
            .unwrap_or_else(|| panic!("unknown machine {}", id))
    }

    pub fn machines_in_order(&self) -> impl Iterator<Item = &Machine> {
        self.machine_order.iter().map(|id| &self.machines[id])
    }

    pub fn machine_count(&self) -> usize {
        self.machine_order.len()
    }

    pub fn healthy_machine_ids(&self) -> Vec<MachineId> {
        self.machine_order
            .iter()
            .copied()
            .filter(|id| self.machines[id].state == MachineState::Healthy)
            .collect()
    }

    pub fn add_job(&mut self, job: Job, tasks: Vec<Task>) {
        for task in tasks {
            assert_eq!(task.job_id, job.id, "task {} belongs to another job", task.id);
            self.next_task_id = self.next_task_id.max(task.id + 1);
            self.tasks.insert(task.id, task);
        }
        self.jobs.insert(job.id, job);
    }

    pub fn job(&self, id: JobId) -> &Job {
        self.jobs
            .get(&id)
            .unwrap_or_else(|| panic!("unknown job {}", id))
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn task(&self, id: TaskId) -> &Task {
        self.tasks
            .get(&id)
            .unwrap_or_else(|| panic!("unknown task {}", id))
    }

    pub fn pending_tasks(&self, job_id: JobId) -> Vec<Task> {
        self.job(job_id)
            .tasks
            .iter()
            .map(|id| self.task(*id))
            .filter(|t| t.state == TaskState::Pending)
            .cloned()
            .collect()
    }

    pub fn job_fully_scheduled(&self, job_id: JobId) -> bool {
        self.job(job_id)
            .tasks
            .iter()
            .all(|id| self.task(*id).state != TaskState::Pending)
    }

    pub fn job_completed(&self, job_id: JobId) -> bool {
        self.job(job_id)
            .tasks
            .iter()
            .all(|id| self.task(*id).state == TaskState::Completed)
    }

    pub fn snapshot(&self) -> Snapshot {
        let machines = self
            .machine_order
            .iter()
            .map(|id| {
                let m = &self.machines[id];
                MachineView {
                    id: m.id,
                    capacity: m.capacity,
                    allocated: m.allocated,
                    version: m.version,
                    failure_domain: m.failure_domain,
                    state: m.state,
                    tasks: m.tasks.clone(),
                }
            })
            .collect();
        Snapshot {
            cell_version: self.cell_version,
            machines,
        }
    }

    /// Validate and apply a transaction atomically.
    ///
    /// Validation runs placement by placement, in order, against the current
    /// machine versions plus a tentative overlay so sibling placements see
    /// each other's demand. Application happens only after the whole
    /// transaction is validated; each applied placement bumps its machine's
    /// version by one, and the cell version moves once per commit that
    /// applied anything.
    pub fn commit(&mut self, transaction: &Transaction) -> TransactionResult {
        self.total_transactions += 1;

        let mut tentative_alloc: FxHashMap<MachineId, ResourceVector> = FxHashMap::default();
        let mut tentative_tasks: FxHashSet<TaskId> = FxHashSet::default();

        let mut outcomes = Vec::with_capacity(transaction.placements.len());
        for p in &transaction.placements {
            let requirement = self.task(p.task_id).requirement;
            let outcome = self.validate_placement(
                p.machine_id,
                p.expected_version,
                &requirement,
                Some(p.task_id),
                &mut tentative_alloc,
                &mut tentative_tasks,
            );
            outcomes.push(PlacementOutcome {
                task_id: p.task_id,
                machine_id: p.machine_id,
                outcome,
            });
        }

        let mut spawned_outcomes = Vec::with_capacity(transaction.spawned.len());
        for s in &transaction.spawned {
            let requirement = self.task(s.template_task_id).requirement;
            let outcome = self.validate_placement(
                s.machine_id,
                s.expected_version,
                &requirement,
                None,
                &mut tentative_alloc,
                &mut tentative_tasks,
            );
            spawned_outcomes.push(PlacementOutcome {
                task_id: s.template_task_id,
                machine_id: s.machine_id,
                outcome,
            });
        }

        let rejected = outcomes
            .iter()
            .chain(spawned_outcomes.iter())
            .filter(|o| matches!(o.outcome, Outcome::Rejected(_)))
            .count() as u64;
        self.total_conflicts += rejected;

        if transaction.mode == CommitMode::Gang && rejected > 0 {
            for outcome in outcomes.iter_mut().chain(spawned_outcomes.iter_mut()) {
                if outcome.outcome.is_accepted() {
                    outcome.outcome = Outcome::GangAborted;
                }
            }
            return TransactionResult {
                scheduler: transaction.scheduler.clone(),
                mode: transaction.mode,
                outcomes,
                spawned_outcomes,
                committed: false,
            };
        }

        let mut applied = 0;
        for outcome in &outcomes {
            if outcome.outcome.is_accepted() {
                self.apply_placement(outcome.task_id, outcome.machine_id);
                applied += 1;
            }
        }
        for outcome in &mut spawned_outcomes {
            if outcome.outcome.is_accepted() {
                outcome.task_id = self.spawn_clone(outcome.task_id, outcome.machine_id);
                applied += 1;
            }
        }

        if applied > 0 {
            self.cell_version += 1;
            self.total_commits += 1;
        }

        TransactionResult {
            scheduler: transaction.scheduler.clone(),
            mode: transaction.mode,
            outcomes,
            spawned_outcomes,
            committed: applied > 0,
        }
    }

    fn validate_placement(
        &self,
        machine_id: MachineId,
        expected_version: u64,
        requirement: &ResourceVector,
        task_id: Option<TaskId>,
        tentative_alloc: &mut FxHashMap<MachineId, ResourceVector>,
        tentative_tasks: &mut FxHashSet<TaskId>,
    ) -> Outcome {
        let machine = match self.machines.get(&machine_id) {
            Some(m) if m.state == MachineState::Healthy => m,
            _ => return Outcome::Rejected(RejectReason::MachineFailed),
        };
        if machine.version != expected_version {
            return Outcome::Rejected(RejectReason::VersionStale);
        }
        if let Some(task_id) = task_id {
            if self.task(task_id).is_placed() || tentative_tasks.contains(&task_id) {
                return Outcome::Rejected(RejectReason::DuplicateTask);
            }
        }

        let mut demand = machine.allocated;
        if let Some(tentative) = tentative_alloc.get(&machine_id) {
            demand.add(tentative);
        }
        demand.add(requirement);
        if !demand.fits_into(&machine.capacity) {
            return Outcome::Rejected(RejectReason::InsufficientResources);
        }

        tentative_alloc
            .entry(machine_id)
            .or_default()
            .add(requirement);
        if let Some(task_id) = task_id {
            tentative_tasks.insert(task_id);
        }
        Outcome::Accepted
    }

    fn apply_placement(&mut self, task_id: TaskId, machine_id: MachineId) {
        let task = self
            .tasks
            .get_mut(&task_id)
            .unwrap_or_else(|| panic!("unknown task {}", task_id));
        let requirement = task.requirement;
        task.machine_id = Some(machine_id);
        task.state = TaskState::Scheduled;

        let machine = self
            .machines
            .get_mut(&machine_id)
            .unwrap_or_else(|| panic!("task {} placed on nonexistent machine {}", task_id, machine_id));
        machine.allocated.add(&requirement);
        machine.tasks.insert(task_id);
        machine.version += 1;

        if !machine.allocated.fits_into(&machine.capacity) {
            panic!(
                "invariant violation: machine {} over-allocated ({:?} of {:?}) placing task {}",
                machine_id, machine.allocated, machine.capacity, task_id
            );
        }
    }

    /// Materialize an opportunistic clone of `template_id` and place it.
    /// Tasks that depended on the template (reduce stages) also wait for the
    /// clone.
    fn spawn_clone(&mut self, template_id: TaskId, machine_id: MachineId) -> TaskId {
        let template = self.task(template_id).clone();
        let clone_id = self.next_task_id;
        self.next_task_id += 1;
        let clone = Task::new(clone_id, template.job_id, template.requirement, template.duration)
            .with_dependencies(template.dependencies.iter().copied());
        let job_id = template.job_id;

        let job = self
            .jobs
            .get_mut(&job_id)
            .unwrap_or_else(|| panic!("unknown job {}", job_id));
        job.tasks.push(clone_id);
        let sibling_ids = job.tasks.clone();
        for sibling in sibling_ids {
            if let Some(task) = self.tasks.get_mut(&sibling) {
                if task.dependencies.contains(&template_id) {
                    task.dependencies.insert(clone_id);
                }
            }
        }

        self.tasks.insert(clone_id, clone);
        self.apply_placement(clone_id, machine_id);
        clone_id
    }

    /// Free the task's machine share and record its final state. Idempotent:
    /// releasing a task that holds no machine is a no-op.
    pub fn release(&mut self, task_id: TaskId, time: f64, final_state: TaskState) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        let Some(machine_id) = task.machine_id else {
            return false;
        };
        let requirement = task.requirement;
        task.machine_id = None;
        task.state = final_state;
        task.end_time = Some(time);

        let machine = self
            .machines
            .get_mut(&machine_id)
            .unwrap_or_else(|| panic!("task {} held nonexistent machine {}", task_id, machine_id));
        machine.allocated.subtract(&requirement);
        machine.tasks.remove(&task_id);
        machine.version += 1;
        true
    }

    pub fn mark_task_running(&mut self, task_id: TaskId, time: f64) {
        let task = self
            .tasks
            .get_mut(&task_id)
            .unwrap_or_else(|| panic!("unknown task {}", task_id));
        task.state = TaskState::Running;
        task.start_time = Some(time);
    }

    pub fn task_ready(&self, task_id: TaskId) -> bool {
        self.task(task_id)
            .dependencies
            .iter()
            .all(|dep| self.task(*dep).state == TaskState::Completed)
    }

    /// Scheduled siblings that became runnable because `completed_id`
    /// finished.
    pub fn newly_ready_tasks(&self, completed_id: TaskId) -> Vec<TaskId> {
        let job = self.job(self.task(completed_id).job_id);
        job.tasks
            .iter()
            .copied()
            .filter(|id| {
                let task = self.task(*id);
                task.state == TaskState::Scheduled
                    && task.dependencies.contains(&completed_id)
                    && self.task_ready(*id)
            })
            .collect()
    }

    /// Take the machine out of service and fail everything resident on it.
    /// Returns the failed task ids in ascending order.
    pub fn fail_machine(&mut self, machine_id: MachineId, time: f64) -> Vec<TaskId> {
        let machine = self
            .machines
            .get_mut(&machine_id)
            .unwrap_or_else(|| panic!("unknown machine {}", machine_id));
        if machine.state == MachineState::Failed {
            return Vec::new();
        }
        machine.state = MachineState::Failed;
        let mut resident: Vec<TaskId> = machine.tasks.iter().copied().collect();
        resident.sort_unstable();

        for task_id in &resident {
            self.release(*task_id, time, TaskState::Failed);
        }
        self.machines.get_mut(&machine_id).unwrap().version += 1;
        resident
    }

    /// Bring a failed machine back empty. The version keeps increasing
    /// monotonically across the failure.
    pub fn recover_machine(&mut self, machine_id: MachineId) {
        let machine = self
            .machines
            .get_mut(&machine_id)
            .unwrap_or_else(|| panic!("unknown machine {}", machine_id));
        machine.state = MachineState::Healthy;
        machine.allocated = ResourceVector::default();
        machine.tasks.clear();
        machine.version += 1;
    }

    /// Put the failed tasks of a job back on the market so the scheduler can
    /// re-place them.
    pub fn requeue_failed_tasks(&mut self, job_id: JobId) {
        let task_ids = self.job(job_id).tasks.clone();
        for task_id in task_ids {
            let task = self.tasks.get_mut(&task_id).unwrap();
            if task.state == TaskState::Failed {
                task.state = TaskState::Pending;
                task.machine_id = None;
                task.start_time = None;
                task.end_time = None;
            }
        }
    }

    /// Give up on a job: everything not yet placed is marked failed; tasks
    /// already running are left to finish.
    pub fn mark_job_failed(&mut self, job_id: JobId) {
        let task_ids = self.job(job_id).tasks.clone();
        for task_id in task_ids {
            let task = self.tasks.get_mut(&task_id).unwrap();
            if task.state == TaskState::Pending {
                task.state = TaskState::Failed;
            }
        }
    }

    pub fn allocated_total(&self) -> ResourceVector {
        let mut total = ResourceVector::default();
        for machine in self.machines.values() {
            total.add(&machine.allocated);
        }
        total
    }

    pub fn utilization(&self) -> Utilization {
        let mut capacity = ResourceVector::default();
        for machine in self.machines.values() {
            capacity.add(&machine.capacity);
        }
        fraction(&self.allocated_total(), &capacity)
    }

    pub fn conflict_rate(&self) -> f64 {
        if self.total_transactions > 0 {
            self.total_conflicts as f64 / self.total_transactions as f64
        } else {
            0.
        }
    }

    /// Full consistency audit. Panics with a diagnostic naming the offending
    /// machine or task; called from tests after every scenario step.
    pub fn verify_invariants(&self) {
        let mut seen: FxHashMap<TaskId, MachineId> = FxHashMap::default();
        for machine in self.machines.values() {
            let mut sum = ResourceVector::default();
            for task_id in &machine.tasks {
                let task = self.task(*task_id);
                assert_eq!(
                    task.machine_id,
                    Some(machine.id),
                    "task {} resident on machine {} does not point back",
                    task_id,
                    machine.id
                );
                if let Some(previous) = seen.insert(*task_id, machine.id) {
                    panic!(
                        "task {} resident on machines {} and {}",
                        task_id, previous, machine.id
                    );
                }
                sum.add(&task.requirement);
            }
            assert!(
                machine.allocated.fits_into(&machine.capacity),
                "machine {} allocated {:?} exceeds capacity {:?}",
                machine.id,
                machine.allocated,
                machine.capacity
            );
            assert!(
                sum.cpu == machine.allocated.cpu
                    && sum.gpu == machine.allocated.gpu
                    && (sum.memory - machine.allocated.memory).abs() < MEMORY_EPSILON,
                "machine {} allocation {:?} does not match resident demand {:?}",
                machine.id,
                machine.allocated,
                sum
            );
        }
        for task in self.tasks.values() {
            if task.state == TaskState::Completed {
                assert!(
                    task.machine_id.is_none(),
                    "completed task {} still holds a machine",
                    task.id
                );
                let (start, end) = (task.start_time.unwrap(), task.end_time.unwrap());
                assert!(
                    (end - start - task.duration).abs() < MEMORY_EPSILON,
                    "task {} ran {} instead of {}",
                    task.id,
                    end - start,
                    task.duration
                );
            }
        }
    }
}

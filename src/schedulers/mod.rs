pub mod baseline;
pub mod batch;
pub mod mapreduce;
pub mod service;

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use dslab_core::{cast, log_debug, log_info, Event, EventHandler, Id, SimulationContext};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::cell::{AbandonJob, CommitTransaction, ResourcesReleased, TransactionCompleted};
use crate::cell_state::{CellState, MachineId, MachineView, Snapshot};
use crate::job::{Job, JobId, JobType, Task, TaskId};
use crate::monitoring::SchedulerResults;
use crate::proxy::JobArrival;
use crate::resources::ResourceVector;
use crate::transaction::{CommitMode, Outcome, RejectReason, Transaction, TransactionResult};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const RETRY_BACKOFF_BASE: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Batch,
    Service,
    #[serde(rename = "mapreduce")]
    MapReduce,
    Priority,
    WeightedRoundRobin,
    FirstFit,
    Random,
}

impl SchedulerKind {
    pub fn accepts(&self, job_type: JobType) -> bool {
        match self {
            SchedulerKind::Batch
            | SchedulerKind::WeightedRoundRobin
            | SchedulerKind::FirstFit
            | SchedulerKind::Random => job_type == JobType::Batch,
            SchedulerKind::Service | SchedulerKind::Priority => job_type == JobType::Service,
            SchedulerKind::MapReduce => job_type == JobType::MapReduce,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueDiscipline {
    Fifo,
    Priority,
}

/// Placement proposal built against a snapshot. `spawned` holds
/// opportunistic clone placements keyed by the template task.
#[derive(Debug, Default)]
pub struct Plan {
    pub placements: Vec<(TaskId, MachineId)>,
    pub spawned: Vec<(TaskId, MachineId)>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.spawned.is_empty()
    }
}

/// A placement policy: pure planning over a snapshot. Policies keep a local
/// tentative-allocation overlay during one plan so sibling tasks do not
/// over-commit a machine; the overlay dies with the plan.
pub trait SchedulerPolicy {
    fn kind(&self) -> SchedulerKind;

    fn queue_discipline(&self) -> QueueDiscipline {
        QueueDiscipline::Fifo
    }

    /// (per-job, per-task) decision latency for this policy, used unless the
    /// scheduler config overrides them.
    fn default_decision_times(&self) -> (f64, f64);

    fn plan(
        &mut self,
        job: &Job,
        tasks: &[Task],
        snapshot: &Snapshot,
        ctx: &SimulationContext,
    ) -> Plan;
}

pub(crate) fn available_with_overlay(
    view: &MachineView,
    overlay: &FxHashMap<MachineId, ResourceVector>,
) -> ResourceVector {
    let mut available = view.available();
    if let Some(reserved) = overlay.get(&view.id) {
        available.subtract(reserved);
    }
    available
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SchedulerStats {
    pub jobs_scheduled: u64,
    pub tasks_scheduled: u64,
    pub conflicts: u64,
    pub busy_time: f64,
    pub wait_time_sum: f64,
    pub wait_count: u64,
}

#[derive(Clone, Serialize)]
pub struct ScheduleActivation {}

#[derive(Clone, Serialize)]
pub struct SubmitPending {}

#[derive(Clone, Serialize)]
pub struct RetryCommit {}

struct PendingCommit {
    job_id: JobId,
    transaction: Transaction,
    attempt: u32,
}

/// One scheduler: a queue, a policy and the plan-commit loop.
///
/// An activation dequeues a job, reads a snapshot and plans immediately; the
/// commit is submitted `decision_time` later in virtual time, so other
/// schedulers' commits can land in between and the cell answers with
/// per-machine conflicts. Stale placements are retried with refreshed
/// versions under exponential backoff; capacity shortages park the job until
/// the cell signals released resources.
pub struct SchedulerActor {
    name: String,
    policy: Box<dyn SchedulerPolicy>,
    cell_state: Rc<RefCell<CellState>>,
    cell_id: Id,

    queue: VecDeque<JobId>,
    queued: FxHashSet<JobId>,
    busy: bool,
    pending: Option<PendingCommit>,

    max_retries: u32,
    require_gang: bool,
    decision_time_job: f64,
    decision_time_task: f64,
    boosted: FxHashSet<JobId>,
    counted_jobs: FxHashSet<JobId>,

    pub stats: SchedulerStats,
    ctx: SimulationContext,
}

impl SchedulerActor {
    pub fn new(
        name: impl Into<String>,
        policy: Box<dyn SchedulerPolicy>,
        cell_state: Rc<RefCell<CellState>>,
        cell_id: Id,
        max_retries: u32,
        require_gang: bool,
        decision_time_overrides: (Option<f64>, Option<f64>),
        ctx: SimulationContext,
    ) -> Self {
        let (default_job, default_task) = policy.default_decision_times();
        SchedulerActor {
            name: name.into(),
            policy,
            cell_state,
            cell_id,
            queue: VecDeque::new(),
            queued: FxHashSet::default(),
            busy: false,
            pending: None,
            max_retries,
            require_gang,
            decision_time_job: decision_time_overrides.0.unwrap_or(default_job),
            decision_time_task: decision_time_overrides.1.unwrap_or(default_task),
            boosted: FxHashSet::default(),
            counted_jobs: FxHashSet::default(),
            stats: SchedulerStats::default(),
            ctx,
        }
    }

    fn decision_time(&self, task_count: usize) -> f64 {
        self.decision_time_job + self.decision_time_task * task_count as f64
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SchedulerKind {
        self.policy.kind()
    }

    pub fn results(&self) -> SchedulerResults {
        let conflict_rate = if self.stats.tasks_scheduled > 0 {
            self.stats.conflicts as f64 / self.stats.tasks_scheduled as f64
        } else {
            0.
        };
        let avg_wait_time = if self.stats.wait_count > 0 {
            self.stats.wait_time_sum / self.stats.wait_count as f64
        } else {
            0.
        };
        SchedulerResults {
            id: self.name.clone(),
            jobs_scheduled: self.stats.jobs_scheduled,
            tasks_scheduled: self.stats.tasks_scheduled,
            conflicts: self.stats.conflicts,
            conflict_rate,
            busy_time: self.stats.busy_time,
            avg_wait_time,
        }
    }

    fn enqueue(&mut self, job_id: JobId) {
        if !self.queued.insert(job_id) {
            return;
        }
        match self.policy.queue_discipline() {
            QueueDiscipline::Fifo => self.queue.push_back(job_id),
            QueueDiscipline::Priority => {
                let state = self.cell_state.borrow();
                let priority = state.job(job_id).priority;
                let position = self
                    .queue
                    .iter()
                    .position(|other| state.job(*other).priority < priority)
                    .unwrap_or(self.queue.len());
                drop(state);
                self.queue.insert(position, job_id);
            }
        }
    }

    fn wake(&mut self) {
        if !self.busy && !self.queue.is_empty() {
            self.busy = true;
            self.ctx.emit_self_now(ScheduleActivation {});
        }
    }

    /// End the current cycle. Immediate re-activation only when the cycle
    /// made progress; a parked job waits for the next arrival or release.
    fn next_cycle(&mut self, progress: bool) {
        self.pending = None;
        if progress && !self.queue.is_empty() {
            self.ctx.emit_self_now(ScheduleActivation {});
        } else {
            self.busy = false;
        }
    }

    fn park(&mut self, job_id: JobId) {
        if self.queued.insert(job_id) {
            self.queue.push_back(job_id);
        }
        self.next_cycle(false);
    }

    fn effective_max_retries(&self, job_id: JobId) -> u32 {
        if self.boosted.contains(&job_id) {
            self.max_retries * 2
        } else {
            self.max_retries
        }
    }

    fn on_activation(&mut self) {
        let Some(job_id) = self.queue.pop_front() else {
            self.busy = false;
            return;
        };
        self.queued.remove(&job_id);

        let (job, tasks, snapshot) = {
            let state = self.cell_state.borrow();
            (
                state.job(job_id).clone(),
                state.pending_tasks(job_id),
                state.snapshot(),
            )
        };

        self.stats.wait_time_sum += self.ctx.time() - job.submit_time;
        self.stats.wait_count += 1;

        if tasks.is_empty() {
            self.next_cycle(true);
            return;
        }

        if tasks
            .iter()
            .any(|t| !snapshot.could_ever_fit(&t.requirement))
        {
            log_info!(
                self.ctx,
                "job {} is infeasible: no machine can ever hold it",
                job_id
            );
            self.ctx.emit_now(AbandonJob { job_id }, self.cell_id);
            self.next_cycle(true);
            return;
        }

        let plan = self.policy.plan(&job, &tasks, &snapshot, &self.ctx);
        let latency = self.decision_time(tasks.len());
        self.stats.busy_time += latency;

        if plan.is_empty() {
            log_debug!(self.ctx, "job {} does not fit right now, parked", job_id);
            self.park(job_id);
            return;
        }

        let mode = if job.gang_schedule || self.require_gang {
            CommitMode::Gang
        } else {
            CommitMode::Incremental
        };
        if mode == CommitMode::Gang && plan.placements.len() < tasks.len() {
            // A partial gang is pointless: all tasks go together or not at all.
            log_debug!(self.ctx, "gang job {} cannot fully fit, parked", job_id);
            self.park(job_id);
            return;
        }
        let mut transaction = Transaction::new(self.name.clone(), mode);
        for (task_id, machine_id) in &plan.placements {
            let version = snapshot.machine(*machine_id).unwrap().version;
            transaction.add_placement(*task_id, *machine_id, version);
        }
        for (template_id, machine_id) in &plan.spawned {
            let version = snapshot.machine(*machine_id).unwrap().version;
            transaction.add_spawned(*template_id, *machine_id, version);
        }

        self.pending = Some(PendingCommit {
            job_id,
            transaction,
            attempt: 0,
        });
        self.ctx.emit_self(SubmitPending {}, latency);
    }

    fn submit_pending(&mut self) {
        let transaction = match &self.pending {
            Some(pending) => pending.transaction.clone(),
            None => return,
        };
        self.ctx
            .emit_now(CommitTransaction { transaction }, self.cell_id);
    }

    fn on_transaction_completed(&mut self, result: TransactionResult) {
        let (job_id, attempt) = match &self.pending {
            Some(pending) => (pending.job_id, pending.attempt),
            None => return,
        };

        self.stats.tasks_scheduled += result.accepted_count() as u64;
        let rejected = result.rejected().len() as u64;
        self.stats.conflicts += rejected;

        if self.cell_state.borrow().job_fully_scheduled(job_id) {
            if self.counted_jobs.insert(job_id) {
                self.stats.jobs_scheduled += 1;
            }
            self.next_cycle(true);
            return;
        }

        // Conflicted placements are worth a resubmission only when versions
        // went stale; a full machine stays full until something releases.
        let retry_worthwhile = result.has_stale_rejection();
        if retry_worthwhile && attempt < self.effective_max_retries(job_id) {
            let pending = self.pending.as_mut().unwrap();
            pending.attempt += 1;
            pending.transaction.spawned.clear();
            if result.committed {
                let unplaced: FxHashSet<TaskId> = result
                    .outcomes
                    .iter()
                    .filter(|o| {
                        matches!(
                            o.outcome,
                            Outcome::Rejected(
                                RejectReason::VersionStale
                                    | RejectReason::InsufficientResources
                                    | RejectReason::MachineFailed
                            )
                        )
                    })
                    .map(|o| o.task_id)
                    .collect();
                pending
                    .transaction
                    .placements
                    .retain(|p| unplaced.contains(&p.task_id));
            }
            let delay = RETRY_BACKOFF_BASE * 2f64.powi((attempt + 1) as i32 - 1);
            self.stats.busy_time += delay;
            log_debug!(
                self.ctx,
                "job {} conflicted, retry {} in {:.3}s",
                job_id,
                attempt + 1,
                delay
            );
            self.ctx.emit_self(RetryCommit {}, delay);
            return;
        }

        if rejected == 0 {
            // Nothing conflicted; the remaining tasks simply found no room.
            self.park(job_id);
            return;
        }

        if self.boosted.insert(job_id) {
            log_debug!(self.ctx, "job {} re-queued with a boosted retry budget", job_id);
            self.pending = None;
            self.park(job_id);
        } else {
            self.ctx.emit_now(AbandonJob { job_id }, self.cell_id);
            self.next_cycle(true);
        }
    }

    fn on_retry(&mut self) {
        let snapshot = self.cell_state.borrow().snapshot();
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        for placement in &mut pending.transaction.placements {
            if let Some(view) = snapshot.machine(placement.machine_id) {
                placement.expected_version = view.version;
            }
        }
        let transaction = pending.transaction.clone();
        self.ctx
            .emit_now(CommitTransaction { transaction }, self.cell_id);
    }
}

impl EventHandler for SchedulerActor {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            JobArrival { job_id } => {
                log_debug!(self.ctx, "job {} arrived at {}", job_id, self.name);
                self.enqueue(job_id);
                self.wake();
            }
            ScheduleActivation {} => {
                self.on_activation();
            }
            SubmitPending {} => {
                self.submit_pending();
            }
            RetryCommit {} => {
                self.on_retry();
            }
            TransactionCompleted { result } => {
                self.on_transaction_completed(result);
            }
            ResourcesReleased {} => {
                self.wake();
            }
        });
    }
}

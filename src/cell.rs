use std::{cell::RefCell, rc::Rc};

use dslab_core::{cast, log_debug, log_info, Event, EventHandler, EventId, Id, SimulationContext};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::cell_state::{CellState, MachineId, MachineState};
use crate::job::{JobId, TaskId, TaskState};
use crate::monitoring::Monitoring;
use crate::transaction::{Transaction, TransactionResult};

#[derive(Clone, Serialize)]
pub struct CommitTransaction {
    pub transaction: Transaction,
}

#[derive(Clone, Serialize)]
pub struct TransactionCompleted {
    pub result: TransactionResult,
}

#[derive(Clone, Serialize)]
pub struct TaskCompleted {
    pub task_id: TaskId,
}

#[derive(Clone, Serialize)]
pub struct MachineFailure {
    pub machine_id: MachineId,
}

#[derive(Clone, Serialize)]
pub struct MachineRecovered {
    pub machine_id: MachineId,
}

/// A scheduler gave up on the job; the cell records it as failed.
#[derive(Clone, Serialize)]
pub struct AbandonJob {
    pub job_id: JobId,
}

/// Sent to the proxy so an affected job finds its way back to a scheduler
/// queue after a machine failure.
#[derive(Clone, Serialize)]
pub struct JobRequeued {
    pub job_id: JobId,
}

/// Broadcast to schedulers whenever capacity returns to the pool.
#[derive(Clone, Serialize)]
pub struct ResourcesReleased {}

/// Event-facing shell around [`CellState`]. Commits arrive as events, which
/// funnels them through one deterministic queue; snapshot reads go straight
/// to the shared state. The cell owns the task-completion timeline: accepted
/// placements whose dependencies are satisfied get a completion self-event
/// at `start + duration`, dependent tasks are started by the completion of
/// their last predecessor.
pub struct Cell {
    state: Rc<RefCell<CellState>>,
    monitoring: Rc<RefCell<Monitoring>>,

    proxy_id: Id,
    scheduler_ids: Vec<Id>,

    completion_events: FxHashMap<TaskId, EventId>,
    finished_jobs: FxHashSet<JobId>,

    ctx: SimulationContext,
}

impl Cell {
    pub fn new(
        ctx: SimulationContext,
        state: Rc<RefCell<CellState>>,
        monitoring: Rc<RefCell<Monitoring>>,
    ) -> Self {
        Cell {
            state,
            monitoring,
            proxy_id: u32::MAX, // must be set later
            scheduler_ids: Vec::new(),
            completion_events: FxHashMap::default(),
            finished_jobs: FxHashSet::default(),
            ctx,
        }
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    pub fn set_proxy(&mut self, proxy_id: Id) {
        self.proxy_id = proxy_id;
    }

    pub fn set_schedulers(&mut self, scheduler_ids: Vec<Id>) {
        self.scheduler_ids = scheduler_ids;
    }

    fn on_commit(&mut self, transaction: Transaction, from: Id) {
        let result = self.state.borrow_mut().commit(&transaction);
        log_debug!(
            self.ctx,
            "commit from {}: {} accepted, {} rejected",
            result.scheduler,
            result.accepted_count(),
            result.rejected().len()
        );

        for task_id in result.accepted_task_ids() {
            if self.state.borrow().task_ready(task_id) {
                self.start_task(task_id);
            }
        }
        self.record_load();

        self.ctx.emit_now(TransactionCompleted { result }, from);
    }

    fn start_task(&mut self, task_id: TaskId) {
        let duration = {
            let mut state = self.state.borrow_mut();
            state.mark_task_running(task_id, self.ctx.time());
            state.task(task_id).duration
        };
        let event_id = self.ctx.emit_self(TaskCompleted { task_id }, duration);
        self.completion_events.insert(task_id, event_id);
    }

    fn on_task_completed(&mut self, task_id: TaskId, event_id: EventId) {
        // A timer whose placement was failed away (and possibly re-placed
        // since) no longer matches the registered event and is ignored.
        if self.completion_events.get(&task_id) != Some(&event_id) {
            return;
        }
        self.completion_events.remove(&task_id);
        {
            let mut state = self.state.borrow_mut();
            if state.task(task_id).state != TaskState::Running {
                return;
            }
            state.release(task_id, self.ctx.time(), TaskState::Completed);
        }
        self.record_load();

        let ready = self.state.borrow().newly_ready_tasks(task_id);
        for ready_task in ready {
            self.start_task(ready_task);
        }

        let job_id = self.state.borrow().task(task_id).job_id;
        if self.state.borrow().job_completed(job_id) && self.finished_jobs.insert(job_id) {
            let job = self.state.borrow().job(job_id).clone();
            self.monitoring
                .borrow_mut()
                .job_completed(&job, self.ctx.time());
            log_debug!(self.ctx, "job {} completed", job_id);
        }

        self.notify_resources_released();
    }

    fn on_machine_failure(&mut self, machine_id: MachineId) {
        if self.state.borrow().machine(machine_id).state == MachineState::Failed {
            return;
        }
        let failed_tasks = self
            .state
            .borrow_mut()
            .fail_machine(machine_id, self.ctx.time());
        self.monitoring.borrow_mut().machine_failures += 1;
        log_info!(
            self.ctx,
            "machine {} failed, {} tasks lost",
            machine_id,
            failed_tasks.len()
        );

        let mut affected_jobs = Vec::new();
        for task_id in failed_tasks {
            self.completion_events.remove(&task_id);
            let job_id = self.state.borrow().task(task_id).job_id;
            if !affected_jobs.contains(&job_id) {
                affected_jobs.push(job_id);
            }
        }

        for job_id in affected_jobs {
            self.state.borrow_mut().requeue_failed_tasks(job_id);
            self.ctx.emit_now(JobRequeued { job_id }, self.proxy_id);
        }
        self.record_load();
    }

    fn on_machine_recovered(&mut self, machine_id: MachineId) {
        if self.state.borrow().machine(machine_id).state == MachineState::Healthy {
            return;
        }
        self.state.borrow_mut().recover_machine(machine_id);
        self.monitoring.borrow_mut().machine_recoveries += 1;
        log_info!(self.ctx, "machine {} recovered", machine_id);
        self.record_load();
        self.notify_resources_released();
    }

    fn on_abandon_job(&mut self, job_id: JobId) {
        self.state.borrow_mut().mark_job_failed(job_id);
        if self.finished_jobs.insert(job_id) {
            let job = self.state.borrow().job(job_id).clone();
            self.monitoring.borrow_mut().job_failed(&job, self.ctx.time());
            log_info!(self.ctx, "job {} marked failed", job_id);
        }
    }

    fn notify_resources_released(&self) {
        for scheduler_id in &self.scheduler_ids {
            self.ctx.emit_now(ResourcesReleased {}, *scheduler_id);
        }
    }

    fn record_load(&self) {
        let allocated = self.state.borrow().allocated_total();
        self.monitoring
            .borrow_mut()
            .update_usage(self.ctx.time(), &allocated);
    }
}

impl EventHandler for Cell {
    fn on(&mut self, event: Event) {
        let from = event.src;
        let event_id = event.id;
        cast!(match event.data {
            CommitTransaction { transaction } => {
                self.on_commit(transaction, from);
            }
            TaskCompleted { task_id } => {
                self.on_task_completed(task_id, event_id);
            }
            MachineFailure { machine_id } => {
                self.on_machine_failure(machine_id);
            }
            MachineRecovered { machine_id } => {
                self.on_machine_recovered(machine_id);
            }
            AbandonJob { job_id } => {
                self.on_abandon_job(job_id);
            }
        });
    }
}

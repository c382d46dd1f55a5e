use std::{cell::RefCell, rc::Rc};

use dslab_core::{cast, log_debug, log_error, Event, EventHandler, Id, SimulationContext};
use serde::Serialize;

use crate::cell::JobRequeued;
use crate::cell_state::CellState;
use crate::job::JobId;
use crate::schedulers::SchedulerKind;

#[derive(Clone, Serialize)]
pub struct JobArrival {
    pub job_id: JobId,
}

#[derive(Clone, Copy, Debug)]
pub struct SchedulerRoute {
    pub id: Id,
    pub kind: SchedulerKind,
}

/// Routes every arriving (or re-queued) job to the first configured
/// scheduler whose kind accepts the job type, falling back to the first
/// scheduler.
pub struct Proxy {
    routes: Vec<SchedulerRoute>,
    cell_state: Rc<RefCell<CellState>>,
    ctx: SimulationContext,
}

impl Proxy {
    pub fn new(ctx: SimulationContext, cell_state: Rc<RefCell<CellState>>) -> Proxy {
        Proxy {
            routes: Vec::new(),
            cell_state,
            ctx,
        }
    }

    pub fn get_id(&self) -> Id {
        self.ctx.id()
    }

    pub fn set_routes(&mut self, routes: Vec<SchedulerRoute>) {
        self.routes = routes;
    }

    fn route(&self, job_id: JobId) {
        let job_type = self.cell_state.borrow().job(job_id).job_type;
        let target = self
            .routes
            .iter()
            .find(|r| r.kind.accepts(job_type))
            .or_else(|| self.routes.first());
        match target {
            Some(route) => {
                log_debug!(
                    self.ctx,
                    "routing job {} ({:?}) to scheduler {}",
                    job_id,
                    job_type,
                    route.id
                );
                self.ctx.emit_now(JobArrival { job_id }, route.id);
            }
            None => {
                log_error!(self.ctx, "no scheduler to take job {}", job_id);
            }
        }
    }
}

impl EventHandler for Proxy {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            JobArrival { job_id } => {
                self.route(job_id);
            }
            JobRequeued { job_id } => {
                self.route(job_id);
            }
        })
    }
}

use std::{cell::RefCell, rc::Rc};

use dslab_core::{cast, log_debug, Event, EventHandler, Id, SimulationContext};
use rand_distr::Exp;
use serde::Serialize;

use crate::cell::{MachineFailure, MachineRecovered};
use crate::cell_state::CellState;

#[derive(Clone, Serialize)]
struct InjectFailure {}

/// Samples an exponential failure timeline over the whole run at
/// initialization, then on each firing takes down one healthy machine chosen
/// uniformly with the simulation PRNG. With `recovery_mean` set, the machine
/// comes back after an exponentially distributed downtime.
pub struct FailureInjector {
    cell_id: Id,
    cell_state: Rc<RefCell<CellState>>,
    rate: f64,
    recovery_mean: Option<f64>,
    ctx: SimulationContext,
}

impl FailureInjector {
    pub fn new(
        ctx: SimulationContext,
        cell_id: Id,
        cell_state: Rc<RefCell<CellState>>,
        rate: f64,
        recovery_mean: Option<f64>,
    ) -> Self {
        FailureInjector {
            cell_id,
            cell_state,
            rate,
            recovery_mean,
            ctx,
        }
    }

    /// Pre-schedule every failure event up to `horizon`.
    pub fn start(&mut self, horizon: f64) {
        let machine_count = self.cell_state.borrow().machine_count();
        let cluster_rate = self.rate * machine_count as f64;
        if cluster_rate <= 0. {
            return;
        }
        let interarrival = Exp::new(cluster_rate).unwrap();
        let mut time = self.ctx.sample_from_distribution(&interarrival);
        while time < horizon {
            self.ctx.emit_self(InjectFailure {}, time);
            time += self.ctx.sample_from_distribution(&interarrival);
        }
    }

    fn inject(&mut self) {
        let healthy = self.cell_state.borrow().healthy_machine_ids();
        if healthy.is_empty() {
            return;
        }
        let victim = healthy[self.ctx.gen_range(0..healthy.len())];
        log_debug!(self.ctx, "injecting failure on machine {}", victim);
        self.ctx
            .emit_now(MachineFailure { machine_id: victim }, self.cell_id);

        if let Some(mean) = self.recovery_mean {
            let downtime = self
                .ctx
                .sample_from_distribution(&Exp::new(1. / mean).unwrap());
            self.ctx
                .emit(MachineRecovered { machine_id: victim }, self.cell_id, downtime);
        }
    }
}

impl EventHandler for FailureInjector {
    fn on(&mut self, event: Event) {
        cast!(match event.data {
            InjectFailure {} => {
                self.inject();
            }
        })
    }
}

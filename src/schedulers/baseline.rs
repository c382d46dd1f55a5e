use dslab_core::SimulationContext;
use rustc_hash::FxHashMap;

use crate::cell_state::{MachineId, Snapshot};
use crate::job::{Job, Task};
use crate::resources::ResourceVector;

use super::batch::{select_machine, PlacementStrategy};
use super::{available_with_overlay, Plan, QueueDiscipline, SchedulerKind, SchedulerPolicy};

/// Baseline: first machine in id order that fits.
#[derive(Default)]
pub struct FirstFitPolicy {}

impl SchedulerPolicy for FirstFitPolicy {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::FirstFit
    }

    fn default_decision_times(&self) -> (f64, f64) {
        (0.1, 0.005)
    }

    fn plan(
        &mut self,
        _job: &Job,
        tasks: &[Task],
        snapshot: &Snapshot,
        _ctx: &SimulationContext,
    ) -> Plan {
        let mut plan = Plan::default();
        let mut overlay: FxHashMap<MachineId, ResourceVector> = FxHashMap::default();
        for task in tasks {
            if let Some(machine_id) =
                select_machine(PlacementStrategy::FirstFit, &task.requirement, snapshot, &overlay)
            {
                plan.placements.push((task.id, machine_id));
                overlay
                    .entry(machine_id)
                    .or_default()
                    .add(&task.requirement);
            }
        }
        plan
    }
}

/// Baseline: first fit over a machine order shuffled with the simulation
/// PRNG, so runs stay reproducible for a fixed seed.
#[derive(Default)]
pub struct RandomPolicy {}

impl SchedulerPolicy for RandomPolicy {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Random
    }

    fn default_decision_times(&self) -> (f64, f64) {
        (0.1, 0.005)
    }

    fn plan(
        &mut self,
        _job: &Job,
        tasks: &[Task],
        snapshot: &Snapshot,
        ctx: &SimulationContext,
    ) -> Plan {
        let machines = snapshot.machines();
        let mut order: Vec<usize> = (0..machines.len()).collect();
        for i in (1..order.len()).rev() {
            let j = ctx.gen_range(0..=i);
            order.swap(i, j);
        }

        let mut plan = Plan::default();
        let mut overlay: FxHashMap<MachineId, ResourceVector> = FxHashMap::default();
        for task in tasks {
            for index in &order {
                let view = &machines[*index];
                let available = available_with_overlay(view, &overlay);
                if view.can_fit(&task.requirement) && task.requirement.fits_into(&available) {
                    plan.placements.push((task.id, view.id));
                    overlay.entry(view.id).or_default().add(&task.requirement);
                    break;
                }
            }
        }
        plan
    }
}

/// Priority queue discipline with most-free-cpu placement.
#[derive(Default)]
pub struct PriorityPolicy {}

impl SchedulerPolicy for PriorityPolicy {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Priority
    }

    fn queue_discipline(&self) -> QueueDiscipline {
        QueueDiscipline::Priority
    }

    fn default_decision_times(&self) -> (f64, f64) {
        (0.5, 0.01)
    }

    fn plan(
        &mut self,
        _job: &Job,
        tasks: &[Task],
        snapshot: &Snapshot,
        _ctx: &SimulationContext,
    ) -> Plan {
        let mut plan = Plan::default();
        let mut overlay: FxHashMap<MachineId, ResourceVector> = FxHashMap::default();
        for task in tasks {
            let mut best: Option<(u32, MachineId)> = None;
            for view in snapshot.machines() {
                let available = available_with_overlay(view, &overlay);
                if !view.can_fit(&task.requirement) || !task.requirement.fits_into(&available) {
                    continue;
                }
                if best.map_or(true, |(cpu, _)| available.cpu > cpu) {
                    best = Some((available.cpu, view.id));
                }
            }
            if let Some((_, machine_id)) = best {
                plan.placements.push((task.id, machine_id));
                overlay
                    .entry(machine_id)
                    .or_default()
                    .add(&task.requirement);
            }
        }
        plan
    }
}

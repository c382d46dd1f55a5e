use dslab_core::SimulationContext;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cell_state::{MachineId, Snapshot};
use crate::job::{Job, JobType, Task};
use crate::resources::ResourceVector;

use super::{available_with_overlay, Plan, SchedulerKind, SchedulerPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    FirstFit,
    BestFit,
    WorstFit,
}

/// First machine in id order that fits, or the best/worst leftover by L1
/// magnitude. Ties fall to the lowest machine id.
pub(crate) fn select_machine(
    strategy: PlacementStrategy,
    requirement: &ResourceVector,
    snapshot: &Snapshot,
    overlay: &FxHashMap<MachineId, ResourceVector>,
) -> Option<MachineId> {
    let mut best: Option<(f64, MachineId)> = None;
    for view in snapshot.machines() {
        let available = available_with_overlay(view, overlay);
        if !view.can_fit(requirement) || !requirement.fits_into(&available) {
            continue;
        }
        match strategy {
            PlacementStrategy::FirstFit => return Some(view.id),
            PlacementStrategy::BestFit => {
                let mut leftover = available;
                leftover.subtract(requirement);
                let magnitude = leftover.magnitude();
                if best.map_or(true, |(score, _)| magnitude < score) {
                    best = Some((magnitude, view.id));
                }
            }
            PlacementStrategy::WorstFit => {
                let mut leftover = available;
                leftover.subtract(requirement);
                let magnitude = leftover.magnitude();
                if best.map_or(true, |(score, _)| magnitude > score) {
                    best = Some((magnitude, view.id));
                }
            }
        }
    }
    best.map(|(_, id)| id)
}

/// Fast path for short-lived batch jobs: cheap decisions, configurable
/// packing strategy.
pub struct BatchPolicy {
    strategy: PlacementStrategy,
}

impl BatchPolicy {
    pub fn new(strategy: PlacementStrategy) -> Self {
        Self { strategy }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::new(PlacementStrategy::BestFit)
    }
}

impl SchedulerPolicy for BatchPolicy {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Batch
    }

    fn default_decision_times(&self) -> (f64, f64) {
        (0.010, 0.001)
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
                select_machine(self.strategy, &task.requirement, snapshot, &overlay)
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

/// Rotating cursor over the machine list; the per-job-type weight is the
/// stride a successful placement advances the cursor by.
pub struct WeightedRoundRobinPolicy {
    weights: HashMap<JobType, f64>,
    cursor: usize,
}

impl WeightedRoundRobinPolicy {
    pub fn new(weights: HashMap<JobType, f64>) -> Self {
        Self { weights, cursor: 0 }
    }
}

impl SchedulerPolicy for WeightedRoundRobinPolicy {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::WeightedRoundRobin
    }

    fn default_decision_times(&self) -> (f64, f64) {
        (0.02, 0.002)
    }

    fn plan(
        &mut self,
        job: &Job,
        tasks: &[Task],
        snapshot: &Snapshot,
        _ctx: &SimulationContext,
    ) -> Plan {
        let machines = snapshot.machines();
        let mut plan = Plan::default();
        if machines.is_empty() {
            return plan;
        }
        let stride = self
            .weights
            .get(&job.job_type)
            .copied()
            .unwrap_or(1.)
            .max(1.)
            .round() as usize;
        let mut overlay: FxHashMap<MachineId, ResourceVector> = FxHashMap::default();

        for task in tasks {
            for _ in 0..machines.len() {
                let view = &machines[self.cursor % machines.len()];
                self.cursor += 1;
                let available = available_with_overlay(view, &overlay);
                if view.can_fit(&task.requirement) && task.requirement.fits_into(&available) {
                    plan.placements.push((task.id, view.id));
                    overlay.entry(view.id).or_default().add(&task.requirement);
                    self.cursor += stride - 1;
                    break;
                }
            }
        }
        plan
    }
}

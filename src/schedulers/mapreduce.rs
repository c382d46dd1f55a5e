use dslab_core::SimulationContext;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::cell_state::{MachineId, Snapshot};
use crate::job::{Job, Task};
use crate::resources::ResourceVector;

use super::{available_with_overlay, Plan, SchedulerKind, SchedulerPolicy};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElasticPolicy {
    MaxParallelism,
    GlobalCap,
    RelativeJobSize,
}

const DEFAULT_UTILIZATION_THRESHOLD: f64 = 0.8;
const DEFAULT_MAX_SCALE_FACTOR: f64 = 4.0;
const DEFAULT_HARD_CAP_FACTOR: u64 = 10;

/// Opportunistic scaling for MapReduce jobs: given a base map-stage width N,
/// the policy proposes N' >= N workers by cloning the map template into idle
/// capacity. Everything goes into one incremental transaction; clones losing
/// their race are simply dropped.
pub struct MapReducePolicy {
    policy: ElasticPolicy,
    hard_cap: Option<u64>,
    utilization_threshold: f64,
    max_scale_factor: f64,
}

impl MapReducePolicy {
    pub fn new(policy: ElasticPolicy) -> Self {
        Self {
            policy,
            hard_cap: None,
            utilization_threshold: DEFAULT_UTILIZATION_THRESHOLD,
            max_scale_factor: DEFAULT_MAX_SCALE_FACTOR,
        }
    }

    pub fn with_hard_cap(mut self, hard_cap: Option<u64>) -> Self {
        self.hard_cap = hard_cap;
        self
    }

    pub fn with_utilization_threshold(mut self, threshold: f64) -> Self {
        self.utilization_threshold = threshold;
        self
    }

    pub fn with_max_scale_factor(mut self, factor: f64) -> Self {
        self.max_scale_factor = factor;
        self
    }

    /// How many map-stage workers the cluster could hold right now.
    fn available_slots(available: &ResourceVector, requirement: &ResourceVector) -> u64 {
        let mut slots = u64::MAX;
        if requirement.cpu > 0 {
            slots = slots.min((available.cpu / requirement.cpu) as u64);
        }
        if requirement.gpu > 0 {
            slots = slots.min((available.gpu / requirement.gpu) as u64);
        }
        if requirement.memory > 0. {
            slots = slots.min((available.memory / requirement.memory).floor() as u64);
        }
        if slots == u64::MAX {
            0
        } else {
            slots
        }
    }

    fn elastic_target(&self, base: u64, requirement: &ResourceVector, snapshot: &Snapshot) -> u64 {
        let slots = Self::available_slots(&snapshot.total_available(), requirement);
        let hard_cap = self.hard_cap.unwrap_or(base * DEFAULT_HARD_CAP_FACTOR);
        match self.policy {
            ElasticPolicy::MaxParallelism => base.max(slots.min(hard_cap)),
            ElasticPolicy::GlobalCap => {
                let utilization = snapshot.utilization();
                let average = (utilization.cpu + utilization.memory) / 2.;
                if average > self.utilization_threshold {
                    return base;
                }
                let factor = 1.0 + (self.utilization_threshold - average) * 5.0;
                base.max(((base as f64 * factor) as u64).min(slots).min(hard_cap))
            }
            ElasticPolicy::RelativeJobSize => {
                base.max(slots.min((base as f64 * self.max_scale_factor) as u64))
            }
        }
    }
}

/// Most-free-first placement, preferring machines with the largest leftover.
fn select_most_free(
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
        let magnitude = available.magnitude();
        if best.map_or(true, |(top, _)| magnitude > top) {
            best = Some((magnitude, view.id));
        }
    }
    best.map(|(_, id)| id)
}

impl SchedulerPolicy for MapReducePolicy {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::MapReduce
    }

    fn default_decision_times(&self) -> (f64, f64) {
        (0.2, 0.01)
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
            if let Some(machine_id) = select_most_free(&task.requirement, snapshot, &overlay) {
                plan.placements.push((task.id, machine_id));
                overlay
                    .entry(machine_id)
                    .or_default()
                    .add(&task.requirement);
            }
        }

        // Map-stage roots are the clone templates.
        let roots: Vec<&Task> = tasks.iter().filter(|t| t.dependencies.is_empty()).collect();
        if let Some(template) = roots.first() {
            let target = self.elastic_target(roots.len() as u64, &template.requirement, snapshot);
            for _ in roots.len() as u64..target {
                match select_most_free(&template.requirement, snapshot, &overlay) {
                    Some(machine_id) => {
                        plan.spawned.push((template.id, machine_id));
                        overlay
                            .entry(machine_id)
                            .or_default()
                            .add(&template.requirement);
                    }
                    None => break,
                }
            }
        }
        plan
    }
}

use dslab_core::SimulationContext;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell_state::{MachineId, Snapshot};
use crate::job::{Job, Task, TaskId};
use crate::resources::ResourceVector;

use super::{available_with_overlay, Plan, SchedulerKind, SchedulerPolicy};

const HEADROOM_WEIGHT: f64 = 100.;
const LOAD_PENALTY: f64 = 5.;
const DOMAIN_DIVERSITY_WEIGHT: f64 = 20.;
const GPU_AFFINITY_BONUS: f64 = 50.;

/// Slow, careful placement for long-running services: every feasible machine
/// is scored and the maximum wins, ties broken by the lowest machine id.
/// Scoring prefers cpu headroom, light machines, failure domains the job has
/// not spread to yet, and GPU machines for GPU tasks. Hard anti-affinity
/// (no two job tasks on one machine) excludes a machine outright.
#[derive(Default)]
pub struct ServicePolicy {}

impl SchedulerPolicy for ServicePolicy {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Service
    }

    fn default_decision_times(&self) -> (f64, f64) {
        (1.0, 0.05)
    }

    fn plan(
        &mut self,
        job: &Job,
        tasks: &[Task],
        snapshot: &Snapshot,
        _ctx: &SimulationContext,
    ) -> Plan {
        let job_tasks: FxHashSet<TaskId> = job.tasks.iter().copied().collect();

        // Placements the job already holds, by failure domain and machine.
        let mut domain_counts: FxHashMap<u32, u32> = FxHashMap::default();
        let mut machine_job_tasks: FxHashMap<MachineId, u32> = FxHashMap::default();
        for view in snapshot.machines() {
            let resident = view
                .tasks
                .iter()
                .filter(|id| job_tasks.contains(*id))
                .count() as u32;
            if resident > 0 {
                *domain_counts.entry(view.failure_domain).or_default() += resident;
                machine_job_tasks.insert(view.id, resident);
            }
        }

        let mut plan = Plan::default();
        let mut overlay: FxHashMap<MachineId, ResourceVector> = FxHashMap::default();
        let mut overlay_tasks: FxHashMap<MachineId, u32> = FxHashMap::default();

        for task in tasks {
            let mut best: Option<(f64, MachineId, u32)> = None;
            for view in snapshot.machines() {
                let available = available_with_overlay(view, &overlay);
                if !view.can_fit(&task.requirement) || !task.requirement.fits_into(&available) {
                    continue;
                }
                let tentative = overlay_tasks.get(&view.id).copied().unwrap_or(0);
                if job.no_colocation
                    && machine_job_tasks.get(&view.id).copied().unwrap_or(0) + tentative > 0
                {
                    continue;
                }

                let headroom = if view.capacity.cpu > 0 {
                    available.cpu as f64 / view.capacity.cpu as f64
                } else {
                    0.
                };
                let load = (view.tasks.len() as u32 + tentative) as f64;
                let domain_occupancy =
                    domain_counts.get(&view.failure_domain).copied().unwrap_or(0);
                let mut score = HEADROOM_WEIGHT * headroom - LOAD_PENALTY * load
                    + DOMAIN_DIVERSITY_WEIGHT / (1 + domain_occupancy) as f64;
                if task.requirement.gpu > 0 && view.capacity.gpu > 0 {
                    score += GPU_AFFINITY_BONUS;
                }

                if best.map_or(true, |(top, _, _)| score > top) {
                    best = Some((score, view.id, view.failure_domain));
                }
            }

            if let Some((_, machine_id, domain)) = best {
                plan.placements.push((task.id, machine_id));
                overlay
                    .entry(machine_id)
                    .or_default()
                    .add(&task.requirement);
                *overlay_tasks.entry(machine_id).or_default() += 1;
                *domain_counts.entry(domain).or_default() += 1;
                *machine_job_tasks.entry(machine_id).or_default() += 1;
            }
        }
        plan
    }
}

use dslab_core::SimulationContext;

use crate::job::{Job, Task};

/// A job ready for submission, together with its task records.
#[derive(Clone, Debug)]
pub struct GeneratedJob {
    pub arrival_time: f64,
    pub job: Job,
    pub tasks: Vec<Task>,
}

/// Produces the full workload for one run. All randomness must come from the
/// provided context so a fixed seed gives an identical sequence.
pub trait WorkloadGenerator {
    fn generate(&mut self, ctx: &SimulationContext, horizon: f64) -> Vec<GeneratedJob>;
}

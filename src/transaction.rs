use serde::Serialize;

use crate::cell_state::MachineId;
use crate::job::TaskId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    Incremental,
    Gang,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    VersionStale,
    InsufficientResources,
    MachineFailed,
    DuplicateTask,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct Placement {
    pub task_id: TaskId,
    pub machine_id: MachineId,
    pub expected_version: u64,
}

/// Opportunistic clone of an existing task, placed alongside the regular
/// placements of the same transaction. The clone only comes into existence
/// if its placement is accepted; registration is atomic with the commit.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct SpawnedPlacement {
    pub template_task_id: TaskId,
    pub machine_id: MachineId,
    pub expected_version: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct Transaction {
    pub scheduler: String,
    pub mode: CommitMode,
    pub placements: Vec<Placement>,
    pub spawned: Vec<SpawnedPlacement>,
}

impl Transaction {
    pub fn new(scheduler: impl Into<String>, mode: CommitMode) -> Self {
        Self {
            scheduler: scheduler.into(),
            mode,
            placements: Vec::new(),
            spawned: Vec::new(),
        }
    }

    pub fn add_placement(&mut self, task_id: TaskId, machine_id: MachineId, expected_version: u64) {
        self.placements.push(Placement {
            task_id,
            machine_id,
            expected_version,
        });
    }

    pub fn add_spawned(
        &mut self,
        template_task_id: TaskId,
        machine_id: MachineId,
        expected_version: u64,
    ) {
        self.spawned.push(SpawnedPlacement {
            template_task_id,
            machine_id,
            expected_version,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.spawned.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected(RejectReason),
    /// Individually valid, but discarded because a gang sibling was rejected.
    GangAborted,
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PlacementOutcome {
    /// For spawned placements this is the id assigned to the clone when
    /// accepted, or the template id when rejected.
    pub task_id: TaskId,
    pub machine_id: MachineId,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Serialize)]
pub struct TransactionResult {
    pub scheduler: String,
    pub mode: CommitMode,
    pub outcomes: Vec<PlacementOutcome>,
    pub spawned_outcomes: Vec<PlacementOutcome>,
    /// Whether the commit applied at least one placement.
    pub committed: bool,
}

impl TransactionResult {
    pub fn accepted_count(&self) -> usize {
        self.outcomes
            .iter()
            .chain(self.spawned_outcomes.iter())
            .filter(|o| o.outcome.is_accepted())
            .count()
    }

    pub fn accepted_task_ids(&self) -> Vec<TaskId> {
        self.outcomes
            .iter()
            .chain(self.spawned_outcomes.iter())
            .filter(|o| o.outcome.is_accepted())
            .map(|o| o.task_id)
            .collect()
    }

    pub fn rejected(&self) -> Vec<&PlacementOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Rejected(_)))
            .collect()
    }

    pub fn has_stale_rejection(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.outcome, Outcome::Rejected(RejectReason::VersionStale)))
    }
}

#![doc = include_str!("../readme.md")]

pub mod cell;
pub mod cell_state;
pub mod config;
pub mod failure_injector;
pub mod job;
pub mod monitoring;
pub mod proxy;
pub mod resources;
pub mod schedulers;
pub mod simulation;
pub mod transaction;
pub mod workload_generators;

pub use cell_state::{CellState, Machine, MachineState, Snapshot};
pub use config::sim_config::SimulationConfig;
pub use job::{Job, JobType, Task, TaskState};
pub use monitoring::SimulationResults;
pub use resources::ResourceVector;
pub use simulation::OmegaSimulation;
pub use transaction::{CommitMode, RejectReason, Transaction};

use std::{cell::RefCell, rc::Rc, time::Instant};

use dslab_core::{Id, Simulation, SimulationContext};
use sugars::{rc, refcell};

use crate::cell::{Cell, MachineFailure, MachineRecovered};
use crate::cell_state::{CellState, Machine, MachineId};
use crate::config::sim_config::{SchedulerConfig, SimulationConfig};
use crate::failure_injector::FailureInjector;
use crate::job::{Job, Task};
use crate::monitoring::{CellResults, Monitoring, SimulationResults};
use crate::proxy::{JobArrival, Proxy, SchedulerRoute};
use crate::resources::ResourceVector;
use crate::schedulers::baseline::{FirstFitPolicy, PriorityPolicy, RandomPolicy};
use crate::schedulers::batch::{BatchPolicy, PlacementStrategy, WeightedRoundRobinPolicy};
use crate::schedulers::mapreduce::MapReducePolicy;
use crate::schedulers::service::ServicePolicy;
use crate::schedulers::{
    SchedulerActor, SchedulerKind, SchedulerPolicy, DEFAULT_MAX_RETRIES,
};
use crate::workload_generators::generator::WorkloadGenerator;
use crate::workload_generators::random::RandomWorkloadGenerator;

/// Heterogeneous machine type mix: (type tag, cpu, gpu, memory, share).
const MACHINE_TYPES: &[(&str, u32, u32, f64, f64)] = &[
    ("standard", 8, 0, 16.0, 0.5),
    ("highcpu", 16, 0, 32.0, 0.3),
    ("gpu", 8, 2, 32.0, 0.15),
    ("large", 32, 0, 128.0, 0.05),
];

fn build_policy(config: &SchedulerConfig) -> Box<dyn SchedulerPolicy> {
    match config.r#type {
        SchedulerKind::Batch => Box::new(BatchPolicy::new(
            config.placement_strategy.unwrap_or(PlacementStrategy::BestFit),
        )),
        SchedulerKind::Service => Box::new(ServicePolicy::default()),
        SchedulerKind::MapReduce => {
            let mut policy = MapReducePolicy::new(
                config
                    .policy
                    .unwrap_or(crate::schedulers::mapreduce::ElasticPolicy::MaxParallelism),
            )
            .with_hard_cap(config.hard_cap);
            if let Some(threshold) = config.utilization_threshold {
                policy = policy.with_utilization_threshold(threshold);
            }
            if let Some(factor) = config.max_scale_factor {
                policy = policy.with_max_scale_factor(factor);
            }
            Box::new(policy)
        }
        SchedulerKind::Priority => Box::new(PriorityPolicy::default()),
        SchedulerKind::WeightedRoundRobin => {
            Box::new(WeightedRoundRobinPolicy::new(config.weights.clone()))
        }
        SchedulerKind::FirstFit => Box::new(FirstFitPolicy::default()),
        SchedulerKind::Random => Box::new(RandomPolicy::default()),
    }
}

/// Wires the cell, the proxy, the scheduler roster and the failure injector
/// onto one simulation and drives the run to the configured duration.
pub struct OmegaSimulation {
    sim: Simulation,
    config: SimulationConfig,

    cell_state: Rc<RefCell<CellState>>,
    cell: Rc<RefCell<Cell>>,
    cell_id: Id,
    proxy: Rc<RefCell<Proxy>>,
    proxy_id: Id,
    monitoring: Rc<RefCell<Monitoring>>,
    schedulers: Vec<Rc<RefCell<SchedulerActor>>>,
    failure_injector: Option<Rc<RefCell<FailureInjector>>>,

    workload_ctx: SimulationContext,
}

impl OmegaSimulation {
    pub fn new(mut sim: Simulation, config: SimulationConfig) -> OmegaSimulation {
        config.validate();

        let monitoring = rc!(refcell!(Monitoring::new(config.output.per_job_trace)));
        let cell_state = rc!(refcell!(CellState::new()));

        let cell_ctx = sim.create_context("cell");
        let cell = rc!(refcell!(Cell::new(
            cell_ctx,
            cell_state.clone(),
            monitoring.clone()
        )));
        let cell_id = sim.add_handler("cell", cell.clone());

        let proxy_ctx = sim.create_context("proxy");
        let proxy = rc!(refcell!(Proxy::new(proxy_ctx, cell_state.clone())));
        let proxy_id = sim.add_handler("proxy", proxy.clone());
        cell.borrow_mut().set_proxy(proxy_id);

        let mut simulation = OmegaSimulation {
            workload_ctx: sim.create_context("workload"),
            sim,
            config,
            cell_state,
            cell,
            cell_id,
            proxy,
            proxy_id,
            monitoring,
            schedulers: Vec::new(),
            failure_injector: None,
        };

        simulation.build_cluster();
        simulation.build_schedulers();
        simulation.build_failure_injector();

        simulation
    }

    fn build_cluster(&mut self) {
        let cluster = self.config.cluster.clone();
        let domains = cluster.failure_domains.max(1);
        let builder_ctx = self.sim.create_context("cluster_builder");

        let mut next_id: MachineId = 0;
        let mut add = |machine_type: &str, capacity: ResourceVector, domain: Option<u32>| {
            let failure_domain = domain.unwrap_or(next_id as u32 % domains);
            let machine = Machine::new(next_id, machine_type, capacity, failure_domain);
            self.monitoring.borrow_mut().register_capacity(&capacity);
            self.cell_state.borrow_mut().add_machine(machine);
            next_id += 1;
        };

        if !cluster.machines.is_empty() {
            for group in &cluster.machines {
                let capacity =
                    ResourceVector::new(group.cpu_cores, group.gpu_count, group.memory_gb);
                let machine_type = group.machine_type.as_deref().unwrap_or("custom");
                for _ in 0..group.count {
                    add(machine_type, capacity, group.failure_domain);
                }
            }
            return;
        }

        for _ in 0..cluster.num_machines {
            let (machine_type, cpu, gpu, memory) = if cluster.heterogeneous {
                let roll = builder_ctx.rand();
                let mut cumulative = 0.;
                let mut selected = MACHINE_TYPES[0];
                for entry in MACHINE_TYPES {
                    cumulative += entry.4;
                    if roll <= cumulative {
                        selected = *entry;
                        break;
                    }
                }
                (selected.0, selected.1, selected.2, selected.3)
            } else {
                let standard = MACHINE_TYPES[0];
                (standard.0, standard.1, standard.2, standard.3)
            };
            add(machine_type, ResourceVector::new(cpu, gpu, memory), None);
        }
    }

    fn build_schedulers(&mut self) {
        let configs = self.config.schedulers.clone();
        let mut routes = Vec::with_capacity(configs.len());
        let mut ids = Vec::with_capacity(configs.len());

        for scheduler_config in &configs {
            let ctx = self.sim.create_context(&scheduler_config.id);
            let actor = SchedulerActor::new(
                scheduler_config.id.clone(),
                build_policy(scheduler_config),
                self.cell_state.clone(),
                self.cell_id,
                scheduler_config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                scheduler_config.require_gang,
                (
                    scheduler_config.decision_time_job,
                    scheduler_config.decision_time_task,
                ),
                ctx,
            );
            let actor = rc!(refcell!(actor));
            let id = self.sim.add_handler(&scheduler_config.id, actor.clone());
            routes.push(SchedulerRoute {
                id,
                kind: scheduler_config.r#type,
            });
            ids.push(id);
            self.schedulers.push(actor);
        }

        self.proxy.borrow_mut().set_routes(routes);
        self.cell.borrow_mut().set_schedulers(ids);
    }

    fn build_failure_injector(&mut self) {
        if !self.config.failures.enabled {
            return;
        }
        let ctx = self.sim.create_context("failure_injector");
        let injector = rc!(refcell!(FailureInjector::new(
            ctx,
            self.cell_id,
            self.cell_state.clone(),
            self.config.failures.rate,
            self.config.failures.recovery_mean,
        )));
        self.sim.add_handler("failure_injector", injector.clone());
        self.failure_injector = Some(injector);
    }

    pub fn cell_state(&self) -> Rc<RefCell<CellState>> {
        self.cell_state.clone()
    }

    pub fn monitoring(&self) -> Rc<RefCell<Monitoring>> {
        self.monitoring.clone()
    }

    /// Register a job and schedule its arrival. Used by experiments and
    /// tests that drive a hand-built workload.
    pub fn submit_job(&mut self, job: Job, tasks: Vec<Task>, arrival_time: f64) {
        let job_id = job.id;
        self.cell_state.borrow_mut().add_job(job, tasks);
        self.workload_ctx.emit(
            JobArrival { job_id },
            self.proxy_id,
            arrival_time - self.workload_ctx.time(),
        );
    }

    /// Schedule a machine failure at an exact virtual time.
    pub fn inject_failure_at(&mut self, machine_id: MachineId, time: f64) {
        self.workload_ctx.emit(
            MachineFailure { machine_id },
            self.cell_id,
            time - self.workload_ctx.time(),
        );
    }

    /// Schedule a machine recovery at an exact virtual time.
    pub fn inject_recovery_at(&mut self, machine_id: MachineId, time: f64) {
        self.workload_ctx.emit(
            MachineRecovered { machine_id },
            self.cell_id,
            time - self.workload_ctx.time(),
        );
    }

    pub fn run(&mut self) -> SimulationResults {
        let duration = self.config.simulation.duration;

        // Failure timelines first so, on equal timestamps, failures are
        // observed ahead of arrivals.
        if let Some(injector) = &self.failure_injector {
            injector.borrow_mut().start(duration);
        }

        if self.config.workload.enabled {
            let mut generator = RandomWorkloadGenerator::from_config(&self.config.workload);
            let generated = generator.generate(&self.workload_ctx, duration);
            println!("Generated {} jobs", generated.len());
            for entry in generated {
                let job_id = entry.job.id;
                self.cell_state.borrow_mut().add_job(entry.job, entry.tasks);
                self.workload_ctx
                    .emit_ordered(JobArrival { job_id }, self.proxy_id, entry.arrival_time);
            }
        }

        let wall_clock = Instant::now();
        println!("Simulation started");
        self.sim.step_for_duration(duration);

        let elapsed = wall_clock.elapsed().as_secs_f64();
        println!("Simulation finished in {:.3}s of wall clock", elapsed);
        println!(
            "Processed {} events ({:.0}/s), virtual time {:.1}s",
            self.sim.event_count(),
            self.sim.event_count() as f64 / elapsed.max(1e-9),
            duration
        );

        self.results()
    }

    pub fn results(&mut self) -> SimulationResults {
        let duration = self.config.simulation.duration;
        let state = self.cell_state.borrow();
        let mut monitoring = self.monitoring.borrow_mut();

        SimulationResults {
            experiment_name: self.config.experiment_name.clone(),
            simulation_time: duration,
            completed_jobs: monitoring.completed_jobs,
            failed_jobs: monitoring.failed_jobs,
            machine_failures: monitoring.machine_failures,
            machine_recoveries: monitoring.machine_recoveries,
            schedulers: self
                .schedulers
                .iter()
                .map(|s| s.borrow().results())
                .collect(),
            cell_state: CellResults {
                total_transactions: state.total_transactions,
                total_commits: state.total_commits,
                total_conflicts: state.total_conflicts,
                conflict_rate: state.conflict_rate(),
                utilization: monitoring.utilization(duration),
            },
            jobs: monitoring.take_traces(),
        }
    }

    pub fn save_results(&self, results: &SimulationResults) -> String {
        let output_dir = &self.config.output_dir;
        std::fs::create_dir_all(output_dir)
            .unwrap_or_else(|e| panic!("Can't create output dir {}: {}", output_dir, e));
        let path = format!("{}/results_{}.json", output_dir, self.config.experiment_name);
        let file = std::fs::File::create(&path)
            .unwrap_or_else(|e| panic!("Can't create results file {}: {}", path, e));
        serde_json::to_writer_pretty(file, results)
            .unwrap_or_else(|e| panic!("Can't serialize results: {}", e));
        path
    }
}

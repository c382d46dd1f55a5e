use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::job::JobType;
use crate::schedulers::batch::PlacementStrategy;
use crate::schedulers::mapreduce::ElasticPolicy;
use crate::schedulers::SchedulerKind;

#[derive(Clone, Debug, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    pub cluster: ClusterConfig,
    pub schedulers: Vec<SchedulerConfig>,
    pub simulation: SimulationOptions,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub failures: FailureConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_experiment_name() -> String {
    "default".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_output_dir() -> String {
    "results".to_string()
}

fn default_true() -> bool {
    true
}

fn default_failure_domains() -> u32 {
    4
}

fn default_count() -> u32 {
    1
}

impl SimulationConfig {
    pub fn from_file(path: &str) -> Self {
        let content = std::fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("Can't read config file {}: {}", path, e));
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Self {
        let config: SimulationConfig = serde_yaml::from_str(yaml)
            .unwrap_or_else(|e| panic!("Can't parse configuration: {}", e));
        config.validate();
        config
    }

    /// Fatal configuration errors surface here, before any event is
    /// dispatched.
    pub fn validate(&self) {
        if self.simulation.duration <= 0. {
            panic!("configuration error: simulation.duration must be positive");
        }
        if self.schedulers.is_empty() && self.workload.enabled {
            panic!("configuration error: jobs would arrive but the scheduler list is empty");
        }
        let mut ids = HashSet::new();
        for scheduler in &self.schedulers {
            if !ids.insert(scheduler.id.as_str()) {
                panic!("configuration error: duplicate scheduler id `{}`", scheduler.id);
            }
        }
        if !(0. ..=1.).contains(&self.workload.batch_ratio) {
            panic!("configuration error: workload.batch_ratio must lie in [0, 1]");
        }
        if self.failures.enabled && self.failures.rate <= 0. {
            panic!("configuration error: failures.rate must be positive when failures are enabled");
        }
        for group in &self.cluster.machines {
            if group.cpu_cores == 0 || group.memory_gb <= 0. {
                panic!("configuration error: machine group with empty capacity");
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub num_machines: u32,
    #[serde(default = "default_true")]
    pub heterogeneous: bool,
    #[serde(default = "default_failure_domains")]
    pub failure_domains: u32,
    /// Explicit machine groups; when given, they replace the generated
    /// `num_machines` pool.
    #[serde(default)]
    pub machines: Vec<MachineGroupConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MachineGroupConfig {
    pub cpu_cores: u32,
    #[serde(default)]
    pub gpu_count: u32,
    pub memory_gb: f64,
    #[serde(default = "default_count")]
    pub count: u32,
    pub failure_domain: Option<u32>,
    pub machine_type: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SimulationOptions {
    pub duration: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SchedulerConfig {
    pub id: String,
    pub r#type: SchedulerKind,
    pub decision_time_job: Option<f64>,
    pub decision_time_task: Option<f64>,
    pub placement_strategy: Option<PlacementStrategy>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub require_gang: bool,
    /// MapReduce elastic policy.
    pub policy: Option<ElasticPolicy>,
    pub hard_cap: Option<u64>,
    pub utilization_threshold: Option<f64>,
    pub max_scale_factor: Option<f64>,
    /// Weighted-round-robin stride per job type.
    #[serde(default)]
    pub weights: HashMap<JobType, f64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub enabled: bool,
    pub batch_ratio: f64,
    /// Mean inter-arrival times in seconds, per job type.
    pub arrival_rate_batch: f64,
    pub arrival_rate_service: f64,
    pub arrival_rate_mapreduce: f64,
    pub include_mapreduce: bool,
    pub gang_fraction: f64,
    pub no_colocation_fraction: f64,
    pub batch_overrides: Option<JobClassOverrides>,
    pub service_overrides: Option<JobClassOverrides>,
    pub mapreduce_overrides: Option<JobClassOverrides>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_ratio: 0.8,
            arrival_rate_batch: 10.,
            arrival_rate_service: 60.,
            arrival_rate_mapreduce: 120.,
            include_mapreduce: false,
            gang_fraction: 0.05,
            no_colocation_fraction: 0.02,
            batch_overrides: None,
            service_overrides: None,
            mapreduce_overrides: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct JobClassOverrides {
    pub task_count_mean: Option<f64>,
    pub task_count_std: Option<f64>,
    pub duration_mean: Option<f64>,
    pub duration_std: Option<f64>,
    pub cpu_mean: Option<f64>,
    pub cpu_std: Option<f64>,
    pub memory_mean: Option<f64>,
    pub memory_std: Option<f64>,
    pub gpu_fraction: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FailureConfig {
    pub enabled: bool,
    /// Failure events per machine-second.
    pub rate: f64,
    pub recovery_mean: Option<f64>,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 1e-4,
            recovery_mean: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub per_job_trace: bool,
}

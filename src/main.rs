use std::io::Write;

use env_logger::Builder;

use dslab_core::Simulation;
use omegasim::{OmegaSimulation, SimulationConfig};

fn main() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/config.yaml".to_string());
    let config = SimulationConfig::from_file(&config_path);

    let sim = Simulation::new(config.seed);
    let mut cluster_sim = OmegaSimulation::new(sim, config);

    let results = cluster_sim.run();

    println!();
    println!("Completed jobs: {}", results.completed_jobs);
    println!("Failed jobs: {}", results.failed_jobs);
    for scheduler in &results.schedulers {
        println!(
            "scheduler {}: {} jobs, {} tasks, {} conflicts (rate {:.4}), busy {:.1}s, avg wait {:.2}s",
            scheduler.id,
            scheduler.jobs_scheduled,
            scheduler.tasks_scheduled,
            scheduler.conflicts,
            scheduler.conflict_rate,
            scheduler.busy_time,
            scheduler.avg_wait_time
        );
    }
    let cell = &results.cell_state;
    println!(
        "cell: {} transactions, {} commits, {} conflicts (rate {:.4})",
        cell.total_transactions, cell.total_commits, cell.total_conflicts, cell.conflict_rate
    );
    println!(
        "utilization: cpu {:.2}%, gpu {:.2}%, memory {:.2}%",
        cell.utilization.cpu * 100.,
        cell.utilization.gpu * 100.,
        cell.utilization.memory * 100.
    );

    let path = cluster_sim.save_results(&results);
    println!("Results saved to {}", path);
}

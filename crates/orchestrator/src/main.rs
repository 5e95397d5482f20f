//! Command-line runner: loads a scene config, runs it to `max_steps` and
//! prints per-step escaped counts.
//!
//! Usage: `whirl-sim [config.json]` (defaults to `configs/water.json`).

use std::process::ExitCode;

use orchestrator::create_simulation;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator=info,compute=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/water.json".to_string());

    let runner = match create_simulation(&config_path) {
        Ok(runner) => runner,
        Err(e) => {
            tracing::error!("Setup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let stats = match runner.run_to_completion() {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!("Simulation failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("{:>8} {:>8} {:>10} {:>10}", "Step", "Groups", "Escaped", "Host us");
    let stride = (stats.len() / 20).max(1);
    for s in stats.iter().step_by(stride) {
        let escaped = s.escaped.map_or_else(|| "-".to_string(), |n| n.to_string());
        println!("{:>8} {:>8} {:>10} {:>10}", s.step, s.groups, escaped, s.wall_us);
    }

    let total_us: u64 = stats.iter().map(|s| s.wall_us).sum();
    println!(
        "\n{} steps, {:.1} us/step on average",
        stats.len(),
        total_us as f64 / stats.len().max(1) as f64
    );
    ExitCode::SUCCESS
}

mod config;
mod platform;
mod replay;
mod simulator;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::{CheckArgs, Cli, Commands, ReplayArgs};
use crate::simulator::SimulatedClockBackend;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay(args) => run_replay(args),
        Commands::Check(args) => run_check(args),
    }
}

fn run_replay(args: ReplayArgs) -> Result<()> {
    let _guard = utils::logging::init(args.log_file.as_deref());

    let platform = platform::load_platform(&args.platform)?;
    let trace = platform::load_trace(&args.trace)?;

    tracing::info!("Replaying {} steps", trace.steps.len());
    let report = replay::run(&platform, &trace)?;
    tracing::info!(
        "Replay finished: {} steps, {} rejected",
        report.outcomes.len(),
        report.rejected()
    );

    let summary = serde_yaml::to_string(&report).context("failed to render replay report")?;
    println!("{summary}");
    Ok(())
}

fn run_check(args: CheckArgs) -> Result<()> {
    let _guard = utils::logging::init(None);

    let platform = platform::load_platform(&args.platform)?;
    let trace = args
        .trace
        .as_deref()
        .map(platform::load_trace)
        .transpose()?
        .unwrap_or_default();
    let backend = SimulatedClockBackend::new(&trace.clocks, trace.default_clock.clone());

    for (id, name, model) in replay::describe_cost_models(&platform, &backend) {
        println!("{id} {name}");
        for level in mmrm::VoltageLevel::ALL {
            println!(
                "  {level:<8} {:>12} Hz  dyn {:>9.2} mW  leak {:>8.2} mW  {:>6} mA",
                model.rate_at(level),
                model.dynamic_power[level.index()],
                model.leakage_power[level.index()],
                model.current_ma(level, level),
            );
        }
    }
    tracing::info!("Platform description {} is valid", args.platform.display());
    Ok(())
}

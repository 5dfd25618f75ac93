use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about, long_about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a request trace against a simulated clock backend
    Replay(ReplayArgs),
    /// Validate a platform description and print the derived cost tables
    Check(CheckArgs),
}

#[derive(Parser)]
pub struct ReplayArgs {
    #[arg(
        long,
        help = "Platform description (YAML)",
        env = "CLOCK_MANAGER_PLATFORM",
        value_hint = clap::ValueHint::FilePath
    )]
    pub platform: PathBuf,

    #[arg(long, help = "Request trace (YAML)", value_hint = clap::ValueHint::FilePath)]
    pub trace: PathBuf,

    #[arg(long, help = "Also write logs to this file", value_hint = clap::ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,
}

#[derive(Parser)]
pub struct CheckArgs {
    #[arg(
        long,
        help = "Platform description (YAML)",
        env = "CLOCK_MANAGER_PLATFORM",
        value_hint = clap::ValueHint::FilePath
    )]
    pub platform: PathBuf,

    #[arg(
        long,
        help = "Trace whose simulated clocks are used to sample frequency tables",
        value_hint = clap::ValueHint::FilePath
    )]
    pub trace: Option<PathBuf>,
}

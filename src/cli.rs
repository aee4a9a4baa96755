use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_CONFIG: &str = "configs/breath_tracking.toml";

#[derive(Parser)]
#[command(
    name = "breath-tracker",
    version,
    about = "Respiration belt breath tracking with gain-perturbed visual feedback",
    long_about = "Acquire a respiration belt, generate breathing targets and score tracking.\n\
                  Without a subcommand an interactive menu is shown."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Experiment config (TOML). Defaults to configs/breath_tracking.toml when present.
    #[arg(short, long, global = true, env = "BREATH_TRACKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a full session: range calibration, then every scheduled trial
    Run(RunArgs),
    /// Print belt samples as they arrive
    Stream(StreamArgs),
    /// Tabulate a condition's target waveform
    Preview(PreviewArgs),
    /// Check a config file and summarise the session it describes
    Validate,
}

#[derive(Args, Clone)]
pub struct SourceArgs {
    /// Replay the force_n column of a recorded session instead of the simulated belt
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Make the simulated belt unreachable over BLE (exercises USB fallback)
    #[arg(long)]
    pub ble_unavailable: bool,
}

#[derive(Args)]
pub struct RunArgs {
    /// Participant id; bare numbers are zero-padded
    #[arg(short, long)]
    pub participant: String,

    /// Session number
    #[arg(short, long, default_value_t = 1)]
    pub session: u32,

    /// Seed for randomised trial orders
    #[arg(long)]
    pub seed: Option<u64>,

    /// Override the config's output directory
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Args)]
pub struct StreamArgs {
    /// How long to stream
    #[arg(long, default_value_t = 5.0)]
    pub seconds: f64,

    /// Show only the newest sample each frame instead of every sample
    #[arg(long)]
    pub latest: bool,

    /// Use the tokio acquisition bridge
    #[arg(long = "async")]
    pub use_async: bool,

    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(Args)]
pub struct PreviewArgs {
    /// Condition name from the config
    #[arg(long, default_value = "slow_steady")]
    pub condition: String,

    /// Seconds between rows
    #[arg(long, default_value_t = 1.0)]
    pub step: f64,

    /// Breathing center in newtons
    #[arg(long, default_value_t = common::calibration::FALLBACK_CENTER)]
    pub center: f64,

    /// Target amplitude in newtons
    #[arg(long, default_value_t = common::calibration::FALLBACK_AMPLITUDE)]
    pub amplitude: f64,
}

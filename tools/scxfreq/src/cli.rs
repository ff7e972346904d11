use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// scxfreq: pin CPU frequencies through the cpufreq userspace governor.
///
/// Every command takes over all CPUs for its duration and gives the
/// original governor and scaling range back when it exits, including on
/// Ctrl-C.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file. Defaults to /etc/scxfreq.toml if present.
    #[arg(short, long, env = "SCXFREQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Trust the declared frequency list instead of probing each step.
    #[arg(long)]
    pub no_probe: bool,

    /// Enable verbose output.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Rounding {
    /// The frequency must be available as is.
    Exact,
    /// Round up to the next available frequency.
    Geq,
    /// Round down to the previous available frequency.
    Leq,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show CPUs, usable frequencies and the current policy")]
    Info,
    #[command(about = "Pin a frequency and hold it until interrupted")]
    Set {
        #[arg(short, long, help = "Index of the online CPU to pin, all CPUs if omitted")]
        cpu: Option<usize>,
        #[arg(short, long, value_enum, default_value = "exact")]
        round: Rounding,
        #[arg(help = "Frequency in kHz")]
        freq: u64,
    },
    #[command(about = "Step up from the minimum or down from the maximum and hold it until interrupted")]
    Step {
        #[arg(short, long, help = "Index of the online CPU to step, all CPUs if omitted")]
        cpu: Option<usize>,
        #[arg(short, long, default_value = "1", help = "Number of steps")]
        steps: usize,
        #[arg(value_enum)]
        direction: Direction,
    },
    #[command(about = "Measure the mean frequency transition latency")]
    Bench {
        #[arg(short, long, default_value = "10000", help = "Transitions per CPU")]
        transitions: usize,
        #[arg(long, help = "Seed for the frequency sequence")]
        seed: Option<u64>,
    },
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "ckpt-eval",
    version,
    about = "Checkpoint-driven evaluation scheduler for long-running training jobs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate exactly one checkpoint and exit.
    Single(SingleArgs),
    /// Evaluate every pending checkpoint in a directory once.
    Sweep(SweepArgs),
    /// Repeat sweeps until no new checkpoint shows up for a while.
    Watch(WatchArgs),
    /// Report marker and timeline state for a checkpoint directory.
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Launcher {
    None,
    Pytorch,
    Slurm,
}

impl Launcher {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pytorch => "pytorch",
            Self::Slurm => "slurm",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long)]
    pub cfg_file: PathBuf,

    /// Total batch size across all workers; defaults to the config's per-worker size.
    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    #[arg(long, value_enum, default_value_t = Launcher::None)]
    pub launcher: Launcher,

    #[arg(long, default_value_t = 18888)]
    pub tcp_port: u16,

    #[arg(long, default_value_t = 0)]
    pub local_rank: usize,

    #[arg(long, default_value = "default")]
    pub extra_tag: String,

    #[arg(long, default_value = "default")]
    pub eval_tag: String,

    #[arg(long, default_value = "output")]
    pub output_root: PathBuf,

    /// Checkpoints whose epoch is below this floor are never candidates.
    #[arg(long, default_value_t = 0)]
    pub start_epoch: u32,

    #[arg(long, default_value_t = false)]
    pub save_to_file: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SingleArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long)]
    pub ckpt: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct SweepArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Defaults to `<output_dir>/ckpt`.
    #[arg(long)]
    pub ckpt_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    #[command(flatten)]
    pub sweep: SweepArgs,

    #[arg(long, default_value_t = 30)]
    pub max_waiting_mins: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(long)]
    pub ckpt_dir: Option<PathBuf>,
}

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};

use crate::cli::{Launcher, RunArgs};
use crate::config::EvalConfig;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionMode {
    Local,
    Distributed,
}

impl ExecutionMode {
    pub fn metric_subdir(self) -> &'static str {
        match self {
            Self::Local => "metric_test",
            Self::Distributed => "metric_dist_test",
        }
    }

    pub fn is_distributed(self) -> bool {
        self == Self::Distributed
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriterRole {
    Designated,
    Participant,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub rank: usize,
    pub world_size: usize,
    pub mode: ExecutionMode,
    pub writer: WriterRole,
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub workers: usize,
    pub save_predictions: bool,
    pub tcp_port: u16,
    pub start_epoch: u32,
    pub eval_tag: String,
}

impl RunContext {
    pub fn resolve(args: &RunArgs, config: &EvalConfig) -> Result<Self> {
        Self::resolve_with_env(args, config, |key| std::env::var(key).ok())
    }

    pub fn resolve_with_env<F>(args: &RunArgs, config: &EvalConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (rank, world_size) = resolve_rank(args.launcher, args.local_rank, &env)?;
        let mode = match args.launcher {
            Launcher::None => ExecutionMode::Local,
            Launcher::Pytorch | Launcher::Slurm => ExecutionMode::Distributed,
        };

        let batch_size = match args.batch_size {
            None => config.batch_size_per_worker,
            Some(total) => {
                ensure!(
                    total % world_size == 0,
                    "batch size {total} does not divide across {world_size} workers"
                );
                ensure!(total > 0, "batch size must be > 0");
                total / world_size
            }
        };

        Ok(RunContext {
            rank,
            world_size,
            mode,
            writer: if rank == 0 {
                WriterRole::Designated
            } else {
                WriterRole::Participant
            },
            output_dir: output_dir_for(&args.output_root, &args.cfg_file, &args.extra_tag)?,
            batch_size,
            workers: args.workers,
            save_predictions: args.save_to_file,
            tcp_port: args.tcp_port,
            start_epoch: args.start_epoch,
            eval_tag: args.eval_tag.clone(),
        })
    }

    pub fn is_writer(&self) -> bool {
        self.writer == WriterRole::Designated
    }

    pub fn eval_root(&self) -> PathBuf {
        self.output_dir.join("eval")
    }

    pub fn default_ckpt_dir(&self) -> PathBuf {
        self.output_dir.join("ckpt")
    }

    pub fn sweep_output_dir(&self) -> PathBuf {
        self.eval_root().join("eval_all_default").join(&self.eval_tag)
    }

    pub fn single_output_dir(&self, epoch_label: &str, split: &str) -> PathBuf {
        self.eval_root()
            .join(format!("epoch_{epoch_label}"))
            .join(split)
            .join(&self.eval_tag)
    }
}

fn resolve_rank<F>(launcher: Launcher, local_rank: usize, env: &F) -> Result<(usize, usize)>
where
    F: Fn(&str) -> Option<String>,
{
    let (rank, world_size) = match launcher {
        Launcher::None => (0, 1),
        Launcher::Pytorch => (
            parse_env(env, "RANK")?.unwrap_or(local_rank),
            parse_env(env, "WORLD_SIZE")?
                .context("WORLD_SIZE is not set; launch through torchrun or export it")?,
        ),
        Launcher::Slurm => (
            parse_env(env, "SLURM_PROCID")?.context("SLURM_PROCID is not set")?,
            parse_env(env, "SLURM_NTASKS")?.context("SLURM_NTASKS is not set")?,
        ),
    };

    if world_size == 0 || rank >= world_size {
        bail!(
            "invalid {} process layout: rank {rank} of world size {world_size}",
            launcher.as_str()
        );
    }
    Ok((rank, world_size))
}

fn parse_env<F>(env: &F, key: &str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<usize>()
                .with_context(|| format!("{key} is not a non-negative integer: {raw}"))
        })
        .transpose()
}

// `<output_root>/<exp_group>/<cfg_stem>/<extra_tag>`, where the experiment group is the
// config path without its first (`cfgs`) and last (file name) components.
fn output_dir_for(output_root: &Path, cfg_file: &Path, extra_tag: &str) -> Result<PathBuf> {
    let tag = cfg_file
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("config path has no file stem: {}", cfg_file.display()))?;

    let components: Vec<_> = cfg_file
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();

    let mut dir = output_root.to_path_buf();
    if components.len() > 2 {
        for part in &components[1..components.len() - 1] {
            dir.push(part);
        }
    }
    dir.push(tag);
    dir.push(extra_tag);
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Commands};

    fn config() -> EvalConfig {
        serde_json::from_str(
            r#"{
              "dataset": { "test_split": "val", "class_names": ["Car"] },
              "evaluator": { "command": ["eval"] },
              "batch_size_per_worker": 6
            }"#,
        )
        .expect("config parses")
    }

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec![
            "ckpt-eval",
            "sweep",
            "--cfg-file",
            "cfgs/kitti_models/second_iou.json",
        ];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Sweep(args) => args.run,
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn local_run_is_designated_writer_with_config_batch_size() {
        let ctx = RunContext::resolve_with_env(&run_args(&[]), &config(), env_of(&[]))
            .expect("local context resolves");
        assert_eq!(ctx.mode, ExecutionMode::Local);
        assert!(ctx.is_writer());
        assert_eq!(ctx.batch_size, 6);
        assert_eq!(
            ctx.output_dir,
            PathBuf::from("output/kitti_models/second_iou/default")
        );
        assert_eq!(
            ctx.sweep_output_dir(),
            PathBuf::from("output/kitti_models/second_iou/default/eval/eval_all_default/default")
        );
    }

    #[test]
    fn pytorch_launcher_reads_rank_and_divides_batch() {
        let args = run_args(&["--launcher", "pytorch", "--batch-size", "16"]);
        let ctx = RunContext::resolve_with_env(
            &args,
            &config(),
            env_of(&[("RANK", "2"), ("WORLD_SIZE", "4")]),
        )
        .expect("distributed context resolves");
        assert_eq!(ctx.mode, ExecutionMode::Distributed);
        assert_eq!(ctx.rank, 2);
        assert_eq!(ctx.writer, WriterRole::Participant);
        assert_eq!(ctx.batch_size, 4);
    }

    #[test]
    fn indivisible_batch_size_is_rejected() {
        let args = run_args(&["--launcher", "pytorch", "--batch-size", "10"]);
        let err = RunContext::resolve_with_env(
            &args,
            &config(),
            env_of(&[("RANK", "0"), ("WORLD_SIZE", "4")]),
        )
        .expect_err("10 does not split across 4 workers");
        assert!(err.to_string().contains("does not divide"));
    }

    #[test]
    fn slurm_launcher_requires_procid() {
        let args = run_args(&["--launcher", "slurm"]);
        let err = RunContext::resolve_with_env(&args, &config(), env_of(&[("SLURM_NTASKS", "2")]))
            .expect_err("missing SLURM_PROCID");
        assert!(err.to_string().contains("SLURM_PROCID"));
    }

    #[test]
    fn pytorch_launcher_requires_world_size_but_falls_back_to_local_rank() {
        let args = run_args(&["--launcher", "pytorch", "--local-rank", "1"]);
        let err = RunContext::resolve_with_env(&args, &config(), env_of(&[]))
            .expect_err("missing WORLD_SIZE");
        assert!(err.to_string().contains("WORLD_SIZE is not set"));

        let ctx = RunContext::resolve_with_env(&args, &config(), env_of(&[("WORLD_SIZE", "2")]))
            .expect("rank comes from --local-rank");
        assert_eq!(ctx.rank, 1);
        assert_eq!(ctx.world_size, 2);
        assert!(!ctx.is_writer());
    }

    #[test]
    fn metric_subdir_depends_on_mode() {
        assert_eq!(ExecutionMode::Local.metric_subdir(), "metric_test");
        assert_eq!(ExecutionMode::Distributed.metric_subdir(), "metric_dist_test");
    }
}

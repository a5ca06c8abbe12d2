use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::info;
use tracing_subscriber::fmt::{self, format::DefaultFields, format::Format};
use tracing_subscriber::{Registry, reload};

use crate::cli::RunArgs;
use crate::config::EvalConfig;
use crate::context::RunContext;
use crate::util::ensure_directory;

type RunLogLayer = Option<fmt::Layer<Registry, DefaultFields, Format, Arc<File>>>;

static RUN_LOG: OnceLock<reload::Handle<RunLogLayer, Registry>> = OnceLock::new();

pub fn run_log_layer() -> reload::Layer<RunLogLayer, Registry> {
    let (layer, handle) = reload::Layer::new(None);
    let _ = RUN_LOG.set(handle);
    layer
}

pub fn start_run(
    ctx: &RunContext,
    config: &EvalConfig,
    args: &RunArgs,
    eval_output_dir: &Path,
) -> Result<()> {
    if ctx.is_writer() {
        if let Some(path) = attach_run_log(eval_output_dir)? {
            info!(path = %path.display(), "writing evaluation log");
        }
    }

    info!(args = ?args, "command line");
    let devices = std::env::var("CUDA_VISIBLE_DEVICES").unwrap_or_else(|_| "ALL".to_string());
    info!(cuda_visible_devices = %devices, "devices");
    info!(
        rank = ctx.rank,
        world_size = ctx.world_size,
        distributed = ctx.mode.is_distributed(),
        writer = ctx.is_writer(),
        batch_size = ctx.batch_size,
        total_batch_size = ctx.batch_size * ctx.world_size,
        workers = ctx.workers,
        output_dir = %ctx.output_dir.display(),
        eval_output_dir = %eval_output_dir.display(),
        test_split = %config.test_split(),
        evaluator = %config.evaluator.command.join(" "),
        "resolved run context"
    );
    let config_json =
        serde_json::to_string(config).context("failed to serialize configuration")?;
    info!(config = %config_json, "configuration");
    Ok(())
}

fn attach_run_log(eval_output_dir: &Path) -> Result<Option<PathBuf>> {
    let Some(handle) = RUN_LOG.get() else {
        return Ok(None);
    };

    let (path, file) = create_run_log(eval_output_dir, Utc::now())?;
    let layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(file));
    handle
        .reload(Some(layer))
        .with_context(|| format!("failed to attach {}", path.display()))?;
    Ok(Some(path))
}

fn create_run_log(eval_output_dir: &Path, now: DateTime<Utc>) -> Result<(PathBuf, File)> {
    ensure_directory(eval_output_dir)?;
    let path = eval_output_dir.join(format!("log_eval_{}.txt", now.format("%Y%m%d-%H%M%S")));
    let file = File::options()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok((path, file))
}

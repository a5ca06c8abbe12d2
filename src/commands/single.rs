use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{info, warn};

use super::record::{RecordOutcome, ResultRecorder};
use super::sweep::new_run_id;
use crate::cli::SingleArgs;
use crate::config::EvalConfig;
use crate::context::RunContext;
use crate::error::CandidateRejection;
use crate::eval::{
    CheckpointEvaluator, CommandEvaluationService, EvaluationService, LoadedCheckpoint,
};
use crate::logging;
use crate::queue::{CheckpointPattern, CheckpointRef, CompletionLedger, EpochId, EpochList};
use crate::timeline::SqliteTimeline;

#[derive(Debug)]
pub enum SingleOutcome {
    Skipped,
    Evaluated(RecordOutcome),
}

pub fn run(args: SingleArgs) -> Result<()> {
    let config = EvalConfig::load(&args.run.cfg_file)?;
    let ctx = RunContext::resolve(&args.run, &config)?;
    // An unparseable name is reported by `execute`; its log still needs a home.
    let pattern = CheckpointPattern::new(&config.checkpoint)?;
    let eval_output_dir = match resolve_epoch(&pattern, &args.ckpt) {
        Ok(epoch) => ctx.single_output_dir(epoch.label(), config.test_split()),
        Err(_) => ctx.sweep_output_dir(),
    };
    logging::start_run(&ctx, &config, &args.run, &eval_output_dir)?;

    let mut service = CommandEvaluationService::from_config(&config.evaluator);
    if ctx.mode.is_distributed() {
        service = service.with_master_port(ctx.tcp_port);
    }

    execute(&ctx, &config, &args.ckpt, service)?;
    Ok(())
}

pub fn execute<S>(
    ctx: &RunContext,
    config: &EvalConfig,
    ckpt: &Path,
    service: S,
) -> Result<SingleOutcome>
where
    S: EvaluationService<LoadedCheckpoint>,
{
    let ledger = CompletionLedger::for_checkpoint(ckpt, ctx.mode);
    if ledger.is_complete(ckpt) {
        info!(
            marker = %ledger.marker_path(ckpt).display(),
            "skip evaluation because the marker exists and is not empty"
        );
        return Ok(SingleOutcome::Skipped);
    }

    let pattern = CheckpointPattern::new(&config.checkpoint)?;
    let epoch = resolve_epoch(&pattern, ckpt)?;
    let modified = fs::metadata(ckpt)
        .and_then(|metadata| metadata.modified())
        .with_context(|| format!("failed to inspect checkpoint {}", ckpt.display()))?;
    let checkpoint = CheckpointRef {
        path: ckpt.to_path_buf(),
        epoch,
        modified,
    };

    let split = config.test_split();
    let output_dir = ctx.single_output_dir(checkpoint.epoch.label(), split);

    let mut recorder = ResultRecorder::new(ctx, ledger)
        .with_epoch_list(EpochList::for_split(&output_dir, split));
    if ctx.is_writer() {
        let timeline = SqliteTimeline::open(
            &SqliteTimeline::path_for_split(&output_dir, split),
            &new_run_id("single"),
        )?;
        recorder = recorder.with_sink(Box::new(timeline));
    }

    let mut evaluator = CheckpointEvaluator::new(ctx, config, LoadedCheckpoint::new(), service);
    let result = evaluator
        .evaluate(&checkpoint, &output_dir)
        .with_context(|| format!("failed to evaluate {}", ckpt.display()))?;
    for (name, value) in &result.metrics {
        info!(epoch = %checkpoint.epoch, metric = %name, value, "metric");
    }

    let outcome = recorder.record(&checkpoint, &result);
    match outcome {
        RecordOutcome::MarkerFailed(err) => {
            info!(report = %result.report_text, "evaluation report");
            return Err(err).context("evaluation finished but completion was not recorded");
        }
        RecordOutcome::MetricsFailed { ref marker, ref error } => warn!(
            marker = %marker.display(),
            error = %format!("{error:#}"),
            "completion recorded but metrics timeline append failed"
        ),
        RecordOutcome::Committed(_) | RecordOutcome::NotWriter => {}
    }
    if let Err(err) = recorder.flush() {
        warn!(error = %format!("{err:#}"), "failed to flush metrics timeline");
    }

    Ok(SingleOutcome::Evaluated(outcome))
}

fn resolve_epoch(pattern: &CheckpointPattern, ckpt: &Path) -> Result<EpochId> {
    let filename = ckpt
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid UTF-8 filename: {}", ckpt.display()))?;

    match pattern.parse_epoch(filename) {
        Ok(epoch) => return Ok(epoch),
        Err(rejection @ CandidateRejection::Companion(_)) => {
            bail!("refusing to evaluate {}: {rejection}", ckpt.display())
        }
        Err(_) => {}
    }

    let stem = ckpt
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    let number = Regex::new(r"\d+(?:\.\d+)?").context("failed to compile epoch fallback regex")?;
    number
        .find_iter(stem)
        .last()
        .and_then(|m| EpochId::parse(m.as_str()))
        .with_context(|| format!("cannot determine an epoch for {}", ckpt.display()))
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use super::record::{RecordOutcome, ResultRecorder};
use crate::cli::SweepArgs;
use crate::config::EvalConfig;
use crate::context::RunContext;
use crate::error::EvaluateError;
use crate::eval::{
    CheckpointEvaluator, CommandEvaluationService, EvaluationService, LoadedCheckpoint,
    ModelInstance,
};
use crate::logging;
use crate::model::{
    CheckpointOutcome, CheckpointReport, SweepCounts, SweepPaths, SweepRunManifest,
};
use crate::queue::{
    CheckpointPattern, CheckpointRef, CheckpointSource, CompletionLedger, DirectoryScanner,
    EpochList,
};
use crate::timeline::SqliteTimeline;
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

#[derive(Debug, Clone)]
pub struct SweepControl {
    stop_flag: Arc<AtomicBool>,
    stop_file: Option<PathBuf>,
    armed_at: SystemTime,
}

impl Default for SweepControl {
    fn default() -> Self {
        SweepControl {
            stop_flag: Arc::default(),
            stop_file: None,
            armed_at: SystemTime::now(),
        }
    }
}

impl SweepControl {
    pub fn new() -> Self {
        Self::default()
    }

    // Only a stop file modified after this control was created counts.
    pub fn with_stop_file(mut self, path: PathBuf) -> Self {
        if path.exists() {
            warn!(path = %path.display(), "ignoring stop file left from an earlier run");
        }
        self.stop_file = Some(path);
        self
    }

    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst) || self.stop_file_is_fresh()
    }

    fn stop_file_is_fresh(&self) -> bool {
        self.stop_file
            .as_deref()
            .and_then(|path| fs::metadata(path).and_then(|metadata| metadata.modified()).ok())
            .is_some_and(|modified| modified >= self.armed_at)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    pub counts: SweepCounts,
    pub cancelled: bool,
    pub checkpoints: Vec<CheckpointReport>,
}

impl SweepSummary {
    fn push(
        &mut self,
        checkpoint: &CheckpointRef,
        outcome: CheckpointOutcome,
        detail: Option<String>,
    ) {
        match outcome {
            CheckpointOutcome::AlreadyEvaluated => self.counts.already_evaluated += 1,
            CheckpointOutcome::Evaluated | CheckpointOutcome::EvaluatedWithoutMetrics => {
                self.counts.evaluated += 1
            }
            CheckpointOutcome::EvaluatedUnrecorded => self.counts.unrecorded += 1,
            CheckpointOutcome::LoadFailed | CheckpointOutcome::EvaluationFailed => {
                self.counts.failed += 1
            }
            CheckpointOutcome::NotReached => self.counts.not_reached += 1,
        }
        self.checkpoints.push(CheckpointReport {
            checkpoint: checkpoint.path.display().to_string(),
            epoch: checkpoint.epoch.to_string(),
            outcome,
            detail,
        });
    }

    pub fn attempted(&self) -> usize {
        self.counts.evaluated + self.counts.failed + self.counts.unrecorded
    }
}

pub struct SweepDriver<'a, M, S> {
    source: Box<dyn CheckpointSource + 'a>,
    evaluator: CheckpointEvaluator<'a, M, S>,
    recorder: ResultRecorder<'a>,
    output_dir: PathBuf,
    split: String,
}

impl<'a, M, S> SweepDriver<'a, M, S>
where
    M: ModelInstance,
    S: EvaluationService<M>,
{
    pub fn new(
        source: Box<dyn CheckpointSource + 'a>,
        evaluator: CheckpointEvaluator<'a, M, S>,
        recorder: ResultRecorder<'a>,
        output_dir: PathBuf,
        split: &str,
    ) -> Self {
        SweepDriver {
            source,
            evaluator,
            recorder,
            output_dir,
            split: split.to_string(),
        }
    }

    pub fn source(&self) -> &dyn CheckpointSource {
        self.source.as_ref()
    }

    pub fn recorder(&self) -> &ResultRecorder<'a> {
        &self.recorder
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    #[cfg(test)]
    pub fn evaluator(&self) -> &CheckpointEvaluator<'a, M, S> {
        &self.evaluator
    }

    pub fn sweep(&mut self, control: &SweepControl) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        let checkpoints = self.source.list()?;
        summary.counts.found = checkpoints.len();
        info!(
            count = checkpoints.len(),
            dir = %self.source.location().display(),
            "found checkpoints"
        );

        let pending = self.filter_pending(checkpoints, &mut summary);

        for (index, checkpoint) in pending.iter().enumerate() {
            if control.is_stop_requested() {
                warn!(remaining = pending.len() - index, "stop requested, ending sweep early");
                summary.cancelled = true;
                for skipped in &pending[index..] {
                    summary.push(skipped, CheckpointOutcome::NotReached, None);
                }
                break;
            }

            let (outcome, detail) = self.evaluate_one(checkpoint);
            summary.push(checkpoint, outcome, detail);
        }

        if let Err(err) = self.recorder.flush() {
            warn!(error = %format!("{err:#}"), "failed to flush metrics timeline");
        }

        info!(
            evaluated = summary.counts.evaluated,
            already_evaluated = summary.counts.already_evaluated,
            failed = summary.counts.failed,
            unrecorded = summary.counts.unrecorded,
            not_reached = summary.counts.not_reached,
            "sweep completed"
        );

        Ok(summary)
    }

    fn filter_pending(
        &self,
        checkpoints: Vec<CheckpointRef>,
        summary: &mut SweepSummary,
    ) -> Vec<CheckpointRef> {
        let recorded = self
            .recorder
            .epoch_list()
            .map(EpochList::load)
            .unwrap_or_default();
        let ledger = self.recorder.ledger();

        let mut pending = Vec::new();
        for checkpoint in checkpoints {
            if ledger.is_complete(&checkpoint.path) {
                info!(path = %checkpoint.path.display(), "- evaluated");
                summary.push(&checkpoint, CheckpointOutcome::AlreadyEvaluated, None);
                continue;
            }

            if recorded.contains(&checkpoint.epoch) {
                warn!(
                    path = %checkpoint.path.display(),
                    epoch = %checkpoint.epoch,
                    "epoch list claims this epoch but its marker is missing"
                );
            }
            info!(path = %checkpoint.path.display(), "- to evaluate");
            pending.push(checkpoint);
        }
        pending
    }

    fn evaluate_one(&mut self, checkpoint: &CheckpointRef) -> (CheckpointOutcome, Option<String>) {
        let result_dir = self
            .output_dir
            .join(format!("epoch_{}", checkpoint.epoch))
            .join(&self.split);

        let result = match self.evaluator.evaluate(checkpoint, &result_dir) {
            Ok(result) => result,
            Err(err) => {
                warn!(path = %checkpoint.path.display(), error = %err, "skipping checkpoint");
                let outcome = match &err {
                    EvaluateError::Load(_) => CheckpointOutcome::LoadFailed,
                    EvaluateError::OutputDir { .. } | EvaluateError::Service { .. } => {
                        CheckpointOutcome::EvaluationFailed
                    }
                };
                return (outcome, Some(err.to_string()));
            }
        };

        for (name, value) in &result.metrics {
            info!(epoch = %checkpoint.epoch, metric = %name, value, "metric");
        }

        match self.recorder.record(checkpoint, &result) {
            RecordOutcome::Committed(_) | RecordOutcome::NotWriter => {
                (CheckpointOutcome::Evaluated, None)
            }
            RecordOutcome::MetricsFailed { marker, error } => {
                let detail = format!("{error:#}");
                warn!(
                    path = %checkpoint.path.display(),
                    marker = %marker.display(),
                    error = %detail,
                    "completion recorded but metrics timeline append failed"
                );
                (CheckpointOutcome::EvaluatedWithoutMetrics, Some(detail))
            }
            RecordOutcome::MarkerFailed(err) => {
                warn!(
                    path = %checkpoint.path.display(),
                    error = %err,
                    report = %result.report_text,
                    "evaluation finished but completion was not recorded"
                );
                (CheckpointOutcome::EvaluatedUnrecorded, Some(err.to_string()))
            }
        }
    }
}

pub type CommandSweepDriver<'a> = SweepDriver<'a, LoadedCheckpoint, CommandEvaluationService>;

pub fn prepare<'a>(
    ctx: &'a RunContext,
    config: &'a EvalConfig,
    ckpt_dir: &Path,
    run_id: &str,
) -> Result<CommandSweepDriver<'a>> {
    let split = config.test_split();
    let output_dir = ctx.sweep_output_dir();

    let scanner = DirectoryScanner::new(ckpt_dir, CheckpointPattern::new(&config.checkpoint)?)
        .with_start_epoch(ctx.start_epoch);
    let ledger = CompletionLedger::for_checkpoint_dir(ckpt_dir, ctx.mode);

    let mut recorder = ResultRecorder::new(ctx, ledger)
        .with_epoch_list(EpochList::for_split(&output_dir, split));
    if ctx.is_writer() {
        let timeline =
            SqliteTimeline::open(&SqliteTimeline::path_for_split(&output_dir, split), run_id)?;
        recorder = recorder.with_sink(Box::new(timeline));
    }

    let mut service = CommandEvaluationService::from_config(&config.evaluator);
    if ctx.mode.is_distributed() {
        service = service.with_master_port(ctx.tcp_port);
    }
    let evaluator = CheckpointEvaluator::new(ctx, config, LoadedCheckpoint::new(), service);

    Ok(SweepDriver::new(
        Box::new(scanner),
        evaluator,
        recorder,
        output_dir,
        split,
    ))
}

pub fn new_run_id(prefix: &str) -> String {
    format!("{prefix}-{}", utc_compact_string(Utc::now()))
}

pub struct ManifestWriter<'a> {
    ctx: &'a RunContext,
    command: &'static str,
    test_split: String,
    manifest_dir: PathBuf,
    paths: SweepPaths,
}

impl<'a> ManifestWriter<'a> {
    pub fn for_driver<M, S>(
        ctx: &'a RunContext,
        config: &EvalConfig,
        driver: &SweepDriver<'_, M, S>,
        command: &'static str,
    ) -> Self
    where
        M: ModelInstance,
        S: EvaluationService<M>,
    {
        let output_dir = driver.output_dir();
        ManifestWriter {
            ctx,
            command,
            test_split: config.test_split().to_string(),
            manifest_dir: output_dir.join("manifests"),
            paths: SweepPaths {
                checkpoint_dir: driver.source().location().display().to_string(),
                marker_dir: driver.recorder().ledger().marker_dir().display().to_string(),
                eval_output_dir: output_dir.display().to_string(),
                timeline_path: ctx.is_writer().then(|| {
                    SqliteTimeline::path_for_split(output_dir, config.test_split())
                        .display()
                        .to_string()
                }),
                epoch_list_path: driver
                    .recorder()
                    .epoch_list()
                    .map(|list| list.path().display().to_string()),
            },
        }
    }

    pub fn write(
        &self,
        run_id: &str,
        summary: &SweepSummary,
        started_at: String,
    ) -> Result<Option<PathBuf>> {
        if !self.ctx.is_writer() {
            return Ok(None);
        }

        let manifest = SweepRunManifest {
            manifest_version: 1,
            run_id: run_id.to_string(),
            command: self.command.to_string(),
            started_at,
            updated_at: now_utc_string(),
            mode: self.ctx.mode.metric_subdir().to_string(),
            rank: self.ctx.rank,
            world_size: self.ctx.world_size,
            test_split: self.test_split.clone(),
            cancelled: summary.cancelled,
            paths: self.paths.clone(),
            counts: summary.counts.clone(),
            checkpoints: summary.checkpoints.clone(),
        };

        let path = self.manifest_dir.join(format!("{run_id}.json"));
        write_json_pretty(&path, &manifest)?;
        info!(path = %path.display(), "wrote sweep manifest");
        Ok(Some(path))
    }
}

pub fn run(args: SweepArgs) -> Result<()> {
    let config = EvalConfig::load(&args.run.cfg_file)?;
    let ctx = RunContext::resolve(&args.run, &config)?;
    logging::start_run(&ctx, &config, &args.run, &ctx.sweep_output_dir())?;

    let ckpt_dir = args
        .ckpt_dir
        .clone()
        .unwrap_or_else(|| ctx.default_ckpt_dir());
    let run_id = new_run_id("sweep");
    let started_at = now_utc_string();

    let mut driver = prepare(&ctx, &config, &ckpt_dir, &run_id)?;
    let control = SweepControl::new().with_stop_file(ctx.sweep_output_dir().join("STOP"));
    let summary = driver.sweep(&control)?;

    ManifestWriter::for_driver(&ctx, &config, &driver, "sweep").write(
        &run_id,
        &summary,
        started_at,
    )?;
    Ok(())
}

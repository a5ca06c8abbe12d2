use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cli::StatusArgs;
use crate::config::EvalConfig;
use crate::context::RunContext;
use crate::queue::{
    CheckpointPattern, CheckpointRef, CheckpointSource, CompletionLedger, DirectoryScanner,
    EpochList,
};
use crate::timeline::{self, SqliteTimeline, TimelineSummary};

#[derive(Debug, Default)]
pub struct StatusReport {
    pub checkpoints: Vec<(CheckpointRef, bool)>,
    pub listed_without_marker: Vec<String>,
    pub marked_but_unlisted: Vec<String>,
    pub listed_epochs: usize,
    pub timeline: Option<TimelineSummary>,
}

impl StatusReport {
    pub fn complete(&self) -> usize {
        self.checkpoints.iter().filter(|(_, done)| *done).count()
    }

    pub fn pending(&self) -> usize {
        self.checkpoints.len() - self.complete()
    }
}

pub fn run(args: StatusArgs) -> Result<()> {
    let config = EvalConfig::load(&args.run.cfg_file)?;
    let ctx = RunContext::resolve(&args.run, &config)?;
    let ckpt_dir = args.ckpt_dir.unwrap_or_else(|| ctx.default_ckpt_dir());

    info!(ckpt_dir = %ckpt_dir.display(), "status requested");
    let report = collect(&ctx, &config, &ckpt_dir)?;

    for (checkpoint, done) in &report.checkpoints {
        info!(
            path = %checkpoint.path.display(),
            epoch = %checkpoint.epoch,
            state = if *done { "complete" } else { "pending" },
            "checkpoint"
        );
    }
    info!(
        found = report.checkpoints.len(),
        complete = report.complete(),
        pending = report.pending(),
        listed_epochs = report.listed_epochs,
        "marker status"
    );

    for epoch in &report.listed_without_marker {
        warn!(epoch = %epoch, "epoch list claims this epoch but its marker is missing");
    }
    for epoch in &report.marked_but_unlisted {
        warn!(epoch = %epoch, "marker exists but the epoch list does not mention it");
    }

    let timeline_path =
        SqliteTimeline::path_for_split(&ctx.sweep_output_dir(), config.test_split());
    match &report.timeline {
        Some(summary) => info!(
            path = %timeline_path.display(),
            scalars = summary.scalar_rows,
            epochs = summary.distinct_epochs,
            latest_epoch = summary.latest_epoch.unwrap_or_default(),
            "timeline status"
        ),
        None => warn!(path = %timeline_path.display(), "timeline file missing"),
    }

    Ok(())
}

pub fn collect(ctx: &RunContext, config: &EvalConfig, ckpt_dir: &Path) -> Result<StatusReport> {
    let split = config.test_split();
    let output_dir = ctx.sweep_output_dir();

    let scanner = DirectoryScanner::new(ckpt_dir, CheckpointPattern::new(&config.checkpoint)?)
        .with_start_epoch(ctx.start_epoch);
    let ledger = CompletionLedger::for_checkpoint_dir(ckpt_dir, ctx.mode);
    let epoch_list = EpochList::for_split(&output_dir, split);
    let recorded = epoch_list.load();
    if recorded.is_empty() {
        debug!(path = %epoch_list.path().display(), "epoch list missing or empty");
    }

    let mut report = StatusReport {
        listed_epochs: recorded.len(),
        ..StatusReport::default()
    };
    for checkpoint in scanner.list()? {
        let done = ledger.is_complete(&checkpoint.path);
        if done && !recorded.contains(&checkpoint.epoch) {
            report.marked_but_unlisted.push(checkpoint.epoch.to_string());
        }
        report.checkpoints.push((checkpoint, done));
    }

    let floor = f64::from(ctx.start_epoch);
    for value in recorded.values() {
        // Below the floor nothing was scanned, so there is nothing to compare.
        if value.trunc() < floor {
            continue;
        }
        let has_marker = report
            .checkpoints
            .iter()
            .any(|(checkpoint, done)| *done && checkpoint.epoch.value() == *value);
        let label = value.to_string();
        if !has_marker && !report.listed_without_marker.contains(&label) {
            report.listed_without_marker.push(label);
        }
    }

    let timeline_path = SqliteTimeline::path_for_split(&output_dir, split);
    if timeline_path.exists() {
        report.timeline = Some(timeline::summarize(&timeline_path)?);
    }

    Ok(report)
}

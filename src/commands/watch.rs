use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::info;

use super::sweep::{
    ManifestWriter, SweepControl, SweepDriver, SweepSummary, new_run_id, prepare,
};
use crate::cli::WatchArgs;
use crate::config::EvalConfig;
use crate::context::RunContext;
use crate::eval::{EvaluationService, ModelInstance};
use crate::logging;
use crate::model::SweepCounts;
use crate::util::now_utc_string;

#[derive(Debug, Clone, Copy)]
pub struct WatchPolicy {
    pub max_idle: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct WatchReport {
    pub sweeps: usize,
    pub totals: SweepCounts,
    pub stopped_by_request: bool,
}

pub fn watch_loop<M, S, A, W>(
    driver: &mut SweepDriver<'_, M, S>,
    control: &SweepControl,
    policy: WatchPolicy,
    mut after_sweep: A,
    mut sleep: W,
) -> Result<WatchReport>
where
    M: ModelInstance,
    S: EvaluationService<M>,
    A: FnMut(usize, &SweepSummary) -> Result<()>,
    W: FnMut(Duration),
{
    let mut report = WatchReport::default();
    let mut last_progress = Instant::now();

    loop {
        let summary = driver.sweep(control)?;
        report.sweeps += 1;
        accumulate(&mut report.totals, &summary.counts);
        after_sweep(report.sweeps, &summary)?;

        if summary.counts.evaluated > 0 {
            last_progress = Instant::now();
        }

        if summary.cancelled || control.is_stop_requested() {
            info!(sweeps = report.sweeps, "stop requested, leaving watch mode");
            report.stopped_by_request = true;
            break;
        }

        let idle = last_progress.elapsed();
        if idle >= policy.max_idle {
            info!(
                sweeps = report.sweeps,
                idle_secs = idle.as_secs(),
                "no new checkpoint evaluated within the wait budget"
            );
            break;
        }

        info!(
            wait_secs = policy.poll_interval.as_secs(),
            idle_secs = idle.as_secs(),
            "waiting for new checkpoints"
        );
        sleep(policy.poll_interval);
    }

    info!(
        sweeps = report.sweeps,
        evaluated = report.totals.evaluated,
        failed = report.totals.failed,
        unrecorded = report.totals.unrecorded,
        "watch finished"
    );
    Ok(report)
}

fn accumulate(totals: &mut SweepCounts, counts: &SweepCounts) {
    totals.found = counts.found;
    totals.already_evaluated = counts.already_evaluated;
    totals.evaluated += counts.evaluated;
    totals.failed += counts.failed;
    totals.unrecorded += counts.unrecorded;
    totals.not_reached = counts.not_reached;
}

pub fn run(args: WatchArgs) -> Result<()> {
    let config = EvalConfig::load(&args.sweep.run.cfg_file)?;
    let ctx = RunContext::resolve(&args.sweep.run, &config)?;
    logging::start_run(&ctx, &config, &args.sweep.run, &ctx.sweep_output_dir())?;

    let ckpt_dir = args
        .sweep
        .ckpt_dir
        .clone()
        .unwrap_or_else(|| ctx.default_ckpt_dir());
    let run_id = new_run_id("watch");

    let mut driver = prepare(&ctx, &config, &ckpt_dir, &run_id)?;
    let control = SweepControl::new().with_stop_file(ctx.sweep_output_dir().join("STOP"));
    let policy = WatchPolicy {
        max_idle: Duration::from_secs(args.max_waiting_mins * 60),
        poll_interval: Duration::from_secs(config.poll_interval_secs),
    };

    let manifests = ManifestWriter::for_driver(&ctx, &config, &driver, "watch");
    let mut sweep_started_at = now_utc_string();
    let report = watch_loop(
        &mut driver,
        &control,
        policy,
        |index, summary| {
            // Idle polls that found nothing new leave no manifest behind.
            if summary.attempted() > 0 || summary.cancelled {
                let started_at = std::mem::replace(&mut sweep_started_at, now_utc_string());
                manifests.write(&format!("{run_id}-{index:04}"), summary, started_at)?;
            } else {
                sweep_started_at = now_utc_string();
            }
            Ok(())
        },
        thread::sleep,
    )?;

    info!(sweeps = report.sweeps, "watch completed");
    Ok(())
}

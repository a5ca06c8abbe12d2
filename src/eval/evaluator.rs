use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::info;

use crate::config::EvalConfig;
use crate::context::RunContext;
use crate::error::{CheckpointLoadError, EvaluateError};
use crate::queue::CheckpointRef;

pub trait ModelInstance {
    fn load_params(&mut self, path: &Path) -> Result<(), CheckpointLoadError>;
}

pub trait EvaluationService<M: ModelInstance> {
    fn evaluate(
        &mut self,
        model: &M,
        request: &EvaluationRequest<'_>,
    ) -> anyhow::Result<EvaluationResult>;
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluationRequest<'a> {
    pub checkpoint: &'a CheckpointRef,
    pub output_dir: &'a Path,
    pub config: &'a EvalConfig,
    pub distributed: bool,
    pub save_predictions: bool,
    pub batch_size: usize,
    pub workers: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    pub metrics: BTreeMap<String, f64>,
    pub report_text: String,
}

impl EvaluationResult {
    // A blank report falls back to the metrics; an empty marker reads as pending.
    pub fn marker_text(&self) -> String {
        if !self.report_text.trim().is_empty() {
            return self.report_text.clone();
        }

        let mut out = String::new();
        for (name, value) in &self.metrics {
            let _ = writeln!(out, "{name}: {value}");
        }
        if out.is_empty() {
            out.push_str("evaluation completed without metrics\n");
        }
        out
    }
}

pub struct CheckpointEvaluator<'a, M, S> {
    ctx: &'a RunContext,
    config: &'a EvalConfig,
    model: M,
    service: S,
}

impl<'a, M, S> CheckpointEvaluator<'a, M, S>
where
    M: ModelInstance,
    S: EvaluationService<M>,
{
    pub fn new(ctx: &'a RunContext, config: &'a EvalConfig, model: M, service: S) -> Self {
        CheckpointEvaluator {
            ctx,
            config,
            model,
            service,
        }
    }

    pub fn evaluate(
        &mut self,
        checkpoint: &CheckpointRef,
        output_dir: &Path,
    ) -> Result<EvaluationResult, EvaluateError> {
        self.model.load_params(&checkpoint.path)?;
        info!(path = %checkpoint.path.display(), epoch = %checkpoint.epoch, "loaded checkpoint");

        fs::create_dir_all(output_dir).map_err(|source| EvaluateError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let request = EvaluationRequest {
            checkpoint,
            output_dir,
            config: self.config,
            distributed: self.ctx.mode.is_distributed(),
            save_predictions: self.ctx.save_predictions,
            batch_size: self.ctx.batch_size,
            workers: self.ctx.workers,
        };

        self.service
            .evaluate(&self.model, &request)
            .map_err(|err| EvaluateError::Service {
                epoch: checkpoint.epoch.to_string(),
                message: format!("{err:#}"),
            })
    }

    #[cfg(test)]
    pub fn parts(&self) -> (&M, &S) {
        (&self.model, &self.service)
    }
}

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::evaluator::{EvaluationRequest, EvaluationResult, EvaluationService};
use super::params::{CheckpointState, LoadedCheckpoint};
use crate::config::{DatasetConfig, EvaluatorConfig, ModelFlags};

// Worker contract: JSON request on stdin, `{"metrics": {...}, "report": "..."}` as
// the last non-empty stdout line.
#[derive(Debug, Clone)]
pub struct CommandEvaluationService {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    checkpoint: &'a CheckpointState,
    epoch: &'a str,
    epoch_value: f64,
    output_dir: &'a Path,
    distributed: bool,
    save_predictions: bool,
    batch_size: usize,
    workers: usize,
    dataset: &'a DatasetConfig,
    model: &'a ModelFlags,
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    report: String,
}

impl CommandEvaluationService {
    pub fn from_config(config: &EvaluatorConfig) -> Self {
        let mut command = config.command.iter().cloned();
        CommandEvaluationService {
            program: command.next().unwrap_or_default(),
            args: command.collect(),
            env: config.env.clone(),
        }
    }

    pub fn with_master_port(mut self, port: u16) -> Self {
        self.env
            .entry("MASTER_PORT".to_string())
            .or_insert_with(|| port.to_string());
        self
    }
}

impl EvaluationService<LoadedCheckpoint> for CommandEvaluationService {
    fn evaluate(
        &mut self,
        model: &LoadedCheckpoint,
        request: &EvaluationRequest<'_>,
    ) -> Result<EvaluationResult> {
        let state = model
            .state()
            .context("model has no checkpoint parameters loaded")?;

        let payload = serde_json::to_vec(&WorkerRequest {
            checkpoint: state,
            epoch: request.checkpoint.epoch.label(),
            epoch_value: request.checkpoint.epoch.value(),
            output_dir: request.output_dir,
            distributed: request.distributed,
            save_predictions: request.save_predictions,
            batch_size: request.batch_size,
            workers: request.workers,
            dataset: request.config.eval_dataset(),
            model: &request.config.model,
        })
        .context("failed to serialize evaluation request")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to execute evaluator {}", self.program))?;

        {
            let mut stdin = child
                .stdin
                .take()
                .context("evaluator stdin was not captured")?;
            stdin
                .write_all(&payload)
                .context("failed to send request to evaluator")?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for evaluator {}", self.program))?;

        if !output.status.success() {
            bail!(
                "evaluator {} returned non-zero exit status for {}: {}",
                self.program,
                request.checkpoint.path.display(),
                output.status
            );
        }

        parse_worker_output(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_worker_output(stdout: &str) -> Result<EvaluationResult> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .context("evaluator produced no output")?;

    let response: WorkerResponse =
        serde_json::from_str(line).context("failed to parse evaluator response")?;

    let mut metrics = BTreeMap::new();
    for (name, value) in response.metrics {
        match value.as_f64() {
            Some(number) => {
                metrics.insert(name, number);
            }
            None => debug!(metric = %name, "dropping non-scalar metric"),
        }
    }

    Ok(EvaluationResult {
        metrics,
        report_text: response.report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_worker_output_uses_last_line_and_keeps_scalars() {
        let stdout = "loading dataset...\n\
            {\"metrics\": {\"Car_3d/moderate\": 79.5, \"recall/rcnn_0.5\": 0.91, \"per_class\": [1, 2]}, \"report\": \"Car AP: 79.5\"}\n\n";
        let result = parse_worker_output(stdout).expect("valid worker output");
        assert_eq!(result.metrics.len(), 2);
        assert_eq!(result.metrics["Car_3d/moderate"], 79.5);
        assert_eq!(result.report_text, "Car AP: 79.5");
    }

    #[test]
    fn parse_worker_output_rejects_empty_stdout() {
        let err = parse_worker_output("\n  \n").expect_err("empty output");
        assert_eq!(err.to_string(), "evaluator produced no output");
    }

    #[test]
    fn master_port_does_not_override_explicit_env() {
        let config = EvaluatorConfig {
            command: vec!["python".into(), "eval_worker.py".into()],
            env: BTreeMap::from([("MASTER_PORT".to_string(), "29500".to_string())]),
        };
        let service = CommandEvaluationService::from_config(&config).with_master_port(18888);
        assert_eq!(service.program, "python");
        assert_eq!(service.args, vec!["eval_worker.py".to_string()]);
        assert_eq!(service.env["MASTER_PORT"], "29500");
    }
}

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Result, bail};

use crate::config::EvalConfig;
use crate::context::{ExecutionMode, RunContext, WriterRole};
use crate::eval::{EvaluationRequest, EvaluationResult, EvaluationService, LoadedCheckpoint};

pub fn zip_bytes(payload: &[u8]) -> Vec<u8> {
    let mut bytes = b"PK\x03\x04".to_vec();
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(b"PK\x05\x06");
    bytes.extend_from_slice(&[0_u8; 18]);
    bytes
}

pub fn write_file_at(dir: &Path, name: &str, bytes: &[u8], secs: u64) -> PathBuf {
    fs::create_dir_all(dir).expect("create checkpoint dir");
    let path = dir.join(name);
    fs::write(&path, bytes).expect("write checkpoint");
    File::options()
        .write(true)
        .open(&path)
        .and_then(|file| file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)))
        .expect("set mtime");
    path
}

pub fn write_checkpoint(dir: &Path, name: &str, secs: u64) -> PathBuf {
    write_file_at(dir, name, &zip_bytes(name.as_bytes()), secs)
}

pub fn config() -> EvalConfig {
    serde_json::from_str(
        r#"{
          "dataset": { "test_split": "val", "class_names": ["Car", "Pedestrian", "Cyclist"] },
          "evaluator": { "command": ["eval-worker"] },
          "poll_interval_secs": 1
        }"#,
    )
    .expect("test config parses")
}

pub fn context(output_dir: &Path, mode: ExecutionMode, writer: WriterRole) -> RunContext {
    RunContext {
        rank: if writer == WriterRole::Designated { 0 } else { 1 },
        world_size: if mode == ExecutionMode::Local { 1 } else { 2 },
        mode,
        writer,
        output_dir: output_dir.to_path_buf(),
        batch_size: 4,
        workers: 2,
        save_predictions: false,
        tcp_port: 18888,
        start_epoch: 0,
        eval_tag: "default".to_string(),
    }
}

pub fn local_context(output_dir: &Path) -> RunContext {
    context(output_dir, ExecutionMode::Local, WriterRole::Designated)
}

#[derive(Debug, Default)]
pub struct RecordingService {
    pub calls: Vec<RecordedCall>,
    pub fail_epochs: Vec<String>,
    pub blank_reports: bool,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub epoch: String,
    pub checkpoint_sha256: String,
    pub output_dir: PathBuf,
    pub distributed: bool,
}

impl RecordingService {
    pub fn epochs(&self) -> Vec<String> {
        self.calls.iter().map(|call| call.epoch.clone()).collect()
    }
}

impl EvaluationService<LoadedCheckpoint> for RecordingService {
    fn evaluate(
        &mut self,
        model: &LoadedCheckpoint,
        request: &EvaluationRequest<'_>,
    ) -> Result<EvaluationResult> {
        let Some(state) = model.state() else {
            bail!("no checkpoint loaded");
        };
        let epoch = request.checkpoint.epoch.label().to_string();
        self.calls.push(RecordedCall {
            epoch: epoch.clone(),
            checkpoint_sha256: state.sha256.clone(),
            output_dir: request.output_dir.to_path_buf(),
            distributed: request.distributed,
        });

        if self.fail_epochs.contains(&epoch) {
            bail!("worker crashed on epoch {epoch}");
        }

        let score = request.checkpoint.epoch.value() * 10.0;
        Ok(EvaluationResult {
            metrics: BTreeMap::from([
                ("Car_3d/moderate".to_string(), score),
                ("recall/rcnn_0.7".to_string(), score / 100.0),
            ]),
            report_text: if self.blank_reports {
                String::new()
            } else {
                format!("epoch {epoch}\nCar_3d/moderate: {score}\n")
            },
        })
    }
}

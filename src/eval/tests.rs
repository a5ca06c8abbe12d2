use std::fs;
use std::path::Path;
use std::time::SystemTime;

use super::params::ContainerFormat;
use super::*;
use crate::error::{CheckpointLoadError, EvaluateError};
use crate::queue::{CheckpointRef, EpochId};
use crate::testing::{RecordingService, config, local_context, write_checkpoint, zip_bytes};

fn checkpoint_ref(path: &Path, epoch: &str) -> CheckpointRef {
    CheckpointRef {
        path: path.to_path_buf(),
        epoch: EpochId::parse(epoch).expect("numeric epoch"),
        modified: SystemTime::UNIX_EPOCH,
    }
}

#[test]
fn load_params_fingerprints_complete_zip_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_checkpoint(dir.path(), "checkpoint_epoch_1.pth", 100);

    let mut model = LoadedCheckpoint::new();
    model.load_params(&path).expect("complete checkpoint loads");

    let state = model.state().expect("state after load");
    assert_eq!(state.format, ContainerFormat::ZipArchive);
    assert_eq!(state.size_bytes, fs::metadata(&path).expect("metadata").len());
    assert_eq!(state.sha256.len(), 64);
}

#[test]
fn load_params_accepts_legacy_pickle_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("checkpoint_epoch_2.pth");
    fs::write(&path, [0x80, 0x02, 0x8a, 0x0a, 0x6c, 0xfc]).expect("write pickle");

    let mut model = LoadedCheckpoint::new();
    model.load_params(&path).expect("pickle checkpoint loads");
    assert_eq!(
        model.state().map(|state| state.format),
        Some(ContainerFormat::PickleStream)
    );
}

#[test]
fn load_params_rejects_truncated_zip_and_clears_previous_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let good = write_checkpoint(dir.path(), "checkpoint_epoch_1.pth", 100);
    let truncated = dir.path().join("checkpoint_epoch_2.pth");
    let mut bytes = zip_bytes(b"weights");
    bytes.truncate(12);
    fs::write(&truncated, bytes).expect("write truncated");

    let mut model = LoadedCheckpoint::new();
    model.load_params(&good).expect("good checkpoint loads");
    let err = model
        .load_params(&truncated)
        .expect_err("truncated zip must fail");
    assert!(matches!(err, CheckpointLoadError::Truncated(_)));
    assert!(model.state().is_none());
}

#[test]
fn load_params_rejects_empty_unknown_and_missing_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let empty = dir.path().join("checkpoint_epoch_3.pth");
    fs::write(&empty, b"").expect("write empty");
    let garbage = dir.path().join("checkpoint_epoch_4.pth");
    fs::write(&garbage, b"not a checkpoint").expect("write garbage");

    let mut model = LoadedCheckpoint::new();
    assert!(matches!(
        model.load_params(&empty),
        Err(CheckpointLoadError::Truncated(_))
    ));
    assert!(matches!(
        model.load_params(&garbage),
        Err(CheckpointLoadError::UnrecognizedFormat { ref magic, .. }) if magic == "6e6f7420"
    ));
    assert!(matches!(
        model.load_params(&dir.path().join("checkpoint_epoch_5.pth")),
        Err(CheckpointLoadError::Read { .. })
    ));
}

#[test]
fn evaluator_loads_then_calls_service_with_epoch_scoped_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_checkpoint(&dir.path().join("ckpt"), "checkpoint_epoch_3.pth", 100);
    let ctx = local_context(&dir.path().join("out"));
    let config = config();
    let output_dir = dir.path().join("out/eval/epoch_3/val");

    let mut evaluator =
        CheckpointEvaluator::new(&ctx, &config, LoadedCheckpoint::new(), RecordingService::default());
    let result = evaluator
        .evaluate(&checkpoint_ref(&path, "3"), &output_dir)
        .expect("evaluation succeeds");

    assert_eq!(result.metrics["Car_3d/moderate"], 30.0);
    assert!(output_dir.is_dir());

    let (model, service) = evaluator.parts();
    assert_eq!(service.epochs(), vec!["3"]);
    assert_eq!(service.calls[0].output_dir, output_dir);
    assert!(!service.calls[0].distributed);
    assert_eq!(
        service.calls[0].checkpoint_sha256,
        model.state().expect("loaded").sha256
    );
}

#[test]
fn evaluator_never_calls_service_when_load_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("checkpoint_epoch_1.pth");
    fs::write(&path, b"\x00\x01\x02\x03garbage").expect("write corrupt");
    let ctx = local_context(dir.path());
    let config = config();

    let mut evaluator =
        CheckpointEvaluator::new(&ctx, &config, LoadedCheckpoint::new(), RecordingService::default());
    let err = evaluator
        .evaluate(&checkpoint_ref(&path, "1"), &dir.path().join("out"))
        .expect_err("corrupt checkpoint");

    assert!(matches!(err, EvaluateError::Load(_)));
    assert!(evaluator.parts().1.calls.is_empty());
}

#[test]
fn evaluator_wraps_service_failures_with_epoch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_checkpoint(dir.path(), "checkpoint_epoch_6.pth", 100);
    let ctx = local_context(dir.path());
    let config = config();
    let service = RecordingService {
        fail_epochs: vec!["6".to_string()],
        ..RecordingService::default()
    };

    let mut evaluator = CheckpointEvaluator::new(&ctx, &config, LoadedCheckpoint::new(), service);
    let err = evaluator
        .evaluate(&checkpoint_ref(&path, "6"), &dir.path().join("out"))
        .expect_err("service failure");
    assert_eq!(
        err.to_string(),
        "evaluation service failed for epoch 6: worker crashed on epoch 6"
    );
}

#[test]
fn marker_text_falls_back_to_metrics_when_report_is_blank() {
    let result = EvaluationResult {
        metrics: [("b".to_string(), 2.0), ("a".to_string(), 1.5)]
            .into_iter()
            .collect(),
        report_text: "  \n".to_string(),
    };
    assert_eq!(result.marker_text(), "a: 1.5\nb: 2\n");

    let empty = EvaluationResult::default();
    assert!(!empty.marker_text().is_empty());
}

#[cfg(unix)]
#[test]
fn command_service_round_trips_through_a_worker_process() {
    use crate::config::EvaluatorConfig;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_checkpoint(dir.path(), "checkpoint_epoch_2.pth", 100);
    let ctx = local_context(dir.path());
    let config = config();
    let worker = EvaluatorConfig {
        command: vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"cat > /dev/null; echo progress; echo '{"metrics": {"Car_3d/moderate": 71.25}, "report": "Car 71.25"}'"#
                .to_string(),
        ],
        env: Default::default(),
    };

    let mut evaluator = CheckpointEvaluator::new(
        &ctx,
        &config,
        LoadedCheckpoint::new(),
        CommandEvaluationService::from_config(&worker),
    );
    let result = evaluator
        .evaluate(&checkpoint_ref(&path, "2"), &dir.path().join("out"))
        .expect("worker succeeds");
    assert_eq!(result.metrics["Car_3d/moderate"], 71.25);
    assert_eq!(result.report_text, "Car 71.25");
}

#[cfg(unix)]
#[test]
fn command_service_reports_non_zero_exit() {
    use crate::config::EvaluatorConfig;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_checkpoint(dir.path(), "checkpoint_epoch_2.pth", 100);
    let ctx = local_context(dir.path());
    let config = config();
    let worker = EvaluatorConfig {
        command: vec!["sh".into(), "-c".into(), "cat > /dev/null; exit 3".into()],
        env: Default::default(),
    };

    let mut evaluator = CheckpointEvaluator::new(
        &ctx,
        &config,
        LoadedCheckpoint::new(),
        CommandEvaluationService::from_config(&worker),
    );
    let err = evaluator
        .evaluate(&checkpoint_ref(&path, "2"), &dir.path().join("out"))
        .expect_err("worker fails");
    assert!(matches!(err, EvaluateError::Service { .. }));
    assert!(err.to_string().contains("non-zero exit status"));
}

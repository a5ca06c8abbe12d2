use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointOutcome {
    AlreadyEvaluated,
    Evaluated,
    EvaluatedWithoutMetrics,
    EvaluatedUnrecorded,
    LoadFailed,
    EvaluationFailed,
    NotReached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointReport {
    pub checkpoint: String,
    pub epoch: String,
    pub outcome: CheckpointOutcome,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepCounts {
    pub found: usize,
    pub already_evaluated: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub unrecorded: usize,
    pub not_reached: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepPaths {
    pub checkpoint_dir: String,
    pub marker_dir: String,
    pub eval_output_dir: String,
    pub timeline_path: Option<String>,
    pub epoch_list_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub command: String,
    pub started_at: String,
    pub updated_at: String,
    pub mode: String,
    pub rank: usize,
    pub world_size: usize,
    pub test_split: String,
    pub cancelled: bool,
    pub paths: SweepPaths,
    pub counts: SweepCounts,
    pub checkpoints: Vec<CheckpointReport>,
}

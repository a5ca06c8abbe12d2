use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub target_dataset: Option<DatasetConfig>,

    #[serde(default = "default_batch_size_per_worker")]
    pub batch_size_per_worker: usize,

    pub evaluator: EvaluatorConfig,

    #[serde(default)]
    pub checkpoint: CheckpointNaming,

    #[serde(default)]
    pub model: ModelFlags,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub test_split: String,
    pub class_names: Vec<String>,
    #[serde(default)]
    pub data_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointNaming {
    pub marker_token: String,
    pub extension: String,
    pub companion_token: String,
}

impl Default for CheckpointNaming {
    fn default() -> Self {
        CheckpointNaming {
            marker_token: "checkpoint_epoch_".to_string(),
            extension: "pth".to_string(),
            companion_token: "optim".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelFlags {
    pub convert_dsnorm: bool,
}

fn default_batch_size_per_worker() -> usize {
    4
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl EvalConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EvalConfig =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (section, dataset) in std::iter::once(("dataset", &self.dataset))
            .chain(self.target_dataset.iter().map(|d| ("target_dataset", d)))
        {
            if dataset.test_split.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{section}.test_split must not be empty"
                )));
            }
            if dataset.class_names.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{section}.class_names must list at least one class"
                )));
            }
        }
        if self.batch_size_per_worker == 0 {
            return Err(ConfigError::Validation(
                "batch_size_per_worker must be > 0".into(),
            ));
        }
        if self
            .evaluator
            .command
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            return Err(ConfigError::Validation(
                "evaluator.command must name a program".into(),
            ));
        }
        if self.checkpoint.marker_token.is_empty() || self.checkpoint.extension.is_empty() {
            return Err(ConfigError::Validation(
                "checkpoint.marker_token and checkpoint.extension must not be empty".into(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn eval_dataset(&self) -> &DatasetConfig {
        self.target_dataset.as_ref().unwrap_or(&self.dataset)
    }

    pub fn test_split(&self) -> &str {
        &self.eval_dataset().test_split
    }
}

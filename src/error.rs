use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointLoadError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("checkpoint {0} is empty or truncated")]
    Truncated(PathBuf),

    #[error("checkpoint {path} has an unrecognized container format (magic {magic})")]
    UnrecognizedFormat { path: PathBuf, magic: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluateError {
    #[error(transparent)]
    Load(#[from] CheckpointLoadError),

    #[error("failed to prepare evaluation output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("evaluation service failed for epoch {epoch}: {message}")]
    Service { epoch: String, message: String },
}

#[derive(Debug, thiserror::Error)]
#[error("failed to write completion marker {path}: {source}")]
pub struct MarkerIoError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateRejection {
    #[error("no epoch token in filename {0}")]
    NoCandidateEpoch(String),

    #[error("optimizer-state companion file {0}")]
    Companion(String),

    #[error("non-numeric epoch token {token:?} in filename {filename}")]
    NonNumericEpoch { filename: String, token: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("config validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_rejection_display_names_the_file() {
        let err = CandidateRejection::Companion("checkpoint_epoch_7_optim.pth".to_string());
        assert_eq!(
            err.to_string(),
            "optimizer-state companion file checkpoint_epoch_7_optim.pth"
        );
    }

    #[test]
    fn evaluate_error_is_transparent_over_load_errors() {
        let err: EvaluateError =
            CheckpointLoadError::Truncated(PathBuf::from("ckpt/checkpoint_epoch_3.pth")).into();
        assert_eq!(
            err.to_string(),
            "checkpoint ckpt/checkpoint_epoch_3.pth is empty or truncated"
        );
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::Validation("dataset.test_split must not be empty".to_string());
        assert_eq!(
            err.to_string(),
            "config validation error: dataset.test_split must not be empty"
        );
    }
}

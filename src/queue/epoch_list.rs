use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::scanner::EpochId;

// Advisory only; never the sole reason to skip a checkpoint.
#[derive(Debug, Clone)]
pub struct EpochList {
    path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedEpochs {
    epochs: Vec<f64>,
}

impl RecordedEpochs {
    pub fn contains(&self, epoch: &EpochId) -> bool {
        self.epochs.iter().any(|value| *value == epoch.value())
    }

    pub fn values(&self) -> &[f64] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

impl EpochList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EpochList { path: path.into() }
    }

    pub fn for_split(eval_output_dir: &Path, split: &str) -> Self {
        Self::new(eval_output_dir.join(format!("eval_list_{split}.txt")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> RecordedEpochs {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return RecordedEpochs::default(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read epoch list");
                return RecordedEpochs::default();
            }
        };

        let mut epochs = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<f64>() {
                Ok(value) if value.is_finite() => epochs.push(value),
                _ => warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    value = line,
                    "ignoring unparsable epoch list entry"
                ),
            }
        }

        RecordedEpochs { epochs }
    }

    pub fn append(&self, epoch: &EpochId) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", epoch.label())
    }
}

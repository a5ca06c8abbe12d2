use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::CheckpointNaming;
use crate::error::CandidateRejection;

#[derive(Debug, Clone, PartialEq)]
pub struct EpochId {
    label: String,
    value: f64,
}

impl EpochId {
    pub fn parse(token: &str) -> Option<Self> {
        let value = token.trim().parse::<f64>().ok()?;
        if !value.is_finite() {
            return None;
        }
        Some(EpochId {
            label: token.trim().to_string(),
            value,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn whole(&self) -> f64 {
        self.value.trunc()
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointRef {
    pub path: PathBuf,
    pub epoch: EpochId,
    pub modified: SystemTime,
}

pub trait CheckpointSource {
    fn list(&self) -> Result<Vec<CheckpointRef>>;

    fn location(&self) -> &Path;
}

#[derive(Debug, Clone)]
pub struct CheckpointPattern {
    marker_token: String,
    extension: String,
    companion_token: String,
    epoch_regex: Regex,
}

impl CheckpointPattern {
    pub fn new(naming: &CheckpointNaming) -> Result<Self> {
        // Greedy prefix so the capture starts after the last marker token.
        let raw = format!(
            r"^.*{}(.*)\.{}$",
            regex::escape(&naming.marker_token),
            regex::escape(&naming.extension)
        );
        let epoch_regex = Regex::new(&raw).context("failed to compile checkpoint epoch regex")?;

        Ok(CheckpointPattern {
            marker_token: naming.marker_token.clone(),
            extension: naming.extension.clone(),
            companion_token: naming.companion_token.clone(),
            epoch_regex,
        })
    }

    pub fn matches_name(&self, filename: &str) -> bool {
        filename.contains(&self.marker_token)
            && filename
                .rsplit_once('.')
                .is_some_and(|(_, ext)| ext == self.extension)
    }

    pub fn parse_epoch(&self, filename: &str) -> Result<EpochId, CandidateRejection> {
        let token = self
            .epoch_regex
            .captures(filename)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| CandidateRejection::NoCandidateEpoch(filename.to_string()))?;

        if !self.companion_token.is_empty() && token.contains(&self.companion_token) {
            return Err(CandidateRejection::Companion(filename.to_string()));
        }

        EpochId::parse(token).ok_or_else(|| CandidateRejection::NonNumericEpoch {
            filename: filename.to_string(),
            token: token.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    dir: PathBuf,
    pattern: CheckpointPattern,
    start_epoch: u32,
}

impl DirectoryScanner {
    pub fn new(dir: impl Into<PathBuf>, pattern: CheckpointPattern) -> Self {
        DirectoryScanner {
            dir: dir.into(),
            pattern,
            start_epoch: 0,
        }
    }

    pub fn with_start_epoch(mut self, start_epoch: u32) -> Self {
        self.start_epoch = start_epoch;
        self
    }
}

impl CheckpointSource for DirectoryScanner {
    fn list(&self) -> Result<Vec<CheckpointRef>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.dir.display(), "checkpoint directory does not exist yet");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.dir.display()));
            }
        };

        let mut checkpoints = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("failed to read entry in {}", self.dir.display()))?;
            let path = entry.path();

            let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !self.pattern.matches_name(filename) {
                continue;
            }

            // Follows symlinks; a dangling link or a file removed mid-scan is skipped.
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "skipping vanished or dangling checkpoint");
                    continue;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to inspect {}", path.display()));
                }
            };
            if !metadata.is_file() {
                continue;
            }

            let epoch = match self.pattern.parse_epoch(filename) {
                Ok(epoch) => epoch,
                Err(rejection) => {
                    debug!(path = %path.display(), reason = %rejection, "skipping checkpoint candidate");
                    continue;
                }
            };

            if epoch.whole() < f64::from(self.start_epoch) {
                debug!(
                    path = %path.display(),
                    epoch = %epoch,
                    start_epoch = self.start_epoch,
                    "checkpoint below start epoch"
                );
                continue;
            }

            let modified = metadata
                .modified()
                .with_context(|| format!("failed to read mtime of {}", path.display()))?;

            checkpoints.push(CheckpointRef {
                path,
                epoch,
                modified,
            });
        }

        checkpoints.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(checkpoints)
    }

    fn location(&self) -> &Path {
        &self.dir
    }
}

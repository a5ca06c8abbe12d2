use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::context::ExecutionMode;
use crate::error::MarkerIoError;

// Only a non-empty marker proves a checkpoint was evaluated; a zero-byte one is pending.
#[derive(Debug, Clone)]
pub struct CompletionLedger {
    marker_dir: PathBuf,
}

impl CompletionLedger {
    pub fn for_checkpoint_dir(ckpt_dir: &Path, mode: ExecutionMode) -> Self {
        CompletionLedger {
            marker_dir: marker_root(ckpt_dir).join(mode.metric_subdir()),
        }
    }

    pub fn for_checkpoint(ckpt_path: &Path, mode: ExecutionMode) -> Self {
        let ckpt_dir = ckpt_path.parent().unwrap_or(Path::new(""));
        Self::for_checkpoint_dir(ckpt_dir, mode)
    }

    pub fn marker_dir(&self) -> &Path {
        &self.marker_dir
    }

    pub fn marker_path(&self, ckpt_path: &Path) -> PathBuf {
        let stem = ckpt_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.marker_dir.join(format!("{stem}.txt"))
    }

    pub fn is_complete(&self, ckpt_path: &Path) -> bool {
        fs::metadata(self.marker_path(ckpt_path))
            .map(|metadata| metadata.is_file() && metadata.len() > 0)
            .unwrap_or(false)
    }

    // Staged in a sibling temp file and renamed, so a crash never leaves a partial marker.
    pub fn record(&self, ckpt_path: &Path, report: &str) -> Result<PathBuf, MarkerIoError> {
        let marker_path = self.marker_path(ckpt_path);
        let staging_path = marker_path.with_extension("txt.tmp");
        let io_err = |source| MarkerIoError {
            path: marker_path.clone(),
            source,
        };

        fs::create_dir_all(&self.marker_dir).map_err(io_err)?;

        let write_staged = || -> std::io::Result<()> {
            let mut file = File::create(&staging_path)?;
            file.write_all(report.as_bytes())?;
            file.sync_all()
        };
        if let Err(source) = write_staged() {
            let _ = fs::remove_file(&staging_path);
            return Err(io_err(source));
        }

        fs::rename(&staging_path, &marker_path).map_err(io_err)?;
        Ok(marker_path)
    }
}

// An empty or `.` directory is the working directory, and its markers live
// beside it in `./`.
fn marker_root(ckpt_dir: &Path) -> PathBuf {
    match ckpt_dir.components().next_back() {
        None | Some(Component::CurDir) => PathBuf::from("."),
        Some(Component::Normal(_)) => match ckpt_dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
        Some(_) => ckpt_dir.join(".."),
    }
}

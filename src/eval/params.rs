use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::evaluator::ModelInstance;
use crate::error::CheckpointLoadError;
use crate::util::sha256_stream;

const ZIP_LOCAL_HEADER: &[u8; 4] = b"PK\x03\x04";
const ZIP_END_OF_DIRECTORY: &[u8; 4] = b"PK\x05\x06";
// End-of-central-directory record (22 bytes) plus the maximum comment length.
const ZIP_TAIL_WINDOW: u64 = 22 + 0xFFFF;
const PICKLE_PROTO: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    ZipArchive,
    PickleStream,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointState {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub format: ContainerFormat,
}

#[derive(Debug, Default)]
pub struct LoadedCheckpoint {
    state: Option<CheckpointState>,
}

impl LoadedCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Option<&CheckpointState> {
        self.state.as_ref()
    }
}

impl ModelInstance for LoadedCheckpoint {
    fn load_params(&mut self, path: &Path) -> Result<(), CheckpointLoadError> {
        self.state = None;
        self.state = Some(inspect_checkpoint(path)?);
        Ok(())
    }
}

fn inspect_checkpoint(path: &Path) -> Result<CheckpointState, CheckpointLoadError> {
    let read_err = |source: io::Error| CheckpointLoadError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_err)?;
    let size_bytes = file.metadata().map_err(read_err)?.len();
    if size_bytes < 4 {
        return Err(CheckpointLoadError::Truncated(path.to_path_buf()));
    }

    let mut magic = [0_u8; 4];
    file.read_exact(&mut magic).map_err(read_err)?;
    let format = if &magic == ZIP_LOCAL_HEADER {
        ContainerFormat::ZipArchive
    } else if magic[0] == PICKLE_PROTO && (2..=5).contains(&magic[1]) {
        ContainerFormat::PickleStream
    } else {
        return Err(CheckpointLoadError::UnrecognizedFormat {
            path: path.to_path_buf(),
            magic: magic.iter().map(|byte| format!("{byte:02x}")).collect(),
        });
    };

    if format == ContainerFormat::ZipArchive
        && !has_zip_trailer(&mut file, size_bytes).map_err(read_err)?
    {
        return Err(CheckpointLoadError::Truncated(path.to_path_buf()));
    }

    file.seek(SeekFrom::Start(0)).map_err(read_err)?;
    let (sha256, hashed) = sha256_stream(&mut file).map_err(read_err)?;
    if hashed != size_bytes {
        // Still being written by the training process.
        return Err(CheckpointLoadError::Truncated(path.to_path_buf()));
    }

    Ok(CheckpointState {
        path: path.to_path_buf(),
        size_bytes,
        sha256,
        format,
    })
}

fn has_zip_trailer(file: &mut File, size_bytes: u64) -> io::Result<bool> {
    let window = size_bytes.min(ZIP_TAIL_WINDOW);
    file.seek(SeekFrom::Start(size_bytes - window))?;
    let mut tail = Vec::with_capacity(window as usize);
    file.take(window).read_to_end(&mut tail)?;
    Ok(tail
        .windows(ZIP_END_OF_DIRECTORY.len())
        .any(|chunk| chunk == ZIP_END_OF_DIRECTORY))
}

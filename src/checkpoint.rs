/// Model checkpointing with safetensors
///
/// A checkpoint directory holds `*.safetensors` files and an optional
/// `checkpoint` pointer file naming the latest one:
///
/// ```text
/// checkpoints/
///   checkpoint                        {"model_checkpoint_path": "checkpoint_step_300.safetensors"}
///   checkpoint_step_100.safetensors
///   checkpoint_step_300.safetensors
/// ```
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use candle_core::DType;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};

use crate::models::ParameterRegistry;
use crate::{EvalError, Result};

/// Name of the pointer file inside a checkpoint directory
pub const POINTER_FILE: &str = "checkpoint";

const EXTENSION: &str = "safetensors";
const STEP_PREFIX: &str = "checkpoint_step_";

/// Contents of the pointer file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Path of the latest checkpoint, relative to the directory or absolute
    pub model_checkpoint_path: String,
}

/// Checkpoint metadata, stored in the safetensors header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// Training step
    pub step: Option<usize>,
    /// Loss at checkpoint
    pub loss: Option<f64>,
    /// Model name
    pub model: Option<String>,
}

impl CheckpointMetadata {
    fn to_header(&self) -> HashMap<String, String> {
        let mut header = HashMap::new();
        if let Some(step) = self.step {
            header.insert("step".to_string(), step.to_string());
        }
        if let Some(loss) = self.loss {
            header.insert("loss".to_string(), loss.to_string());
        }
        if let Some(model) = &self.model {
            header.insert("model".to_string(), model.clone());
        }
        header
    }

    fn from_header(header: &HashMap<String, String>) -> Self {
        Self {
            step: header.get("step").and_then(|s| s.parse().ok()),
            loss: header.get("loss").and_then(|s| s.parse().ok()),
            model: header.get("model").cloned(),
        }
    }
}

/// A checkpoint file found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub path: PathBuf,
}

impl Checkpoint {
    /// Find the latest checkpoint in `dir`
    ///
    /// Returns `None` when the directory does not exist or holds no
    /// checkpoint files.
    pub fn latest<P: AsRef<Path>>(dir: P) -> Result<Option<Self>> {
        Ok(latest_checkpoint(dir)?.map(|path| Self { path }))
    }

    /// Restore every parameter registered in `registry` from this file
    pub fn restore(&self, registry: &mut ParameterRegistry) -> Result<()> {
        registry.restore(&self.path)?;
        log::info!(
            "Restored {} parameters from {}",
            registry.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the metadata header
    pub fn metadata(&self) -> Result<CheckpointMetadata> {
        let buffer = fs::read(&self.path)?;
        let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
        Ok(metadata
            .metadata()
            .as_ref()
            .map(CheckpointMetadata::from_header)
            .unwrap_or_default())
    }

    /// Parameter names stored in the file, sorted
    pub fn tensor_names(&self) -> Result<Vec<String>> {
        let buffer = fs::read(&self.path)?;
        let tensors = SafeTensors::deserialize(&buffer)?;
        let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Path of the latest checkpoint in `dir`, if any
///
/// A pointer file naming an existing file wins. Otherwise the highest
/// `checkpoint_step_<N>` file is used, and failing that the most recently
/// modified `.safetensors` file.
pub fn latest_checkpoint<P: AsRef<Path>>(dir: P) -> Result<Option<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(None);
    }

    if let Some(path) = read_pointer(dir) {
        return Ok(Some(path));
    }

    let mut stepped: Vec<(usize, PathBuf)> = Vec::new();
    let mut others: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        match step_of(&path) {
            Some(step) => stepped.push((step, path)),
            None => {
                let modified = fs::metadata(&path)?.modified()?;
                others.push((modified, path));
            }
        }
    }

    if let Some((_, path)) = stepped.into_iter().max() {
        return Ok(Some(path));
    }
    Ok(others.into_iter().max().map(|(_, path)| path))
}

fn read_pointer(dir: &Path) -> Option<PathBuf> {
    let pointer = dir.join(POINTER_FILE);
    if !pointer.is_file() {
        return None;
    }

    let state: CheckpointState = match fs::read_to_string(&pointer)
        .map_err(EvalError::from)
        .and_then(|text| serde_json::from_str(&text).map_err(EvalError::from))
    {
        Ok(state) => state,
        Err(e) => {
            log::warn!("Ignoring unreadable pointer file {}: {}", pointer.display(), e);
            return None;
        }
    };

    let target = Path::new(&state.model_checkpoint_path);
    let target = if target.is_absolute() {
        target.to_path_buf()
    } else {
        dir.join(target)
    };

    if target.is_file() {
        Some(target)
    } else {
        log::warn!(
            "Pointer file names missing checkpoint {}, scanning directory",
            target.display()
        );
        None
    }
}

fn step_of(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix(STEP_PREFIX)?
        .parse()
        .ok()
}

/// Save every parameter in `registry` as `checkpoint_step_<step>.safetensors`
/// and point the pointer file at it
///
/// # Arguments
/// * `registry` - Parameters to save
/// * `dir` - Checkpoint directory, created if missing
/// * `metadata` - Header metadata; `step` defaults to 0 in the file name
///
/// # Returns
/// Path of the written file
pub fn save_checkpoint<P: AsRef<Path>>(
    registry: &ParameterRegistry,
    dir: P,
    metadata: &CheckpointMetadata,
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let file_name = format!("{}{}.{}", STEP_PREFIX, metadata.step.unwrap_or(0), EXTENSION);
    let path = dir.join(&file_name);

    // Extract tensors from the registry as little-endian f32 bytes
    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    for (name, tensor) in registry.tensors() {
        let shape = tensor.dims().to_vec();
        let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffers.push((name, shape, bytes));
    }

    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }

    safetensors::serialize_to_file(
        views.iter().map(|(name, view)| (*name, view)),
        &Some(metadata.to_header()),
        &path,
    )?;

    let state = CheckpointState {
        model_checkpoint_path: file_name,
    };
    fs::write(dir.join(POINTER_FILE), serde_json::to_string(&state)?)?;

    log::info!("Saved {} parameters to {}", buffers.len(), path.display());
    Ok(path)
}

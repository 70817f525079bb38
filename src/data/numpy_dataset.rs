/// NumPy dataset loader (.npy splits)
///
/// Layout of a dataset directory:
///
/// ```text
/// <root>/dataset.json
/// <root>/<split>/all__inputs.npy   f32 [N, D]
/// <root>/<split>/all__labels.npy   i64 [N]
/// ```
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use candle_core::{Device, Tensor};
use ndarray::{Array1, Array2};
use ndarray_npy::ReadNpyExt;
use serde::{Deserialize, Serialize};

use super::{batch_indices, Batch, Dataset};
use crate::config::InputType;
use crate::{EvalError, Result};

/// Metadata from dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetMetadata {
    pub num_classes: usize,
    #[serde(default)]
    pub description: String,
}

struct Split {
    inputs: Array2<f32>, // [N, D]
    labels: Array1<u32>, // [N]
}

/// Dataset loaded from NumPy .npy files, one directory per split
pub struct NumpyDataset {
    name: String,
    splits: HashMap<InputType, Split>,
    feature_dim: usize,
    metadata: DatasetMetadata,
}

fn read_npy<T: ReadNpyExt>(path: &Path) -> Result<T> {
    T::read_npy(File::open(path)?).map_err(|e| {
        EvalError::Dataset(format!("Failed to read {}: {}", path.display(), e))
    })
}

/// Convert stored labels, rejecting values that are not valid class ids
fn labels_from_i64(labels: &Array1<i64>, input_type: InputType) -> Result<Array1<u32>> {
    labels
        .iter()
        .map(|&l| {
            u32::try_from(l).map_err(|_| {
                EvalError::Dataset(format!("Invalid label {} in {} split", l, input_type))
            })
        })
        .collect::<Result<Vec<u32>>>()
        .map(Array1::from)
}

impl NumpyDataset {
    /// Load from a directory containing dataset.json and split subdirectories
    ///
    /// Missing split directories are allowed and report zero examples.
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading NumPy dataset from: {:?}", dir);

        let metadata_path = dir.join("dataset.json");
        if !metadata_path.exists() {
            return Err(EvalError::Dataset(format!(
                "dataset.json not found in {}",
                dir.display()
            )));
        }
        let reader = BufReader::new(File::open(&metadata_path)?);
        let metadata: DatasetMetadata = serde_json::from_reader(reader)?;

        let mut splits = HashMap::new();
        for input_type in InputType::ALL {
            let split_dir = dir.join(input_type.as_str());
            if !split_dir.is_dir() {
                log::warn!("{} split not found in {:?}", input_type, dir);
                continue;
            }

            let inputs: Array2<f32> = read_npy(&split_dir.join("all__inputs.npy"))?;
            // Python saves labels as i64
            let labels_i64: Array1<i64> = read_npy(&split_dir.join("all__labels.npy"))?;
            let labels = labels_from_i64(&labels_i64, input_type)?;

            log::info!(
                "Loaded {} split: inputs {:?}, labels {:?}",
                input_type,
                inputs.shape(),
                labels.shape()
            );
            splits.insert(input_type, Split { inputs, labels });
        }

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "numpy".to_string());

        Self::from_parts(name, splits, metadata)
    }

    /// Build from in-memory arrays, one (inputs, labels) pair per split
    pub fn from_arrays(
        name: &str,
        arrays: Vec<(InputType, Array2<f32>, Array1<u32>)>,
        num_classes: usize,
    ) -> Result<Self> {
        let splits = arrays
            .into_iter()
            .map(|(input_type, inputs, labels)| (input_type, Split { inputs, labels }))
            .collect();
        let metadata = DatasetMetadata {
            num_classes,
            description: String::new(),
        };
        Self::from_parts(name.to_string(), splits, metadata)
    }

    fn from_parts(
        name: String,
        splits: HashMap<InputType, Split>,
        metadata: DatasetMetadata,
    ) -> Result<Self> {
        let mut feature_dim = None;
        for (input_type, split) in &splits {
            // Validate shapes
            if split.inputs.nrows() != split.labels.len() {
                return Err(EvalError::Dataset(format!(
                    "Shape mismatch in {} split: {} inputs != {} labels",
                    input_type,
                    split.inputs.nrows(),
                    split.labels.len()
                )));
            }
            if let Some(&label) = split.labels.iter().find(|&&l| l as usize >= metadata.num_classes) {
                return Err(EvalError::Dataset(format!(
                    "Label {} out of range for {} classes in {} split",
                    label, metadata.num_classes, input_type
                )));
            }
            match feature_dim {
                None => feature_dim = Some(split.inputs.ncols()),
                Some(d) if d != split.inputs.ncols() => {
                    return Err(EvalError::Dataset(format!(
                        "Feature width {} of {} split differs from {}",
                        split.inputs.ncols(),
                        input_type,
                        d
                    )));
                }
                Some(_) => {}
            }
        }

        let feature_dim = feature_dim
            .ok_or_else(|| EvalError::Dataset(format!("Dataset {} has no splits", name)))?;

        log::info!(
            "Dataset {} loaded: feature_dim={}, num_classes={} {}",
            name,
            feature_dim,
            metadata.num_classes,
            metadata.description
        );

        Ok(Self {
            name,
            splits,
            feature_dim,
            metadata,
        })
    }

}

impl Dataset for NumpyDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_examples(&self, input_type: InputType) -> usize {
        self.splits
            .get(&input_type)
            .map(|s| s.labels.len())
            .unwrap_or(0)
    }

    fn num_classes(&self) -> usize {
        self.metadata.num_classes
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn read_batch(
        &self,
        input_type: InputType,
        batch_index: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<Batch> {
        let split = self.splits.get(&input_type).ok_or_else(|| {
            EvalError::Dataset(format!("{} has no {} split", self.name, input_type))
        })?;

        let indices = batch_indices(batch_index, batch_size, split.labels.len());
        if indices.is_empty() {
            return Err(EvalError::Dataset(format!(
                "{} split of {} is empty",
                input_type, self.name
            )));
        }

        let mut image_data = Vec::with_capacity(batch_size * self.feature_dim);
        let mut label_data = Vec::with_capacity(batch_size);
        for &idx in &indices {
            image_data.extend(split.inputs.row(idx).iter().copied());
            label_data.push(split.labels[idx]);
        }

        let images = Tensor::from_vec(image_data, (indices.len(), self.feature_dim), device)?;
        let labels = Tensor::from_vec(label_data, indices.len(), device)?;
        Ok(Batch { images, labels })
    }
}

/// Dataset collaborators and the background input pipeline
pub mod numpy_dataset;
pub mod pipeline;
pub mod synthetic;

pub use numpy_dataset::{DatasetMetadata, NumpyDataset};
pub use pipeline::{BatchQueue, Coordinator, InputPipeline};
pub use synthetic::SyntheticDataset;

use std::path::Path;

use candle_core::{Device, Tensor};

use crate::config::{EvalConfig, InputType};
use crate::Result;

/// One batch of examples as placed on the evaluation device
#[derive(Debug, Clone)]
pub struct Batch {
    /// Flattened examples: [batch, feature_dim], f32
    pub images: Tensor,
    /// Class labels: [batch], u32
    pub labels: Tensor,
}

/// Dataset contract used by the evaluators
///
/// Implementations must be shareable across producer threads.
pub trait Dataset: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Number of examples in a split
    fn num_examples(&self, input_type: InputType) -> usize;

    /// Number of label classes
    fn num_classes(&self) -> usize;

    /// Length of one flattened example
    fn feature_dim(&self) -> usize;

    /// Read batch number `batch_index` of a split
    ///
    /// Batches wrap around the end of the split, so every batch holds
    /// exactly `batch_size` examples. Producers read ahead of the loop, so
    /// implementations must accept any `batch_index`, including ones past
    /// the end of the split; an error here aborts the whole run.
    fn read_batch(
        &self,
        input_type: InputType,
        batch_index: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<Batch>;
}

/// Example indices covered by a batch, wrapping modulo `num_examples`
pub fn batch_indices(batch_index: usize, batch_size: usize, num_examples: usize) -> Vec<usize> {
    if num_examples == 0 {
        return Vec::new();
    }
    let start = batch_index * batch_size;
    (start..start + batch_size).map(|i| i % num_examples).collect()
}

/// Open a dataset by name
///
/// `synthetic` is built in; anything else is a directory of `.npy` splits
/// under `config.data_dir`.
pub fn open_dataset(name: &str, config: &EvalConfig) -> Result<Box<dyn Dataset>> {
    match name {
        "synthetic" => Ok(Box::new(SyntheticDataset::with_seed(config.seed)?)),
        other => {
            let dir = Path::new(&config.data_dir).join(other);
            Ok(Box::new(NumpyDataset::from_directory(dir)?))
        }
    }
}

/// Deterministic in-memory dataset
///
/// Each example is the one-hot code of its label plus bounded uniform
/// noise, so a linear model with identity weights classifies it exactly.
use candle_core::Device;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Batch, Dataset, NumpyDataset};
use crate::config::InputType;
use crate::{EvalError, Result};

/// Shape and size of a synthetic dataset
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub num_classes: usize,
    /// Must be >= num_classes
    pub feature_dim: usize,
    pub train_examples: usize,
    pub validation_examples: usize,
    pub test_examples: usize,
    /// Half-width of the uniform noise added to each feature, < 0.5
    pub noise: f32,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_classes: 4,
            feature_dim: 8,
            train_examples: 1000,
            validation_examples: 450,
            test_examples: 500,
            noise: 0.1,
            seed: 0,
        }
    }
}

pub struct SyntheticDataset {
    inner: NumpyDataset,
}

impl SyntheticDataset {
    /// Default shape with the given seed
    pub fn with_seed(seed: u64) -> Result<Self> {
        Self::new(SyntheticConfig {
            seed,
            ..SyntheticConfig::default()
        })
    }

    pub fn new(config: SyntheticConfig) -> Result<Self> {
        if config.num_classes == 0 || config.feature_dim < config.num_classes {
            return Err(EvalError::Config(format!(
                "synthetic dataset needs 0 < num_classes <= feature_dim, got {} and {}",
                config.num_classes, config.feature_dim
            )));
        }
        if !(0.0..0.5).contains(&config.noise) {
            return Err(EvalError::Config(format!(
                "synthetic noise must be in [0, 0.5), got {}",
                config.noise
            )));
        }
        Self::generate(&config)
    }

    fn generate(config: &SyntheticConfig) -> Result<Self> {
        let sizes = [
            (InputType::Train, config.train_examples),
            (InputType::Validation, config.validation_examples),
            (InputType::Test, config.test_examples),
        ];

        let arrays = sizes
            .iter()
            .enumerate()
            .map(|(offset, &(input_type, n))| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(offset as u64));
                let labels: Array1<u32> =
                    Array1::from_shape_fn(n, |_| rng.gen_range(0..config.num_classes) as u32);
                let mut inputs = Array2::<f32>::zeros((n, config.feature_dim));
                for (i, mut row) in inputs.rows_mut().into_iter().enumerate() {
                    for v in row.iter_mut() {
                        if config.noise > 0.0 {
                            *v = rng.gen_range(-config.noise..config.noise);
                        }
                    }
                    row[labels[i] as usize] += 1.0;
                }
                (input_type, inputs, labels)
            })
            .collect();

        let inner = NumpyDataset::from_arrays("synthetic", arrays, config.num_classes)?;
        Ok(Self { inner })
    }
}

impl Dataset for SyntheticDataset {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn num_examples(&self, input_type: InputType) -> usize {
        self.inner.num_examples(input_type)
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn feature_dim(&self) -> usize {
        self.inner.feature_dim()
    }

    fn read_batch(
        &self,
        input_type: InputType,
        batch_index: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<Batch> {
        self.inner.read_batch(input_type, batch_index, batch_size, device)
    }
}

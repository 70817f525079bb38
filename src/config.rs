/// Configuration for an evaluation run
///
/// Mirrors the command line: every flag has a field here, so a run can be
/// described by a JSON file and overridden from the CLI.
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::eval::EvalOptions;
use crate::{EvalError, Result};

/// Dataset split read by a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Train,
    Validation,
    Test,
}

impl InputType {
    /// All splits, in on-disk order
    pub const ALL: [InputType; 3] = [InputType::Train, InputType::Validation, InputType::Test];

    /// Split selected by the `--test` flag
    pub fn from_test_flag(test: bool) -> Self {
        if test {
            InputType::Test
        } else {
            InputType::Validation
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Train => "train",
            InputType::Validation => "validation",
            InputType::Test => "test",
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InputType {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(InputType::Train),
            "validation" => Ok(InputType::Validation),
            "test" => Ok(InputType::Test),
            other => Err(EvalError::Config(format!(
                "Invalid input type: {}. Must be 'train', 'validation', or 'test'",
                other
            ))),
        }
    }
}

/// Configuration for one evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Model name, looked up in `models::by_name`
    pub model: String,

    /// Dataset name: `synthetic` or a directory under `data_dir`
    pub dataset: String,

    /// Root directory for on-disk datasets
    pub data_dir: String,

    /// Directory holding the saved checkpoints
    pub checkpoint_dir: String,

    /// Evaluate on the test split instead of validation
    pub test: bool,

    /// Placement device: "cpu", "gpu:N", "cuda:N"
    pub eval_device: String,

    /// Examples per evaluation batch
    pub batch_size: usize,

    /// Background input producer threads
    pub num_threads: usize,

    /// Batches buffered between producers and the evaluation loop
    pub queue_capacity: usize,

    /// L2 penalty passed to autoencoders (has no effect in eval phase)
    pub l2_penalty: f64,

    /// Seed for the synthetic dataset
    pub seed: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            model: "mlp".to_string(),
            dataset: "synthetic".to_string(),
            data_dir: "data".to_string(),
            checkpoint_dir: "checkpoints".to_string(),
            test: false,
            eval_device: "gpu:0".to_string(),
            batch_size: 200,
            num_threads: 2,
            queue_capacity: 8,
            l2_penalty: 0.0,
            seed: 0,
        }
    }
}

impl EvalConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EvalConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(EvalError::Config("model name must not be empty".to_string()));
        }

        if self.dataset.is_empty() {
            return Err(EvalError::Config("dataset name must not be empty".to_string()));
        }

        if self.batch_size == 0 {
            return Err(EvalError::Config("batch_size must be > 0".to_string()));
        }

        if self.num_threads == 0 || self.queue_capacity == 0 {
            return Err(EvalError::Config(
                "num_threads and queue_capacity must be > 0".to_string(),
            ));
        }

        if self.l2_penalty < 0.0 {
            return Err(EvalError::Config("l2_penalty must be >= 0".to_string()));
        }

        Ok(())
    }

    /// Split selected by this configuration
    pub fn input_type(&self) -> InputType {
        InputType::from_test_flag(self.test)
    }

    /// Resolve the placement device and build the evaluation loop options
    pub fn eval_options(&self) -> Result<EvalOptions> {
        self.validate()?;
        Ok(EvalOptions {
            batch_size: self.batch_size,
            device: resolve_device(&self.eval_device)?,
            num_threads: self.num_threads,
            queue_capacity: self.queue_capacity,
        })
    }
}

/// Parse a device string and place on it, falling back to CPU when the
/// requested accelerator is not available
pub fn resolve_device(spec: &str) -> Result<Device> {
    let spec = spec.trim().trim_start_matches('/').to_ascii_lowercase();
    let (kind, ordinal) = match spec.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal.parse::<usize>().map_err(|_| {
                EvalError::Config(format!("Invalid device ordinal in '{}'", spec))
            })?;
            (kind.to_string(), ordinal)
        }
        None => (spec.clone(), 0),
    };

    match kind.as_str() {
        "cpu" => Ok(Device::Cpu),
        "gpu" | "cuda" => {
            if candle_core::utils::cuda_is_available() {
                Ok(Device::new_cuda(ordinal)?)
            } else {
                log::warn!("{} requested but CUDA is not available, using CPU", spec);
                Ok(Device::Cpu)
            }
        }
        _ => Err(EvalError::Config(format!(
            "Invalid device: {}. Must be 'cpu', 'gpu:N', or 'cuda:N'",
            spec
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization_fills_defaults() {
        let json = r#"{
            "model": "autoencoder",
            "checkpoint_dir": "runs/ae",
            "test": true
        }"#;

        let config: EvalConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model, "autoencoder");
        assert_eq!(config.checkpoint_dir, "runs/ae");
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.input_type(), InputType::Test);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = EvalConfig {
            batch_size: 0,
            ..EvalConfig::default()
        };
        assert!(matches!(config.validate(), Err(EvalError::Config(_))));
    }

    #[test]
    fn test_input_type_parsing() {
        assert_eq!("test".parse::<InputType>().unwrap(), InputType::Test);
        assert_eq!(InputType::Validation.to_string(), "validation");
        assert!("holdout".parse::<InputType>().is_err());
        assert_eq!(InputType::from_test_flag(false), InputType::Validation);
    }

    #[test]
    fn test_resolve_device() {
        assert!(resolve_device("cpu").unwrap().is_cpu());
        assert!(resolve_device("/cpu:0").unwrap().is_cpu());
        assert!(resolve_device("tpu:0").is_err());
        assert!(resolve_device("gpu:x").is_err());
        // Soft placement: always succeeds, on CPU when no CUDA is present
        assert!(resolve_device("/gpu:0").is_ok());
    }
}

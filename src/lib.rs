//! Checkpoint evaluation for candle models
//!
//! Restores the latest saved checkpoint from a directory into a freshly
//! assembled model and measures it on one dataset split.
//!
//! # Metrics
//!
//! - **Accuracy** for classifiers: top-1 hits over `iterations * batch_size`
//! - **Reconstruction error** for autoencoders: mean per-batch loss
//!
//! Input batches are produced by a small pool of background threads that
//! feed a bounded queue; the evaluation loop always joins them before it
//! returns.
//!
//! # Example
//!
//! ```ignore
//! use ckpt_eval::{EvalConfig, Evaluator, InputType};
//!
//! let config = EvalConfig::default();
//! let dataset = ckpt_eval::data::open_dataset("synthetic", &config)?;
//! let model = ckpt_eval::models::by_name("mlp")?;
//! let mut evaluator = Evaluator::new(dataset.as_ref(), config.eval_options()?);
//! let outcome = evaluator.evaluate(&model, "checkpoints", InputType::Validation)?;
//! ```

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod eval;
pub mod layers;
pub mod models;

// Re-export commonly used items
pub use config::{EvalConfig, InputType};
pub use eval::{EvalOptions, EvalOutcome, Evaluator, Metric};
pub use models::{ModelHandle, Phase};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Input pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EvalError>;

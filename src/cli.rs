/// Command line interface for the `evaluate` binary
///
/// Flags override the optional `--config` JSON file; without one,
/// `--model`, `--dataset` and `--checkpoint_dir` are required.
use std::path::PathBuf;

use chrono::Local;
use clap::Parser;

use crate::config::EvalConfig;
use crate::eval::{report_line, EvalOutcome, Evaluator, Metric};
use crate::{data, models, EvalError, Result};

#[derive(Parser, Debug)]
#[command(name = "evaluate", version, about = "Evaluate the model")]
pub struct Cli {
    /// Model to evaluate: mlp, linear, autoencoder
    #[arg(long)]
    pub model: Option<String>,

    /// Dataset name: synthetic, or a directory under --data_dir
    #[arg(long)]
    pub dataset: Option<String>,

    /// Directory holding the saved checkpoints
    #[arg(long = "checkpoint_dir")]
    pub checkpoint_dir: Option<String>,

    /// Evaluate on the test split instead of validation
    #[arg(long)]
    pub test: bool,

    /// Device to run on: cpu, gpu:N, cuda:N
    #[arg(long = "eval_device")]
    pub eval_device: Option<String>,

    /// Root directory of on-disk datasets
    #[arg(long = "data_dir")]
    pub data_dir: Option<String>,

    /// Examples per evaluation batch
    #[arg(long = "batch_size")]
    pub batch_size: Option<usize>,

    /// Background input producer threads
    #[arg(long = "num_threads")]
    pub num_threads: Option<usize>,

    /// Seed for the synthetic dataset
    #[arg(long)]
    pub seed: Option<u64>,

    /// JSON file with an EvalConfig
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn required(value: Option<&str>, flag: &str, from_file: bool, current: &mut String) -> Result<()> {
    match value {
        Some(v) => *current = v.to_string(),
        None if !from_file => {
            return Err(EvalError::Config(format!("--{} is required", flag)));
        }
        None => {}
    }
    Ok(())
}

impl Cli {
    /// Merge the config file (if any) with the flags
    pub fn to_config(&self) -> Result<EvalConfig> {
        let from_file = self.config.is_some();
        let mut config = match &self.config {
            Some(path) => EvalConfig::from_file(path)?,
            None => EvalConfig::default(),
        };

        required(self.model.as_deref(), "model", from_file, &mut config.model)?;
        required(self.dataset.as_deref(), "dataset", from_file, &mut config.dataset)?;
        required(self.checkpoint_dir.as_deref(), "checkpoint_dir", from_file, &mut config.checkpoint_dir)?;

        config.test |= self.test;
        if let Some(device) = &self.eval_device {
            config.eval_device = device.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(num_threads) = self.num_threads {
            config.num_threads = num_threads;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        config.validate()?;
        Ok(config)
    }

    /// Run one evaluation and print the result line
    ///
    /// A missing checkpoint prints a notice and yields `None`; an aborted
    /// run is an error.
    pub fn run(&self) -> Result<Option<Metric>> {
        let config = self.to_config()?;
        let options = config.eval_options()?;
        let input_type = config.input_type();

        let dataset = data::open_dataset(&config.dataset, &config)?;
        let model = models::by_name(&config.model)?;
        log::info!(
            "Evaluating {} {} on {} split of {} ({:?})",
            model.kind(),
            model.name(),
            input_type,
            dataset.name(),
            options.device
        );

        let mut evaluator =
            Evaluator::new(dataset.as_ref(), options).with_l2_penalty(config.l2_penalty);
        match evaluator.evaluate(&model, &config.checkpoint_dir, input_type)? {
            EvalOutcome::Finished(metric) => {
                let now = Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
                println!("{}", report_line(now, input_type, metric));
                Ok(Some(metric))
            }
            EvalOutcome::MissingCheckpoint { .. } => {
                println!("[!] No checkpoint file found");
                Ok(None)
            }
            EvalOutcome::Aborted {
                steps_completed,
                cause,
            } => Err(EvalError::Pipeline(format!(
                "evaluation aborted after {} batches: {}",
                steps_completed, cause
            ))),
        }
    }
}
